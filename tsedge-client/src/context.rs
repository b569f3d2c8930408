//! State shared by the connection controller and both
//! reliability managers ([`LinkCtx`]).
//!
//! One `LinkCtx` exists per [`EdgeConnection`](crate::EdgeConnection). It
//! carries the configuration, the live transport connection (if any), the
//! closing guard the managers consult before binding a reopened channel, and
//! the runtime handle used to run async work triggered from transport
//! callback threads.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

// ---

use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::watch;

// ---

use tsedge_domain::{
    // ---
    ConnectionEvents,
    ConnectionPtr,
    ConnectionState,
    TsEdgeError,
};

// ---

use super::{ByteSamplerPtr, ConnectionConfig, ConnectionHandlerPtr};

// ---------------------------------------------------------------------------
// LinkCtx
// ---------------------------------------------------------------------------

pub(crate) struct LinkCtx {
    // ---
    pub config: ConnectionConfig,

    /// Resolved at connect: configured node id or the token source's client id.
    pub node_id: RwLock<Option<String>>,

    /// Live transport connection. `None` while disconnected or closing.
    connection: Mutex<Option<ConnectionPtr>>,

    closing: AtomicBool,

    /// Captured at connect; used to spawn reopens from callback threads.
    runtime: Mutex<Option<Handle>>,

    handler: RwLock<Option<ConnectionHandlerPtr>>,
    state_tx: watch::Sender<ConnectionState>,

    pub upstream_sampler: RwLock<Option<ByteSamplerPtr>>,
    pub downstream_sampler: RwLock<Option<ByteSamplerPtr>>,
}

// ---

impl LinkCtx {
    // ---
    pub fn new(config: ConnectionConfig) -> Self {
        // ---
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            node_id: RwLock::new(config.node_id.clone()),
            config,
            connection: Mutex::new(None),
            closing: AtomicBool::new(false),
            runtime: Mutex::new(None),
            handler: RwLock::new(None),
            state_tx,
            upstream_sampler: RwLock::new(None),
            downstream_sampler: RwLock::new(None),
        }
    }

    // ---

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn node_id(&self) -> Option<String> {
        self.node_id.read().clone()
    }

    // --- connection ----------------------------------------------------------

    pub fn connection(&self) -> Option<ConnectionPtr> {
        self.connection.lock().clone()
    }

    pub fn set_connection(&self, conn: ConnectionPtr) {
        *self.connection.lock() = Some(conn);
    }

    pub fn take_connection(&self) -> Option<ConnectionPtr> {
        self.connection.lock().take()
    }

    /// `true` while `conn` is still the held connection and no close has begun.
    ///
    /// Work that awaited the transport checks this before binding, since a
    /// close may have run to completion in the meantime.
    pub fn is_live(&self, conn: &ConnectionPtr) -> bool {
        // ---
        if self.is_closing() {
            return false;
        }
        self.connection
            .lock()
            .as_ref()
            .is_some_and(|held| Arc::ptr_eq(held, conn))
    }

    // --- closing guard -------------------------------------------------------

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Claim the close. Returns `false` if another close already holds it.
    pub fn begin_closing(&self) -> bool {
        self.closing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn end_closing(&self) {
        self.closing.store(false, Ordering::Release);
    }

    // --- state ---------------------------------------------------------------

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn state_rx(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn set_state(&self, state: ConnectionState) {
        // ---
        let prev = self.state_tx.send_replace(state);
        if prev != state {
            tracing::info!(conn = %self.name(), "state {prev:?} -> {state:?}");
        }
    }

    /// Move `from` -> `to` atomically. Returns `false` if the state was not `from`.
    pub fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        // ---
        let moved = self.state_tx.send_if_modified(|s| {
            if *s == from {
                *s = to;
                true
            } else {
                false
            }
        });
        if moved {
            tracing::info!(conn = %self.name(), "state {from:?} -> {to:?}");
        }
        moved
    }

    // --- handler -------------------------------------------------------------

    pub fn handler(&self) -> Option<ConnectionHandlerPtr> {
        self.handler.read().clone()
    }

    pub fn set_handler(&self, handler: Option<ConnectionHandlerPtr>) {
        *self.handler.write() = handler;
    }

    /// Forward a non-fatal failure to the handler.
    pub fn report_error(&self, error: &TsEdgeError) {
        if let Some(h) = self.handler() {
            h.on_error(error);
        }
    }

    // --- runtime -------------------------------------------------------------

    pub fn capture_runtime(&self) {
        // ---
        let mut rt = self.runtime.lock();
        if rt.is_none() {
            *rt = Handle::try_current().ok();
        }
    }

    /// Run `fut` on the connection's runtime. Safe to call from any thread.
    pub fn spawn<F>(&self, what: &'static str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // ---
        let rt = self.runtime.lock().clone();
        match rt {
            Some(rt) => {
                rt.spawn(fut);
            }
            None => {
                tracing::warn!(conn = %self.name(), "no runtime captured; dropping {what}");
            }
        }
    }

    // ---

    pub fn add_sent_bytes(&self, n: usize) {
        if let Some(s) = self.upstream_sampler.read().as_ref() {
            s.add_bytes(n as u64);
        }
    }

    pub fn add_received_bytes(&self, n: usize) {
        if let Some(s) = self.downstream_sampler.read().as_ref() {
            s.add_bytes(n as u64);
        }
    }
}

// ---------------------------------------------------------------------------
// ConnectionEventSink
// ---------------------------------------------------------------------------

/// Transport connection events, forwarded to the [`ConnectionHandler`](crate::ConnectionHandler).
///
/// Holds the context weakly; the transport owns the sink for as long as the
/// connection lives.
pub(crate) struct ConnectionEventSink {
    // ---
    ctx: Weak<LinkCtx>,
}

// ---

impl ConnectionEventSink {
    // ---
    pub fn new(ctx: &Arc<LinkCtx>) -> Arc<Self> {
        Arc::new(Self {
            ctx: Arc::downgrade(ctx),
        })
    }
}

// ---

impl ConnectionEvents for ConnectionEventSink {
    // ---
    fn on_disconnect(&self) {
        // ---
        let Some(ctx) = self.ctx.upgrade() else {
            return;
        };
        tracing::warn!(conn = %ctx.name(), "transport disconnected; resuming");
        if let Some(h) = ctx.handler() {
            h.on_disconnect();
        }
    }

    fn on_reconnect(&self) {
        // ---
        let Some(ctx) = self.ctx.upgrade() else {
            return;
        };
        tracing::info!(conn = %ctx.name(), "transport reconnected");
        if let Some(h) = ctx.handler() {
            h.on_reconnect();
        }
    }

    fn on_fail_with_error(&self, error: &TsEdgeError) {
        // ---
        let Some(ctx) = self.ctx.upgrade() else {
            return;
        };
        tracing::warn!(conn = %ctx.name(), "transport error: {error}");
        ctx.report_error(error);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn closing_guard_is_single_flight() {
        // ---
        let ctx = LinkCtx::new(ConnectionConfig::new("h"));
        assert!(ctx.begin_closing());
        assert!(!ctx.begin_closing(), "second claim must fail");
        assert!(ctx.is_closing());

        ctx.end_closing();
        assert!(ctx.begin_closing(), "guard must be reusable after reset");
    }

    #[test]
    fn transition_only_from_expected_state() {
        // ---
        let ctx = LinkCtx::new(ConnectionConfig::new("h"));
        let rx = ctx.state_rx();

        assert!(ctx.transition(ConnectionState::Disconnected, ConnectionState::Connecting));
        assert!(!ctx.transition(ConnectionState::Disconnected, ConnectionState::Connecting));
        assert_eq!(*rx.borrow(), ConnectionState::Connecting);
    }

    #[test]
    fn spawn_without_runtime_is_dropped() {
        // ---
        let ctx = LinkCtx::new(ConnectionConfig::new("h"));
        ctx.spawn("test", async {});
    }
}
