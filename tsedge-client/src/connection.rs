//! Connection lifecycle controller, [`EdgeConnection`].
//!
//! One `EdgeConnection` owns one physical transport connection and every
//! channel registration made through it. It is an explicit context object:
//! construct it, register channels, `connect`, send, `close` (or `shutdown`).
//! Registrations survive close and are reopened by the next `connect`.
//!
//! # Lifecycle
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──ok──▶ Connected ──close──▶ Closing ──▶ Disconnected
//!                               │
//!                               └──err──▶ Disconnected (on_connect_failed)
//! ```
//!
//! # Close sequence
//!
//! 1. Claim the closing guard (a concurrent close returns [`CloseOutcome::InProgress`])
//! 2. Unbind every registration so writers fail fast with `NotOpen`
//! 3. Close each open upstream channel in turn; the last one also closes the session
//! 4. Close downstream channels and the transport connection
//! 5. Reconcile the measurement session
//! 6. Release the guard, whatever happened above

use std::sync::Arc;

// ---

use tokio::sync::watch;

// ---

use tsedge_domain::{
    // ---
    ConnectParams,
    ConnectionPtr,
    ConnectionState,
    ConnectorPtr,
    DataId,
    DownstreamFilter,
    Endpoint,
    FlushPolicy,
    MeasurementServicePtr,
    Result,
    TokenSourcePtr,
    TsEdgeError,
};

// ---

use super::context::{ConnectionEventSink, LinkCtx};
use super::downstream::{DownstreamHandle, DownstreamManager};
use super::reconcile::{ReconcileOutcome, SessionReconciler};
use super::upstream::{UpstreamHandle, UpstreamManager};
use super::{
    // ---
    ByteSamplerPtr,
    ConnectionConfig,
    ConnectionHandlerPtr,
    DownstreamHandlerPtr,
    UpstreamHandlerPtr,
};

// ---------------------------------------------------------------------------
// CloseOutcome
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum CloseOutcome {
    // ---
    /// There was no live connection to close.
    NotConnected,

    /// Another close is already running; this call did nothing.
    InProgress,

    /// Teardown ran; carries the session reconciliation result.
    Closed(ReconcileOutcome),
}

// ---------------------------------------------------------------------------
// ClosingGuard
// ---------------------------------------------------------------------------

/// Releases the closing claim on every exit path of `close`.
struct ClosingGuard<'a>(&'a LinkCtx);

impl Drop for ClosingGuard<'_> {
    fn drop(&mut self) {
        self.0.end_closing();
    }
}

// ---------------------------------------------------------------------------
// EdgeConnection
// ---------------------------------------------------------------------------

pub struct EdgeConnection {
    // ---
    ctx: Arc<LinkCtx>,
    connector: ConnectorPtr,
    token_source: TokenSourcePtr,
    measurements: MeasurementServicePtr,
    upstream: Arc<UpstreamManager>,
    downstream: Arc<DownstreamManager>,
}

// ---

impl EdgeConnection {
    // ---
    pub fn new(
        config: ConnectionConfig,
        connector: ConnectorPtr,
        token_source: TokenSourcePtr,
        measurements: MeasurementServicePtr,
    ) -> Self {
        // ---
        let ctx = Arc::new(LinkCtx::new(config));
        Self {
            upstream: UpstreamManager::new(ctx.clone(), measurements.clone()),
            downstream: DownstreamManager::new(ctx.clone()),
            ctx,
            connector,
            token_source,
            measurements,
        }
    }

    // --- configuration -------------------------------------------------------

    pub fn name(&self) -> &str {
        self.ctx.name()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.ctx.config
    }

    pub fn set_handler(&self, handler: ConnectionHandlerPtr) {
        self.ctx.set_handler(Some(handler));
    }

    pub fn set_upstream_sampler(&self, sampler: ByteSamplerPtr) {
        *self.ctx.upstream_sampler.write() = Some(sampler);
    }

    pub fn set_downstream_sampler(&self, sampler: ByteSamplerPtr) {
        *self.ctx.downstream_sampler.write() = Some(sampler);
    }

    // --- observation ---------------------------------------------------------

    pub fn state(&self) -> ConnectionState {
        self.ctx.state()
    }

    pub fn state_rx(&self) -> watch::Receiver<ConnectionState> {
        self.ctx.state_rx()
    }

    /// `(generated, received)` chunk counts of the current upstream batch.
    pub fn counters(&self) -> (u64, u64) {
        self.upstream.counters()
    }

    /// Groups held for replay after a failed write.
    pub fn retry_buffer_len(&self) -> usize {
        self.upstream.retry_buffer_len()
    }

    /// Id of the current measurement session, if one is open.
    pub fn session_id(&self) -> Option<String> {
        self.upstream.session_id()
    }

    // --- registry ------------------------------------------------------------

    /// Register an upstream channel. Usable before connect.
    pub fn register_upstream(
        &self,
        persist: bool,
        flush_policy: FlushPolicy,
        handler: Option<UpstreamHandlerPtr>,
    ) -> UpstreamHandle {
        // ---
        let id = self.upstream.register(persist, flush_policy, handler);
        UpstreamHandle::new(id, self.upstream.clone())
    }

    /// Register a downstream subscription to `data_filter` from `source_node_id`.
    pub fn register_downstream(
        &self,
        source_node_id: impl Into<String>,
        data_filter: DataId,
        handler: DownstreamHandlerPtr,
    ) -> DownstreamHandle {
        // ---
        let filter = DownstreamFilter::new(source_node_id, data_filter);
        let id = self.downstream.register(filter, handler);
        DownstreamHandle::new(id, self.downstream.clone())
    }

    /// Remove the registration. Its channel is not closed here.
    pub fn unregister_upstream(&self, handle: &UpstreamHandle) -> Result<()> {
        self.upstream.unregister(handle.id())
    }

    pub fn unregister_downstream(&self, handle: &DownstreamHandle) -> Result<()> {
        self.downstream.unregister(handle.id())
    }

    // --- connect -------------------------------------------------------------

    /// Connect and open every registered channel.
    ///
    /// No-op unless disconnected. Channel open failures do not fail the
    /// connect; they are logged and reported through
    /// [`ConnectionHandler::on_error`](crate::ConnectionHandler::on_error).
    pub async fn connect(&self) -> Result<()> {
        // ---
        if !self
            .ctx
            .transition(ConnectionState::Disconnected, ConnectionState::Connecting)
        {
            tracing::debug!(conn = %self.name(), state = ?self.state(), "connect ignored");
            return Ok(());
        }
        self.ctx.capture_runtime();

        let conn = match self.establish().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::error!(conn = %self.name(), "connect failed: {e}");
                self.ctx.set_state(ConnectionState::Disconnected);
                if let Some(h) = self.ctx.handler() {
                    h.on_connect_failed(&e);
                }
                return Err(e);
            }
        };

        self.ctx.set_connection(conn);
        self.ctx.set_state(ConnectionState::Connected);
        if let Some(h) = self.ctx.handler() {
            h.on_connect();
        }

        let (up, down) = tokio::join!(self.upstream.open(), self.downstream.open());
        for (direction, result) in [("upstream", up), ("downstream", down)] {
            if let Err(e) = result {
                tracing::warn!(conn = %self.name(), "{direction} open failed: {e}");
                self.ctx.report_error(&e);
            }
        }
        Ok(())
    }

    // ---

    async fn establish(&self) -> Result<ConnectionPtr> {
        // ---
        let config = &self.ctx.config;
        config.validate()?;
        let endpoint = Endpoint::parse(&config.server_url)?;

        let node_id = config
            .node_id
            .clone()
            .or_else(|| self.token_source.client_id());
        if node_id.is_none() {
            tracing::warn!(conn = %self.name(), "no node id; upstream channels cannot open");
        }
        *self.ctx.node_id.write() = node_id.clone();

        tracing::info!(conn = %self.name(), %endpoint, "connecting");

        let params = ConnectParams {
            endpoint,
            node_id: node_id.unwrap_or_default(),
            project_id: config.project_id.clone(),
            token_source: self.token_source.clone(),
            connect_timeout: Some(config.connect_timeout),
            ping_interval: config.connect_timeout,
            ping_timeout: config.connect_timeout,
            events: ConnectionEventSink::new(&self.ctx),
        };

        self.connector
            .connect(params)
            .await
            .map_err(|e| match e {
                TsEdgeError::ConnectFailed(_) => e,
                other => TsEdgeError::ConnectFailed(other.to_string()),
            })
    }

    // --- open ----------------------------------------------------------------

    /// Open channels for upstream registrations added since connect.
    pub async fn open_upstream(&self) -> Result<usize> {
        self.upstream.open().await
    }

    /// Open channels for downstream registrations added since connect.
    pub async fn open_downstream(&self) -> Result<usize> {
        self.downstream.open().await
    }

    // --- close ---------------------------------------------------------------

    /// Tear the connection down and reconcile the measurement session.
    ///
    /// Single-flight: a concurrent call returns [`CloseOutcome::InProgress`].
    pub async fn close(&self) -> CloseOutcome {
        // ---
        if !self.ctx.begin_closing() {
            tracing::debug!(conn = %self.name(), "close already in progress");
            return CloseOutcome::InProgress;
        }
        let _guard = ClosingGuard(&self.ctx);

        let Some(conn) = self.ctx.take_connection() else {
            return CloseOutcome::NotConnected;
        };
        self.ctx.set_state(ConnectionState::Closing);

        let upstream = self.upstream.take_for_teardown();
        let downstreams = self.downstream.take_for_teardown();

        let last = upstream.open.len();
        for (i, channel) in upstream.open.iter().enumerate() {
            let close_session = i + 1 == last;
            if let Err(e) = channel.close(close_session).await {
                tracing::warn!(conn = %self.name(), channel = %channel.id(), "upstream close failed: {e}");
            }
        }
        for channel in &downstreams {
            if let Err(e) = channel.close().await {
                tracing::warn!(conn = %self.name(), channel = %channel.id(), "downstream close failed: {e}");
            }
        }

        if let Err(e) = conn.close().await {
            tracing::warn!(conn = %self.name(), "connection close failed: {e}");
        }

        let (generated, received) = self.upstream.counters();
        let reconciler = SessionReconciler {
            conn_name: self.name(),
            measurements: self.measurements.as_ref(),
            project_id: self.ctx.config.project_id.as_deref(),
        };
        let outcome = reconciler
            .run(
                upstream.session_id.as_deref(),
                &upstream.used,
                generated,
                received,
            )
            .await;

        self.ctx.set_state(ConnectionState::Disconnected);
        CloseOutcome::Closed(outcome)
    }

    /// Run [`close`](Self::close) on a background task.
    pub fn close_in_background(self: &Arc<Self>) {
        // ---
        let me = self.clone();
        self.ctx.spawn("close", async move {
            if let CloseOutcome::Closed(outcome) = me.close().await {
                tracing::debug!(conn = %me.name(), ?outcome, "background close done");
            }
        });
    }

    /// Drop every registration, then close.
    pub async fn shutdown(&self) -> CloseOutcome {
        // ---
        self.upstream.unregister_all();
        self.downstream.unregister_all();
        self.ctx.set_handler(None);
        self.close().await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
