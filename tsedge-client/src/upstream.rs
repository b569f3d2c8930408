//! Upstream reliability manager.
//!
//! Owns every upstream registration of one connection, opens their channels
//! (minting a measurement session first when any of them persists), counts
//! generated and acknowledged chunks, buffers failed writes per channel and
//! replaces a channel that closes with an error.
//!
//! # Locks
//!
//! - `table`  : registrations, bound channels, session context
//! - `retry`  : failed-write buffers and the old -> new replacement map
//!
//! Neither is held across a transport or REST call. Counters are atomics
//! because the transport bumps them from its worker threads.
//!
//! `opening` is not a state lock. It is an async serialisation guard that
//! makes batch opens run one at a time, so a registration is opened once and
//! a session is created once. It is held across the measurement create, the
//! channel opens and the base-time sends, and guards no data. Close, reopen,
//! writes and transport callbacks never take it. An open that outlives a close
//! notices at bind time (the connection it started on is no longer live) and
//! closes what it opened.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

// ---

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

// ---

use tsedge_domain::{
    // ---
    elapsed_since,
    BaseTimeFact,
    BaseTimeKind,
    ChannelId,
    CreateMeasurement,
    DataId,
    DataPoint,
    DataPointGroup,
    FlushPolicy,
    MeasurementServicePtr,
    Result,
    TsEdgeError,
    UpstreamChunk,
    UpstreamChunkAck,
    UpstreamEvents,
    UpstreamOpenRequest,
    UpstreamPtr,
};

// ---

use super::context::LinkCtx;
use super::registry::{RegistrationId, Registry};
use super::UpstreamHandlerPtr;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

struct UpstreamEntry {
    // ---
    persist: bool,
    flush_policy: FlushPolicy,
    bound: Option<UpstreamPtr>,
    handler: Option<UpstreamHandlerPtr>,
}

// ---

impl UpstreamEntry {
    fn is_bound_to(&self, channel: ChannelId) -> bool {
        self.bound.as_ref().is_some_and(|b| b.id() == channel)
    }
}

// ---

#[derive(Default)]
struct UpstreamTable {
    // ---
    registrations: Registry<UpstreamEntry>,

    /// Channels currently bound and not yet closed by this manager.
    open: Vec<UpstreamPtr>,

    /// Persisted channels used under the current session, replaced ones included.
    used: Vec<UpstreamPtr>,

    session_id: Option<String>,

    /// Shared anchor for every elapsed-time stamp of the current batch.
    base_time: Option<DateTime<Utc>>,

    /// Channels with a reopen in flight.
    reopening: HashSet<ChannelId>,
}

// ---

#[derive(Default)]
struct RetryBuffers {
    // ---
    pending: HashMap<ChannelId, Vec<DataPointGroup>>,

    /// Old channel id -> channel that replaced it.
    replaced: HashMap<ChannelId, UpstreamPtr>,
}

// ---

/// What the close path needs from this manager, taken in one step.
pub(crate) struct UpstreamTeardown {
    // ---
    pub open: Vec<UpstreamPtr>,
    pub used: Vec<UpstreamPtr>,
    pub session_id: Option<String>,
}

// ---------------------------------------------------------------------------
// UpstreamManager
// ---------------------------------------------------------------------------

pub(crate) struct UpstreamManager {
    // ---
    me: Weak<Self>,
    ctx: Arc<LinkCtx>,
    measurements: MeasurementServicePtr,

    table: Mutex<UpstreamTable>,
    retry: Mutex<RetryBuffers>,

    /// Serialises batch opens so a registration is never opened twice.
    opening: tokio::sync::Mutex<()>,

    generated: AtomicU64,
    received: AtomicU64,
}

// ---

impl UpstreamManager {
    // ---
    pub fn new(ctx: Arc<LinkCtx>, measurements: MeasurementServicePtr) -> Arc<Self> {
        // ---
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            ctx,
            measurements,
            table: Mutex::new(UpstreamTable::default()),
            retry: Mutex::new(RetryBuffers::default()),
            opening: tokio::sync::Mutex::new(()),
            generated: AtomicU64::new(0),
            received: AtomicU64::new(0),
        })
    }

    // --- registry ------------------------------------------------------------

    pub fn register(
        &self,
        persist: bool,
        flush_policy: FlushPolicy,
        handler: Option<UpstreamHandlerPtr>,
    ) -> RegistrationId {
        // ---
        let id = self.table.lock().registrations.insert(UpstreamEntry {
            persist,
            flush_policy,
            bound: None,
            handler,
        });
        tracing::debug!(conn = %self.ctx.name(), registration = %id, persist, "upstream registered");
        id
    }

    /// Remove a registration. Its channel stays open until the connection closes.
    pub fn unregister(&self, id: RegistrationId) -> Result<()> {
        // ---
        self.table
            .lock()
            .registrations
            .remove(id)
            .map(|_| ())
            .ok_or(TsEdgeError::UnknownRegistration)
    }

    pub fn unregister_all(&self) {
        self.table.lock().registrations.clear();
    }

    pub fn bound_channel(&self, id: RegistrationId) -> Option<ChannelId> {
        // ---
        let table = self.table.lock();
        table
            .registrations
            .get(id)
            .and_then(|e| e.bound.as_ref().map(|b| b.id()))
    }

    pub fn base_time(&self) -> Option<DateTime<Utc>> {
        self.table.lock().base_time
    }

    pub fn session_id(&self) -> Option<String> {
        self.table.lock().session_id.clone()
    }

    // --- counters ------------------------------------------------------------

    /// `(generated, received)` chunk counts of the current batch.
    pub fn counters(&self) -> (u64, u64) {
        // Read received first so a concurrent ack can never make it exceed generated.
        let received = self.received.load(Ordering::Acquire);
        let generated = self.generated.load(Ordering::Acquire);
        (generated, received)
    }

    pub fn retry_buffer_len(&self) -> usize {
        self.retry.lock().pending.values().map(Vec::len).sum()
    }

    // --- open ----------------------------------------------------------------

    /// Open a channel for every registration not yet bound.
    ///
    /// Returns the number of channels opened. Individual open failures are
    /// logged, reported and skipped.
    pub async fn open(&self) -> Result<usize> {
        // ---
        let _opening = self.opening.lock().await;

        let pending: Vec<(RegistrationId, bool, FlushPolicy)> = {
            let table = self.table.lock();
            table
                .registrations
                .iter()
                .filter(|(_, e)| e.bound.is_none())
                .map(|(id, e)| (id, e.persist, e.flush_policy))
                .collect()
        };
        if pending.is_empty() {
            return Ok(0);
        }

        let node_id = self.ctx.node_id().ok_or(TsEdgeError::MissingNodeId)?;
        let conn = self.ctx.connection().ok_or(TsEdgeError::NotConnected)?;

        let (base_time, fresh) = {
            let mut table = self.table.lock();
            match table.base_time {
                Some(base) => (base, false),
                None => {
                    let now = Utc::now();
                    table.base_time = Some(now);
                    table.used.clear();
                    (now, true)
                }
            }
        };
        if fresh {
            self.reset_batch();
        }

        let wants_session = pending.iter().any(|(_, persist, _)| *persist);
        let mut session_id = self.session_id();
        if wants_session && session_id.is_none() {
            let req = CreateMeasurement {
                base_time,
                base_time_kind: BaseTimeKind::EdgeRtc,
                node_id,
                project_id: self.ctx.config.project_id.clone(),
            };
            let id = self.measurements.create(&req).await.map_err(|e| {
                tracing::warn!(conn = %self.ctx.name(), "failed to create measurement: {e}");
                e
            })?;
            tracing::info!(conn = %self.ctx.name(), measurement = %id, "measurement created");
            {
                let mut table = self.table.lock();
                if !self.ctx.is_live(&conn) {
                    tracing::warn!(conn = %self.ctx.name(), measurement = %id, "connection closed during measurement create");
                    return Err(TsEdgeError::NotConnected);
                }
                table.session_id = Some(id.clone());
            }
            session_id = Some(id);
        }

        let timeout = self.ctx.config.response_timeout();
        let mut opened = 0;

        for (id, persist, flush_policy) in pending {
            // ---
            let req = UpstreamOpenRequest {
                session_id: if persist { session_id.clone() } else { None },
                persist,
                flush_policy,
                open_timeout: timeout,
                close_timeout: timeout,
                events: self.event_sink(),
            };

            let channel = match conn.open_upstream(req).await {
                Ok(channel) => channel,
                Err(e) => {
                    tracing::warn!(conn = %self.ctx.name(), registration = %id, "upstream open failed: {e}");
                    self.ctx.report_error(&e);
                    continue;
                }
            };
            let channel_id = channel.id();

            let handler = {
                let mut guard = self.table.lock();
                let table = &mut *guard;
                let live = self.ctx.is_live(&conn);
                match table.registrations.get_mut(id) {
                    Some(entry) if entry.bound.is_none() && live => {
                        entry.bound = Some(channel.clone());
                        let handler = entry.handler.clone();
                        table.open.push(channel.clone());
                        if persist {
                            table.used.push(channel.clone());
                        }
                        Ok(handler)
                    }
                    _ => Err(()),
                }
            };
            let Ok(handler) = handler else {
                tracing::debug!(conn = %self.ctx.name(), channel = %channel_id, "registration gone or connection closed; closing new channel");
                self.close_in_background(channel);
                continue;
            };

            opened += 1;
            tracing::info!(
                conn = %self.ctx.name(),
                registration = %id,
                channel = %channel_id,
                persist,
                "upstream open"
            );

            let fact = BaseTimeFact::edge_rtc(session_id.clone().unwrap_or_default(), base_time);
            let persist_fact = persist && session_id.is_some();
            if let Err(e) = conn.send_base_time(fact, persist_fact, timeout).await {
                tracing::warn!(conn = %self.ctx.name(), channel = %channel_id, "base time send failed: {e}");
                self.ctx.report_error(&e);
            }

            if let Some(h) = handler {
                h.on_open(channel_id);
            }
        }

        Ok(opened)
    }

    // ---

    fn reset_batch(&self) {
        // ---
        self.generated.store(0, Ordering::Release);
        self.received.store(0, Ordering::Release);
        let mut retry = self.retry.lock();
        retry.pending.clear();
        retry.replaced.clear();
    }

    fn event_sink(&self) -> Arc<UpstreamEventSink> {
        Arc::new(UpstreamEventSink {
            manager: self.me.clone(),
        })
    }

    // --- write ---------------------------------------------------------------

    /// Write groups on the registration's bound channel.
    ///
    /// A failed write is kept in the channel's retry buffer and the error is
    /// still returned.
    pub fn write(&self, id: RegistrationId, groups: Vec<DataPointGroup>) -> Result<()> {
        // ---
        let channel = {
            let table = self.table.lock();
            let entry = table
                .registrations
                .get(id)
                .ok_or(TsEdgeError::UnknownRegistration)?;
            entry.bound.clone().ok_or(TsEdgeError::NotOpen)?
        };

        let bytes: usize = groups.iter().map(DataPointGroup::payload_len).sum();
        self.ctx.add_sent_bytes(bytes);

        if self.ctx.config.log_sent_data_points {
            for g in &groups {
                tracing::trace!(
                    conn = %self.ctx.name(),
                    channel = %channel.id(),
                    data = %g.data_id,
                    points = g.points.len(),
                    "send"
                );
            }
        }

        match channel.write_data_points(&groups) {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::warn!(conn = %self.ctx.name(), channel = %channel.id(), "write failed, buffered: {e}");
                self.buffer_failed(channel.id(), groups);
                Err(e)
            }
        }
    }

    // ---

    /// Keep `groups` for replay on `channel`'s replacement.
    ///
    /// When the channel was already replaced its buffer is gone, so the groups
    /// go straight to the replacement instead.
    fn buffer_failed(&self, channel: ChannelId, groups: Vec<DataPointGroup>) {
        // ---
        let replacement = {
            let mut retry = self.retry.lock();
            match retry.replaced.get(&channel) {
                Some(next) => next.clone(),
                None => {
                    retry.pending.entry(channel).or_default().extend(groups);
                    return;
                }
            }
        };

        if let Err(e) = replacement.write_data_points(&groups) {
            tracing::warn!(conn = %self.ctx.name(), channel = %replacement.id(), "forwarded write failed: {e}");
            self.buffer_failed(replacement.id(), groups);
        }
    }

    // --- teardown ------------------------------------------------------------

    /// Unbind every registration and take the session context.
    pub fn take_for_teardown(&self) -> UpstreamTeardown {
        // ---
        let mut table = self.table.lock();
        for (_, entry) in table.registrations.iter_mut() {
            entry.bound = None;
        }
        table.base_time = None;
        table.reopening.clear();
        UpstreamTeardown {
            open: std::mem::take(&mut table.open),
            used: std::mem::take(&mut table.used),
            session_id: table.session_id.take(),
        }
    }

    fn close_in_background(&self, channel: UpstreamPtr) {
        // ---
        let name = self.ctx.name().to_string();
        self.ctx.spawn("upstream close", async move {
            if let Err(e) = channel.close(false).await {
                tracing::warn!(conn = %name, channel = %channel.id(), "background close failed: {e}");
            }
        });
    }

    // --- transport callbacks -------------------------------------------------

    fn handlers_bound_to(&self, channel: ChannelId) -> Vec<UpstreamHandlerPtr> {
        // ---
        let table = self.table.lock();
        table
            .registrations
            .iter()
            .filter(|(_, e)| e.is_bound_to(channel))
            .filter_map(|(_, e)| e.handler.clone())
            .collect()
    }

    fn on_generate_chunk(&self, channel: ChannelId, chunk: &UpstreamChunk) {
        // ---
        self.generated.fetch_add(1, Ordering::AcqRel);
        if self.ctx.config.log_sent_data_points {
            tracing::trace!(
                conn = %self.ctx.name(),
                %channel,
                seq = chunk.sequence_number,
                points = chunk.data_point_count,
                "chunk generated"
            );
        }
        for h in self.handlers_bound_to(channel) {
            h.on_generate_chunk(channel, chunk);
        }
    }

    fn on_receive_ack(&self, channel: ChannelId, ack: &UpstreamChunkAck) {
        // ---
        self.received.fetch_add(1, Ordering::AcqRel);
        if self.ctx.config.log_sent_data_points {
            tracing::trace!(
                conn = %self.ctx.name(),
                %channel,
                seq = ack.sequence_number,
                code = ack.result_code,
                "chunk acked"
            );
        }
        for h in self.handlers_bound_to(channel) {
            h.on_receive_ack(channel, ack);
        }
    }

    // ---

    fn on_close_with_error(&self, channel: ChannelId, error: &TsEdgeError) {
        // ---
        if self.ctx.is_closing() {
            tracing::debug!(conn = %self.ctx.name(), %channel, "closing; ignoring channel error");
            return;
        }

        let old = {
            let mut table = self.table.lock();
            let old = table.open.iter().find(|c| c.id() == channel).cloned();
            match old {
                Some(old) if table.reopening.insert(channel) => old,
                _ => return,
            }
        };

        tracing::warn!(conn = %self.ctx.name(), %channel, "upstream closed with error, reopening: {error}");
        let Some(me) = self.me.upgrade() else {
            return;
        };
        self.ctx.spawn("upstream reopen", me.reopen(old));
    }

    // ---

    /// Replace `old` with a fresh channel. Attempted once.
    async fn reopen(self: Arc<Self>, old: UpstreamPtr) {
        // ---
        let old_id = old.id();
        let result = self.try_reopen(old).await;
        self.table.lock().reopening.remove(&old_id);

        if let Err(e) = result {
            tracing::warn!(conn = %self.ctx.name(), channel = %old_id, "upstream reopen failed: {e}");
            self.ctx.report_error(&e);
        }
    }

    async fn try_reopen(&self, old: UpstreamPtr) -> Result<()> {
        // ---
        let old_id = old.id();
        let reopen_error = |reason: String| TsEdgeError::Reopen {
            channel: old_id,
            reason,
        };

        let conn = self.ctx.connection().ok_or(TsEdgeError::NotConnected)?;
        let new = conn
            .reopen_upstream(old.clone())
            .await
            .map_err(|e| reopen_error(e.to_string()))?;
        let new_id = new.id();

        let handlers = {
            let mut table = self.table.lock();
            if !self.ctx.is_live(&conn) {
                None
            } else {
                let mut handlers = Vec::new();
                let mut bound = 0;
                let mut persist = false;
                for (_, entry) in table.registrations.iter_mut() {
                    if entry.is_bound_to(old_id) {
                        entry.bound = Some(new.clone());
                        bound += 1;
                        persist |= entry.persist;
                        handlers.extend(entry.handler.clone());
                    }
                }
                if bound > 0 {
                    table.open.retain(|c| c.id() != old_id);
                    table.open.push(new.clone());
                    if persist {
                        table.used.push(new.clone());
                    }
                    Some(Ok(handlers))
                } else {
                    Some(Err(()))
                }
            }
        };

        let handlers = match handlers {
            None => {
                tracing::debug!(conn = %self.ctx.name(), channel = %new_id, "connection closing; discarding reopened channel");
                self.close_in_background(new);
                return Ok(());
            }
            Some(Err(())) => {
                self.close_in_background(new);
                return Err(reopen_error("no registration bound to channel".into()));
            }
            Some(Ok(handlers)) => handlers,
        };

        let replay = {
            let mut retry = self.retry.lock();
            retry.replaced.insert(old_id, new.clone());
            retry.pending.remove(&old_id).unwrap_or_default()
        };

        tracing::info!(
            conn = %self.ctx.name(),
            old = %old_id,
            new = %new_id,
            replay = replay.len(),
            "upstream reopened"
        );

        if !replay.is_empty() {
            if let Err(e) = new.write_data_points(&replay) {
                tracing::warn!(conn = %self.ctx.name(), channel = %new_id, "replay failed: {e}");
                self.buffer_failed(new_id, replay);
            }
        }

        for h in handlers {
            h.on_open(new_id);
        }
        self.close_in_background(old);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// UpstreamEventSink
// ---------------------------------------------------------------------------

struct UpstreamEventSink {
    // ---
    manager: Weak<UpstreamManager>,
}

// ---

impl UpstreamEvents for UpstreamEventSink {
    // ---
    fn on_generate_chunk(&self, channel: ChannelId, chunk: &UpstreamChunk) {
        if let Some(m) = self.manager.upgrade() {
            m.on_generate_chunk(channel, chunk);
        }
    }

    fn on_receive_ack(&self, channel: ChannelId, ack: &UpstreamChunkAck) {
        if let Some(m) = self.manager.upgrade() {
            m.on_receive_ack(channel, ack);
        }
    }

    fn on_close_with_error(&self, channel: ChannelId, error: &TsEdgeError) {
        if let Some(m) = self.manager.upgrade() {
            m.on_close_with_error(channel, error);
        }
    }

    fn on_fail_with_error(&self, channel: ChannelId, error: &TsEdgeError) {
        if let Some(m) = self.manager.upgrade() {
            tracing::warn!(conn = %m.ctx.name(), %channel, "upstream error: {error}");
            m.ctx.report_error(error);
        }
    }

    fn on_resume(&self, channel: ChannelId) {
        if let Some(m) = self.manager.upgrade() {
            tracing::info!(conn = %m.ctx.name(), %channel, "upstream resumed");
        }
    }
}

// ---------------------------------------------------------------------------
// UpstreamHandle
// ---------------------------------------------------------------------------

/// Caller-side handle of one upstream registration.
///
/// Valid before connect and across reopens. Writes fail with
/// [`TsEdgeError::NotOpen`] while no channel is bound.
#[derive(Clone)]
pub struct UpstreamHandle {
    // ---
    id: RegistrationId,
    manager: Arc<UpstreamManager>,
}

// ---

impl UpstreamHandle {
    // ---
    pub(crate) fn new(id: RegistrationId, manager: Arc<UpstreamManager>) -> Self {
        Self { id, manager }
    }

    pub fn id(&self) -> RegistrationId {
        self.id
    }

    /// Id of the bound channel, which is also the server-side sequence id.
    pub fn sequence_id(&self) -> Option<ChannelId> {
        self.manager.bound_channel(self.id)
    }

    pub fn is_open(&self) -> bool {
        self.sequence_id().is_some()
    }

    fn base_time(&self) -> Result<DateTime<Utc>> {
        self.manager.base_time().ok_or(TsEdgeError::NotOpen)
    }

    // --- single point --------------------------------------------------------

    /// Send one point stamped with the current wall-clock time.
    pub fn send_data_point_now(&self, data_id: DataId, payload: impl Into<Bytes>) -> Result<()> {
        self.send_data_point_at(data_id, Utc::now(), payload)
    }

    /// Send one point stamped with an explicit wall-clock time.
    pub fn send_data_point_at(
        &self,
        data_id: DataId,
        at: DateTime<Utc>,
        payload: impl Into<Bytes>,
    ) -> Result<()> {
        // ---
        let elapsed = elapsed_since(self.base_time()?, at);
        self.send_data_point(data_id, elapsed, payload)
    }

    /// Send one point with an elapsed offset (ns) from the base time.
    pub fn send_data_point(
        &self,
        data_id: DataId,
        elapsed_time: i64,
        payload: impl Into<Bytes>,
    ) -> Result<()> {
        // ---
        let group = DataPointGroup::single(data_id, DataPoint::new(elapsed_time, payload));
        self.manager.write(self.id, vec![group])
    }

    // --- batch ---------------------------------------------------------------

    /// Send several points of one series, all stamped with one "now".
    pub fn send_data_points_now<I, P>(&self, data_id: DataId, payloads: I) -> Result<()>
    where
        I: IntoIterator<Item = P>,
        P: Into<Bytes>,
    {
        // ---
        let elapsed = elapsed_since(self.base_time()?, Utc::now());
        let points = payloads
            .into_iter()
            .map(|p| DataPoint::new(elapsed, p))
            .collect();
        self.manager
            .write(self.id, vec![DataPointGroup::new(data_id, points)])
    }

    /// Send several points of one series with explicit wall-clock stamps.
    pub fn send_data_points_at<I, P>(&self, data_id: DataId, points: I) -> Result<()>
    where
        I: IntoIterator<Item = (DateTime<Utc>, P)>,
        P: Into<Bytes>,
    {
        // ---
        let base = self.base_time()?;
        let points = points
            .into_iter()
            .map(|(at, p)| DataPoint::new(elapsed_since(base, at), p))
            .collect();
        self.manager
            .write(self.id, vec![DataPointGroup::new(data_id, points)])
    }

    /// Send pre-built groups whose points already carry elapsed offsets.
    pub fn send_data_points(&self, groups: Vec<DataPointGroup>) -> Result<()> {
        self.manager.write(self.id, groups)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use std::sync::atomic::AtomicUsize;

    use tsedge_link_sim::{LinkSimConfig, RecordingMeasurements, SimConnector, SimLink, StaticToken};
    use tsedge_domain::{ConnectParams, Connector, Endpoint, UpstreamChannel};

    use super::*;
    use crate::context::ConnectionEventSink;
    use crate::{ConnectionConfig, UpstreamHandler};

    // ---

    struct Setup {
        link: Arc<SimLink>,
        meas: Arc<RecordingMeasurements>,
        ctx: Arc<LinkCtx>,
        mgr: Arc<UpstreamManager>,
    }

    async fn setup(config: LinkSimConfig) -> Setup {
        // ---
        let link = SimLink::new(config);
        let meas = RecordingMeasurements::new();
        let ctx = Arc::new(LinkCtx::new(
            ConnectionConfig::new("sim://edge").with_node_id("node-1"),
        ));
        ctx.capture_runtime();

        let conn = SimConnector::new(link.clone())
            .connect(ConnectParams {
                endpoint: Endpoint::parse("sim://edge").unwrap(),
                node_id: "node-1".into(),
                project_id: None,
                token_source: StaticToken::new("t"),
                connect_timeout: None,
                ping_interval: ctx.config.connect_timeout,
                ping_timeout: ctx.config.connect_timeout,
                events: ConnectionEventSink::new(&ctx),
            })
            .await
            .unwrap();
        ctx.set_connection(conn);

        let mgr = UpstreamManager::new(ctx.clone(), meas.clone());
        Setup { link, meas, ctx, mgr }
    }

    fn temp() -> DataId {
        DataId::new("temp", "float")
    }

    #[derive(Default)]
    struct Opens(AtomicUsize);

    impl UpstreamHandler for Opens {
        fn on_open(&self, _: ChannelId) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    // ---

    #[tokio::test]
    async fn open_with_no_registrations_is_noop() {
        // ---
        let s = setup(LinkSimConfig::perfect()).await;
        assert_eq!(s.mgr.open().await.unwrap(), 0);
        assert!(s.link.upstreams().is_empty());
        assert_eq!(s.meas.creates(), 0);
    }

    // ---

    #[tokio::test]
    async fn open_without_node_id_makes_no_network_call() {
        // ---
        let s = setup(LinkSimConfig::perfect()).await;
        *s.ctx.node_id.write() = None;
        s.mgr.register(true, FlushPolicy::Immediately, None);

        assert!(matches!(s.mgr.open().await, Err(TsEdgeError::MissingNodeId)));
        assert!(s.link.upstreams().is_empty());
        assert_eq!(s.meas.creates(), 0);
    }

    // ---

    #[tokio::test]
    async fn persisted_open_creates_session_and_sends_base_time() {
        // ---
        let s = setup(LinkSimConfig::perfect()).await;
        let opens = Arc::new(Opens::default());
        let id = s.mgr.register(true, FlushPolicy::Immediately, Some(opens.clone() as UpstreamHandlerPtr));

        assert_eq!(s.mgr.open().await.unwrap(), 1);
        assert_eq!(s.meas.creates(), 1);
        assert!(s.mgr.session_id().is_some());
        assert_eq!(opens.0.load(Ordering::SeqCst), 1);

        let base_times = s.link.base_times();
        assert_eq!(base_times.len(), 1);
        assert_eq!(base_times[0].0.name, "edge_rtc");
        assert_eq!(base_times[0].0.priority, 20);
        assert!(base_times[0].1, "persisted channel publishes a persisted fact");

        assert_eq!(s.mgr.bound_channel(id), Some(s.link.upstreams()[0].id()));
    }

    // ---

    #[tokio::test]
    async fn one_failed_open_does_not_block_siblings() {
        // ---
        let s = setup(LinkSimConfig::perfect()).await;
        let a = s.mgr.register(false, FlushPolicy::Immediately, None);
        let b = s.mgr.register(false, FlushPolicy::Immediately, None);
        s.link.fail_next_upstream_opens(1);

        assert_eq!(s.mgr.open().await.unwrap(), 1);
        assert!(s.mgr.bound_channel(a).is_none());
        assert!(s.mgr.bound_channel(b).is_some());
        assert_eq!(s.meas.creates(), 0, "no persisted registration, no session");

        // The next open picks up only the unbound one.
        assert_eq!(s.mgr.open().await.unwrap(), 1);
        assert!(s.mgr.bound_channel(a).is_some());
        assert_eq!(s.link.upstreams().len(), 2);
    }

    // ---

    #[tokio::test]
    async fn write_before_open_is_not_open() {
        // ---
        let s = setup(LinkSimConfig::perfect()).await;
        let id = s.mgr.register(false, FlushPolicy::Immediately, None);
        let handle = UpstreamHandle::new(id, s.mgr.clone());

        assert!(matches!(
            handle.send_data_point(temp(), 0, vec![1u8]),
            Err(TsEdgeError::NotOpen)
        ));
        assert!(s.link.upstreams().is_empty());
    }

    // ---

    #[tokio::test]
    async fn failed_write_is_buffered_and_returned() {
        // ---
        let s = setup(LinkSimConfig::perfect()).await;
        let id = s.mgr.register(false, FlushPolicy::Immediately, None);
        s.mgr.open().await.unwrap();
        let handle = UpstreamHandle::new(id, s.mgr.clone());

        let up = s.link.upstreams()[0].clone();
        up.fail_next_writes(2);

        assert!(handle.send_data_point(temp(), 1, vec![1u8]).is_err());
        assert!(handle.send_data_point(temp(), 2, vec![2u8]).is_err());
        assert!(handle.send_data_point(temp(), 3, vec![3u8]).is_ok());

        assert_eq!(s.mgr.retry_buffer_len(), 2);
        assert_eq!(s.mgr.counters(), (1, 1));
    }

    // ---

    #[tokio::test]
    async fn wall_clock_writes_are_relative_to_base_time() {
        // ---
        let s = setup(LinkSimConfig::perfect()).await;
        let id = s.mgr.register(false, FlushPolicy::Immediately, None);
        s.mgr.open().await.unwrap();
        let handle = UpstreamHandle::new(id, s.mgr.clone());

        let base = s.mgr.base_time().unwrap();
        let at = base + chrono::TimeDelta::milliseconds(5);
        handle.send_data_point_at(temp(), at, vec![0u8]).unwrap();
        handle
            .send_data_points_now(temp(), vec![vec![1u8], vec![2u8]])
            .unwrap();

        let written = s.link.upstreams()[0].written();
        assert_eq!(written[0].points[0].elapsed_time, 5_000_000);
        assert_eq!(written[1].points.len(), 2);
        assert_eq!(
            written[1].points[0].elapsed_time, written[1].points[1].elapsed_time,
            "batch now shares one timestamp"
        );
    }

    // ---

    #[tokio::test]
    async fn teardown_unbinds_and_takes_session() {
        // ---
        let s = setup(LinkSimConfig::perfect()).await;
        let id = s.mgr.register(true, FlushPolicy::Immediately, None);
        s.mgr.open().await.unwrap();

        let teardown = s.mgr.take_for_teardown();
        assert_eq!(teardown.open.len(), 1);
        assert_eq!(teardown.used.len(), 1);
        assert!(teardown.session_id.is_some());
        assert!(s.mgr.bound_channel(id).is_none());
        assert!(s.mgr.unregister(id).is_ok(), "registrations survive teardown");
    }

    // ---

    #[tokio::test]
    async fn stale_handle_is_unknown_after_unregister() {
        // ---
        let s = setup(LinkSimConfig::perfect()).await;
        let id = s.mgr.register(false, FlushPolicy::Immediately, None);
        s.mgr.unregister(id).unwrap();

        assert!(matches!(s.mgr.unregister(id), Err(TsEdgeError::UnknownRegistration)));
        assert!(matches!(
            s.mgr.write(id, vec![]),
            Err(TsEdgeError::UnknownRegistration)
        ));
    }
}
