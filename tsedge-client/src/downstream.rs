//! Downstream reliability manager.
//!
//! Registrations asking for the same `(source node, data filter)` share one
//! wire-level channel. Received chunks fan out to every registration bound to
//! the channel, each with its own arbitrated base time.
//!
//! # Locks
//!
//! - `table`   : registrations, bound channels, per-registration base times
//! - `opening` : async serialisation guard for batch opens, held across the
//!   channel opens and guarding no data. Close, reopen and transport
//!   callbacks never take it; an open that outlives a close closes what it
//!   opened instead of binding it.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Weak};

// ---

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

// ---

use tsedge_domain::{
    // ---
    ChannelId,
    DownstreamChunk,
    DownstreamEvents,
    DownstreamFilter,
    DownstreamMetadata,
    DownstreamOpenRequest,
    DownstreamPtr,
    Result,
    StoredBaseTime,
    TsEdgeError,
};

// ---

use super::context::LinkCtx;
use super::registry::{RegistrationId, Registry};
use super::DownstreamHandlerPtr;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

struct DownstreamEntry {
    // ---
    filter: DownstreamFilter,
    bound: Option<DownstreamPtr>,
    base_time: StoredBaseTime,
    handler: DownstreamHandlerPtr,
}

// ---

impl DownstreamEntry {
    fn is_bound_to(&self, channel: ChannelId) -> bool {
        self.bound.as_ref().is_some_and(|b| b.id() == channel)
    }
}

// ---

#[derive(Default)]
struct DownstreamTable {
    // ---
    registrations: Registry<DownstreamEntry>,
    open: Vec<DownstreamPtr>,
    reopening: HashSet<ChannelId>,
}

// ---------------------------------------------------------------------------
// DownstreamManager
// ---------------------------------------------------------------------------

pub(crate) struct DownstreamManager {
    // ---
    me: Weak<Self>,
    ctx: Arc<LinkCtx>,
    table: Mutex<DownstreamTable>,
    opening: tokio::sync::Mutex<()>,
}

// ---

impl DownstreamManager {
    // ---
    pub fn new(ctx: Arc<LinkCtx>) -> Arc<Self> {
        // ---
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            ctx,
            table: Mutex::new(DownstreamTable::default()),
            opening: tokio::sync::Mutex::new(()),
        })
    }

    // --- registry ------------------------------------------------------------

    pub fn register(&self, filter: DownstreamFilter, handler: DownstreamHandlerPtr) -> RegistrationId {
        // ---
        let id = self.table.lock().registrations.insert(DownstreamEntry {
            filter,
            bound: None,
            base_time: StoredBaseTime::default(),
            handler,
        });
        tracing::debug!(conn = %self.ctx.name(), registration = %id, "downstream registered");
        id
    }

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

    pub fn stored_base_time(&self, id: RegistrationId) -> Option<StoredBaseTime> {
        self.table.lock().registrations.get(id).map(|e| e.base_time)
    }

    // --- open ----------------------------------------------------------------

    /// Open one channel per distinct filter among unbound registrations.
    ///
    /// An unbound registration whose filter already has an open channel joins
    /// that channel without a new subscription. Returns the number of channels
    /// opened.
    pub async fn open(&self) -> Result<usize> {
        // ---
        let _opening = self.opening.lock().await;

        let groups: BTreeMap<DownstreamFilter, Vec<RegistrationId>> = {
            let mut guard = self.table.lock();
            let table = &mut *guard;

            let live: BTreeMap<DownstreamFilter, DownstreamPtr> = table
                .registrations
                .iter()
                .filter_map(|(_, e)| {
                    let bound = e.bound.as_ref()?;
                    let open = table.open.iter().any(|c| c.id() == bound.id());
                    open.then(|| (e.filter.clone(), bound.clone()))
                })
                .collect();

            let mut groups: BTreeMap<DownstreamFilter, Vec<RegistrationId>> = BTreeMap::new();
            for (id, entry) in table.registrations.iter_mut() {
                if entry.bound.is_some() {
                    continue;
                }
                match live.get(&entry.filter) {
                    Some(channel) => {
                        tracing::debug!(
                            conn = %self.ctx.name(),
                            registration = %id,
                            channel = %channel.id(),
                            "downstream joined open channel"
                        );
                        entry.bound = Some(channel.clone());
                    }
                    None => groups.entry(entry.filter.clone()).or_default().push(id),
                }
            }
            groups
        };
        if groups.is_empty() {
            return Ok(0);
        }

        let conn = self.ctx.connection().ok_or(TsEdgeError::NotConnected)?;
        let timeout = self.ctx.config.response_timeout();
        let mut opened = 0;

        for (filter, members) in groups {
            // ---
            let req = DownstreamOpenRequest {
                filters: vec![filter.clone()],
                omit_empty_chunk: true,
                open_timeout: timeout,
                close_timeout: timeout,
                events: self.event_sink(),
            };

            let channel = match conn.open_downstream(req).await {
                Ok(channel) => channel,
                Err(e) => {
                    tracing::warn!(
                        conn = %self.ctx.name(),
                        source = %filter.source_node_id,
                        data = %filter.data_filter,
                        "downstream open failed: {e}"
                    );
                    self.ctx.report_error(&e);
                    continue;
                }
            };

            let bound = {
                let mut guard = self.table.lock();
                let table = &mut *guard;
                let mut bound = 0;
                if self.ctx.is_live(&conn) {
                    for id in &members {
                        if let Some(entry) = table.registrations.get_mut(*id) {
                            if entry.bound.is_none() {
                                entry.bound = Some(channel.clone());
                                bound += 1;
                            }
                        }
                    }
                }
                if bound > 0 {
                    table.open.push(channel.clone());
                }
                bound
            };

            if bound == 0 {
                self.close_in_background(channel);
                continue;
            }

            opened += 1;
            tracing::info!(
                conn = %self.ctx.name(),
                channel = %channel.id(),
                source = %filter.source_node_id,
                data = %filter.data_filter,
                registrations = bound,
                "downstream open"
            );
        }

        Ok(opened)
    }

    fn event_sink(&self) -> Arc<DownstreamEventSink> {
        Arc::new(DownstreamEventSink {
            manager: self.me.clone(),
        })
    }

    // --- teardown ------------------------------------------------------------

    /// Unbind every registration and forget arbitrated base times.
    pub fn take_for_teardown(&self) -> Vec<DownstreamPtr> {
        // ---
        let mut table = self.table.lock();
        for (_, entry) in table.registrations.iter_mut() {
            entry.bound = None;
            entry.base_time = StoredBaseTime::default();
        }
        table.reopening.clear();
        std::mem::take(&mut table.open)
    }

    fn close_in_background(&self, channel: DownstreamPtr) {
        // ---
        let name = self.ctx.name().to_string();
        self.ctx.spawn("downstream close", async move {
            if let Err(e) = channel.close().await {
                tracing::warn!(conn = %name, channel = %channel.id(), "background close failed: {e}");
            }
        });
    }

    // --- transport callbacks -------------------------------------------------

    fn on_receive_chunk(&self, channel: ChannelId, chunk: &DownstreamChunk) {
        // ---
        if chunk.is_empty() {
            tracing::trace!(conn = %self.ctx.name(), %channel, "empty chunk skipped");
            return;
        }

        self.ctx.add_received_bytes(chunk.payload_len());
        if self.ctx.config.log_received_data_points {
            tracing::trace!(
                conn = %self.ctx.name(),
                %channel,
                seq = chunk.sequence_number,
                source = %chunk.source_node_id,
                groups = chunk.groups.len(),
                "chunk received"
            );
        }

        let received_at = Utc::now();
        let first_elapsed = chunk.first_elapsed_time();

        let deliveries: Vec<(DownstreamHandlerPtr, DateTime<Utc>)> = {
            let mut table = self.table.lock();
            table
                .registrations
                .iter_mut()
                .filter(|(_, e)| e.is_bound_to(channel))
                .filter_map(|(_, e)| {
                    let base = e.base_time.resolve(first_elapsed, received_at)?;
                    Some((e.handler.clone(), base))
                })
                .collect()
        };

        for (handler, base_time) in deliveries {
            handler.on_chunk(base_time, &chunk.groups);
        }
    }

    // ---

    fn on_receive_metadata(&self, channel: ChannelId, metadata: &DownstreamMetadata) {
        // ---
        let handlers: Vec<DownstreamHandlerPtr> = {
            let mut table = self.table.lock();
            let mut handlers = Vec::new();
            for (id, entry) in table.registrations.iter_mut() {
                if !entry.is_bound_to(channel) {
                    continue;
                }
                if let DownstreamMetadata::BaseTime(fact) = metadata {
                    let accepted = entry.base_time.offer(fact);
                    tracing::debug!(
                        conn = %self.ctx.name(),
                        registration = %id,
                        origin = %fact.name,
                        priority = fact.priority,
                        accepted,
                        "base time offered"
                    );
                }
                handlers.push(entry.handler.clone());
            }
            handlers
        };

        for handler in handlers {
            handler.on_metadata(metadata);
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

        tracing::warn!(conn = %self.ctx.name(), %channel, "downstream closed with error, reopening: {error}");
        let Some(me) = self.me.upgrade() else {
            return;
        };
        self.ctx.spawn("downstream reopen", me.reopen(old));
    }

    // ---

    async fn reopen(self: Arc<Self>, old: DownstreamPtr) {
        // ---
        let old_id = old.id();
        let result = self.try_reopen(old).await;
        self.table.lock().reopening.remove(&old_id);

        if let Err(e) = result {
            tracing::warn!(conn = %self.ctx.name(), channel = %old_id, "downstream reopen failed: {e}");
            self.ctx.report_error(&e);
        }
    }

    async fn try_reopen(&self, old: DownstreamPtr) -> Result<()> {
        // ---
        let old_id = old.id();
        let conn = self.ctx.connection().ok_or(TsEdgeError::NotConnected)?;
        let new = conn
            .reopen_downstream(old.clone())
            .await
            .map_err(|e| TsEdgeError::Reopen {
                channel: old_id,
                reason: e.to_string(),
            })?;
        let new_id = new.id();

        let rebound = {
            let mut table = self.table.lock();
            if !self.ctx.is_live(&conn) {
                None
            } else {
                let mut rebound = 0;
                for (_, entry) in table.registrations.iter_mut() {
                    if entry.is_bound_to(old_id) {
                        entry.bound = Some(new.clone());
                        rebound += 1;
                    }
                }
                if rebound > 0 {
                    table.open.retain(|c| c.id() != old_id);
                    table.open.push(new.clone());
                }
                Some(rebound)
            }
        };

        match rebound {
            None => {
                tracing::debug!(conn = %self.ctx.name(), channel = %new_id, "connection closing; discarding reopened channel");
                self.close_in_background(new);
                Ok(())
            }
            Some(0) => {
                self.close_in_background(new);
                Err(TsEdgeError::Reopen {
                    channel: old_id,
                    reason: "no registration bound to channel".into(),
                })
            }
            Some(n) => {
                tracing::info!(
                    conn = %self.ctx.name(),
                    old = %old_id,
                    new = %new_id,
                    registrations = n,
                    "downstream reopened"
                );
                self.close_in_background(old);
                Ok(())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// DownstreamEventSink
// ---------------------------------------------------------------------------

struct DownstreamEventSink {
    // ---
    manager: Weak<DownstreamManager>,
}

// ---

impl DownstreamEvents for DownstreamEventSink {
    // ---
    fn on_receive_chunk(&self, channel: ChannelId, chunk: &DownstreamChunk) {
        if let Some(m) = self.manager.upgrade() {
            m.on_receive_chunk(channel, chunk);
        }
    }

    fn on_receive_metadata(&self, channel: ChannelId, metadata: &DownstreamMetadata) {
        if let Some(m) = self.manager.upgrade() {
            m.on_receive_metadata(channel, metadata);
        }
    }

    fn on_close_with_error(&self, channel: ChannelId, error: &TsEdgeError) {
        if let Some(m) = self.manager.upgrade() {
            m.on_close_with_error(channel, error);
        }
    }

    fn on_fail_with_error(&self, channel: ChannelId, error: &TsEdgeError) {
        if let Some(m) = self.manager.upgrade() {
            tracing::warn!(conn = %m.ctx.name(), %channel, "downstream error: {error}");
            m.ctx.report_error(error);
        }
    }
}

// ---------------------------------------------------------------------------
// DownstreamHandle
// ---------------------------------------------------------------------------

/// Caller-side handle of one downstream registration.
#[derive(Clone)]
pub struct DownstreamHandle {
    // ---
    id: RegistrationId,
    manager: Arc<DownstreamManager>,
}

// ---

impl DownstreamHandle {
    // ---
    pub(crate) fn new(id: RegistrationId, manager: Arc<DownstreamManager>) -> Self {
        Self { id, manager }
    }

    pub fn id(&self) -> RegistrationId {
        self.id
    }

    pub fn channel_id(&self) -> Option<ChannelId> {
        self.manager.bound_channel(self.id)
    }

    pub fn is_open(&self) -> bool {
        self.channel_id().is_some()
    }

    /// Current arbitrated base time and its priority, if any.
    pub fn base_time(&self) -> Option<StoredBaseTime> {
        self.manager.stored_base_time(self.id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
