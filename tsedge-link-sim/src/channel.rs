use std::collections::VecDeque;

// ---

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

// ---

use tsedge_domain::{
    // ---
    ChannelId,
    DataPointGroup,
    DownstreamChannel,
    DownstreamChunk,
    DownstreamEventsPtr,
    DownstreamFilter,
    DownstreamMetadata,
    FlushPolicy,
    Result,
    TsEdgeError,
    UpstreamChannel,
    UpstreamChunk,
    UpstreamChunkAck,
    UpstreamEventsPtr,
    UpstreamState,
};

// ---------------------------------------------------------------------------
// SimUpstream
// ---------------------------------------------------------------------------

/// Simulated upstream channel.
///
/// Every successful write is flushed as its own chunk regardless of the
/// flush policy, so one write always yields one `on_generate_chunk`.
/// Notifications are fired on the calling thread after internal locks are
/// released, the same way a transport worker thread would.
pub struct SimUpstream {
    // ---
    id: ChannelId,
    session_id: Option<String>,
    persist: bool,
    flush_policy: FlushPolicy,
    auto_ack: bool,
    events: UpstreamEventsPtr,
    inner: Mutex<UpstreamInner>,
}

// ---

#[derive(Default)]
struct UpstreamInner {
    // ---
    closed: bool,
    closed_session: bool,
    fail_writes: usize,
    state: UpstreamState,
    /// Sequence numbers generated but not yet acknowledged.
    unacked: VecDeque<u32>,
    written: Vec<DataPointGroup>,
}

// ---

impl SimUpstream {
    // ---
    pub(crate) fn new(
        session_id: Option<String>,
        persist: bool,
        flush_policy: FlushPolicy,
        auto_ack: bool,
        events: UpstreamEventsPtr,
    ) -> Self {
        // ---
        Self {
            id: Uuid::new_v4(),
            session_id,
            persist,
            flush_policy,
            auto_ack,
            events,
            inner: Mutex::new(UpstreamInner::default()),
        }
    }

    // ---

    /// Fresh channel with the same parameters, as a transport reopen yields.
    pub(crate) fn successor(&self) -> Self {
        // ---
        Self::new(
            self.session_id.clone(),
            self.persist,
            self.flush_policy,
            self.auto_ack,
            self.events.clone(),
        )
    }

    // ---

    pub fn flush_policy(&self) -> FlushPolicy {
        self.flush_policy
    }

    /// Make the next `n` writes fail without closing the channel.
    pub fn fail_next_writes(&self, n: usize) {
        self.inner.lock().fail_writes = n;
    }

    /// Every group accepted by this channel, in write order.
    pub fn written(&self) -> Vec<DataPointGroup> {
        self.inner.lock().written.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// `true` if the channel was closed with `close_session`.
    pub fn closed_session(&self) -> bool {
        self.inner.lock().closed_session
    }

    pub fn pending_acks(&self) -> usize {
        self.inner.lock().unacked.len()
    }

    // ---

    /// Acknowledge up to `n` outstanding chunks, oldest first.
    ///
    /// Returns the number actually acknowledged.
    pub fn ack_pending(&self, n: usize) -> usize {
        // ---
        let acked: Vec<u32> = {
            let mut inner = self.inner.lock();
            let n = n.min(inner.unacked.len());
            inner.unacked.drain(..n).collect()
        };

        for sequence_number in &acked {
            self.events.on_receive_ack(self.id, &ack(*sequence_number));
        }
        acked.len()
    }

    // ---

    /// Simulate the transport giving up on this channel.
    pub fn close_with_error(&self, reason: &str) {
        // ---
        self.inner.lock().closed = true;
        self.events
            .on_close_with_error(self.id, &TsEdgeError::Transport(reason.to_string()));
    }
}

// ---

#[async_trait]
impl UpstreamChannel for SimUpstream {
    // ---
    fn id(&self) -> ChannelId {
        self.id
    }

    fn session_id(&self) -> Option<String> {
        self.session_id.clone()
    }

    fn persist(&self) -> bool {
        self.persist
    }

    // ---

    fn write_data_points(&self, groups: &[DataPointGroup]) -> Result<()> {
        // ---
        let chunk = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(TsEdgeError::ChannelClosed(self.id));
            }
            if inner.fail_writes > 0 {
                inner.fail_writes -= 1;
                return Err(TsEdgeError::Write {
                    channel: self.id,
                    reason: "injected write failure".into(),
                });
            }

            let points: usize = groups.iter().map(|g| g.points.len()).sum();
            let bytes: usize = groups.iter().map(DataPointGroup::payload_len).sum();

            inner.state.last_issued_sequence_number += 1;
            inner.state.total_data_points += points as u64;
            inner.written.extend_from_slice(groups);

            let sequence_number = inner.state.last_issued_sequence_number;
            if !self.auto_ack {
                inner.unacked.push_back(sequence_number);
            }

            UpstreamChunk {
                sequence_number,
                data_point_count: points as u32,
                payload_size: bytes as u32,
            }
        };

        self.events.on_generate_chunk(self.id, &chunk);
        if self.auto_ack {
            self.events
                .on_receive_ack(self.id, &ack(chunk.sequence_number));
        }
        Ok(())
    }

    // ---

    fn state(&self) -> UpstreamState {
        self.inner.lock().state
    }

    // ---

    async fn close(&self, close_session: bool) -> Result<()> {
        // ---
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.closed_session |= close_session;
        Ok(())
    }
}

// ---

fn ack(sequence_number: u32) -> UpstreamChunkAck {
    UpstreamChunkAck {
        sequence_number,
        result_code: 0,
        result_string: "OK".into(),
    }
}

// ---------------------------------------------------------------------------
// SimDownstream
// ---------------------------------------------------------------------------

/// Simulated downstream channel. Tests push chunks and metadata through it.
pub struct SimDownstream {
    // ---
    id: ChannelId,
    filters: Vec<DownstreamFilter>,
    events: DownstreamEventsPtr,
    closed: Mutex<bool>,
}

// ---

impl SimDownstream {
    // ---
    pub(crate) fn new(filters: Vec<DownstreamFilter>, events: DownstreamEventsPtr) -> Self {
        // ---
        Self {
            id: Uuid::new_v4(),
            filters,
            events,
            closed: Mutex::new(false),
        }
    }

    // ---

    pub(crate) fn successor(&self) -> Self {
        Self::new(self.filters.clone(), self.events.clone())
    }

    // ---

    pub fn filters(&self) -> &[DownstreamFilter] {
        &self.filters
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }

    /// Deliver a chunk as if received from the server.
    pub fn deliver_chunk(&self, chunk: &DownstreamChunk) {
        self.events.on_receive_chunk(self.id, chunk);
    }

    /// Deliver metadata as if received from the server.
    pub fn deliver_metadata(&self, metadata: &DownstreamMetadata) {
        self.events.on_receive_metadata(self.id, metadata);
    }

    // ---

    pub fn close_with_error(&self, reason: &str) {
        // ---
        *self.closed.lock() = true;
        self.events
            .on_close_with_error(self.id, &TsEdgeError::Transport(reason.to_string()));
    }
}

// ---

#[async_trait]
impl DownstreamChannel for SimDownstream {
    // ---
    fn id(&self) -> ChannelId {
        self.id
    }

    async fn close(&self) -> Result<()> {
        // ---
        *self.closed.lock() = true;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
