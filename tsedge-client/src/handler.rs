//! Observer traits implemented by applications.
//!
//! Every method may be called from a transport worker thread. Implementations
//! must be cheap and must not block; hand longer work to a channel or task.

use std::sync::Arc;

// ---

use chrono::{DateTime, Utc};

// ---

use tsedge_domain::{
    // ---
    ChannelId,
    DataPointGroup,
    DownstreamMetadata,
    TsEdgeError,
    UpstreamChunk,
    UpstreamChunkAck,
};

// ---------------------------------------------------------------------------
// ConnectionHandler
// ---------------------------------------------------------------------------

pub trait ConnectionHandler: Send + Sync {
    // ---
    fn on_connect(&self) {}

    fn on_connect_failed(&self, error: &TsEdgeError) {
        let _ = error;
    }

    /// The transport lost the physical connection and is trying to resume it.
    fn on_disconnect(&self) {}

    fn on_reconnect(&self) {}

    /// A non-fatal failure: channel open, reopen or transport error.
    fn on_error(&self, error: &TsEdgeError) {
        let _ = error;
    }
}

// ---

pub type ConnectionHandlerPtr = Arc<dyn ConnectionHandler>;

// ---------------------------------------------------------------------------
// UpstreamHandler
// ---------------------------------------------------------------------------

/// Per-registration upstream observer.
pub trait UpstreamHandler: Send + Sync {
    // ---
    /// A channel was bound to the registration, at first open or after a
    /// reopen. `sequence_id` is the new channel's id.
    fn on_open(&self, sequence_id: ChannelId) {
        let _ = sequence_id;
    }

    fn on_generate_chunk(&self, sequence_id: ChannelId, chunk: &UpstreamChunk) {
        let _ = (sequence_id, chunk);
    }

    fn on_receive_ack(&self, sequence_id: ChannelId, ack: &UpstreamChunkAck) {
        let _ = (sequence_id, ack);
    }
}

// ---

pub type UpstreamHandlerPtr = Arc<dyn UpstreamHandler>;

// ---------------------------------------------------------------------------
// DownstreamHandler
// ---------------------------------------------------------------------------

/// Per-registration downstream observer.
pub trait DownstreamHandler: Send + Sync {
    // ---
    /// Data for this registration, with the base time its elapsed stamps are
    /// relative to.
    fn on_chunk(&self, base_time: DateTime<Utc>, groups: &[DataPointGroup]);

    /// Raw metadata received on the registration's channel.
    fn on_metadata(&self, metadata: &DownstreamMetadata) {
        let _ = metadata;
    }
}

// ---

impl<F> DownstreamHandler for F
where
    F: Fn(DateTime<Utc>, &[DataPointGroup]) + Send + Sync,
{
    fn on_chunk(&self, base_time: DateTime<Utc>, groups: &[DataPointGroup]) {
        self(base_time, groups)
    }
}

// ---

pub type DownstreamHandlerPtr = Arc<dyn DownstreamHandler>;
