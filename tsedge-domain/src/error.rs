use thiserror::Error;

// ---

use super::data::ChannelId;

// ---

#[derive(Debug, Error)]
pub enum TsEdgeError {
    // ---
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("not connected")]
    NotConnected,

    #[error("invalid server endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("node id is not set")]
    MissingNodeId,

    #[error("channel not yet opened")]
    NotOpen,

    #[error("unknown registration")]
    UnknownRegistration,

    #[error("failed to open channel: {0}")]
    ChannelOpen(String),

    #[error("write failed on channel {channel}: {reason}")]
    Write { channel: ChannelId, reason: String },

    #[error("channel {0} closed")]
    ChannelClosed(ChannelId),

    #[error("reopen of channel {channel} failed: {reason}")]
    Reopen { channel: ChannelId, reason: String },

    #[error("measurement request failed: {0}")]
    Measurement(String),

    #[error("operation timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),
}

// ---

pub type Result<T> = std::result::Result<T, TsEdgeError>;
