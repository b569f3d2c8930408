use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

// ---

use super::basetime::BaseTimeFact;
use super::data::{
    // ---
    ChannelId,
    DataPointGroup,
    DownstreamChunk,
    DownstreamFilter,
    DownstreamMetadata,
    FlushPolicy,
    UpstreamChunk,
    UpstreamChunkAck,
    UpstreamState,
};
use super::endpoint::Endpoint;
use super::error::{Result, TsEdgeError};

// ---------------------------------------------------------------------------
// ConnectionState
// ---------------------------------------------------------------------------

/// Observable lifecycle state of the physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    // ---
    Disconnected,
    Connecting,
    Connected,

    /// Teardown in progress; reopens are discarded.
    Closing,
}

// ---------------------------------------------------------------------------
// TokenSource
// ---------------------------------------------------------------------------

/// Supplies bearer tokens to the transport.
///
/// The transport may call [`TokenSource::access_token`] any number of times
/// over a connection's life (initial auth, reconnects, token expiry).
#[async_trait]
pub trait TokenSource: Send + Sync {
    // ---
    async fn access_token(&self) -> Result<String>;

    /// Client id of the authenticated edge, used as the node id when none is
    /// configured.
    fn client_id(&self) -> Option<String> {
        None
    }
}

// ---

/// Convenience type alias for a shared [`TokenSource`].
pub type TokenSourcePtr = Arc<dyn TokenSource>;

// ---------------------------------------------------------------------------
// Event sinks (transport → core)
// ---------------------------------------------------------------------------
//
// Every sink method may be invoked from a transport worker thread that is not
// the caller's thread and not necessarily inside a tokio runtime. Methods must
// not block: take short locks, bump counters, hand async work to a runtime.

/// Connection-level notifications.
pub trait ConnectionEvents: Send + Sync {
    // ---
    fn on_disconnect(&self) {}

    fn on_reconnect(&self) {}

    fn on_fail_with_error(&self, error: &TsEdgeError) {
        let _ = error;
    }
}

// ---

/// Notifications for one upstream channel.
pub trait UpstreamEvents: Send + Sync {
    // ---
    /// Buffered writes were coalesced into a wire chunk.
    fn on_generate_chunk(&self, channel: ChannelId, chunk: &UpstreamChunk);

    /// The server acknowledged a chunk.
    fn on_receive_ack(&self, channel: ChannelId, ack: &UpstreamChunkAck);

    /// The channel closed abnormally and will not recover on its own.
    fn on_close_with_error(&self, channel: ChannelId, error: &TsEdgeError);

    /// A recoverable error; the transport keeps the channel alive.
    fn on_fail_with_error(&self, channel: ChannelId, error: &TsEdgeError) {
        let _ = (channel, error);
    }

    /// The channel resumed after a transient outage.
    fn on_resume(&self, channel: ChannelId) {
        let _ = channel;
    }
}

// ---

/// Notifications for one downstream channel.
pub trait DownstreamEvents: Send + Sync {
    // ---
    fn on_receive_chunk(&self, channel: ChannelId, chunk: &DownstreamChunk);

    fn on_receive_metadata(&self, channel: ChannelId, metadata: &DownstreamMetadata);

    fn on_close_with_error(&self, channel: ChannelId, error: &TsEdgeError);

    fn on_fail_with_error(&self, channel: ChannelId, error: &TsEdgeError) {
        let _ = (channel, error);
    }

    fn on_resume(&self, channel: ChannelId) {
        let _ = channel;
    }
}

// ---

pub type ConnectionEventsPtr = Arc<dyn ConnectionEvents>;
pub type UpstreamEventsPtr = Arc<dyn UpstreamEvents>;
pub type DownstreamEventsPtr = Arc<dyn DownstreamEvents>;

// ---------------------------------------------------------------------------
// Channels (core → transport)
// ---------------------------------------------------------------------------

/// One bound upstream channel instance. Never reused after close or reopen.
#[async_trait]
pub trait UpstreamChannel: Send + Sync {
    // ---
    fn id(&self) -> ChannelId;

    /// Session the channel was opened under, if any.
    fn session_id(&self) -> Option<String>;

    /// Whether the server persists this channel's data.
    fn persist(&self) -> bool;

    /// Queue groups for transmission.
    ///
    /// Local operation: succeeds once the transport has buffered the data,
    /// fails if the channel is closed or its buffer rejects the write.
    fn write_data_points(&self, groups: &[DataPointGroup]) -> Result<()>;

    /// Locally observed counters.
    fn state(&self) -> UpstreamState;

    /// Flush and close. `close_session` also asks the server to close the session.
    async fn close(&self, close_session: bool) -> Result<()>;
}

// ---

/// One bound downstream channel instance.
#[async_trait]
pub trait DownstreamChannel: Send + Sync {
    // ---
    fn id(&self) -> ChannelId;

    async fn close(&self) -> Result<()>;
}

// ---

pub type UpstreamPtr = Arc<dyn UpstreamChannel>;
pub type DownstreamPtr = Arc<dyn DownstreamChannel>;

// ---------------------------------------------------------------------------
// Open requests
// ---------------------------------------------------------------------------

pub struct UpstreamOpenRequest {
    // ---
    pub session_id: Option<String>,
    pub persist: bool,
    pub flush_policy: FlushPolicy,
    pub open_timeout: Option<Duration>,
    pub close_timeout: Option<Duration>,

    /// Sink for every notification about the opened channel, including
    /// channels later produced by [`Connection::reopen_upstream`].
    pub events: UpstreamEventsPtr,
}

// ---

pub struct DownstreamOpenRequest {
    // ---
    pub filters: Vec<DownstreamFilter>,
    pub omit_empty_chunk: bool,
    pub open_timeout: Option<Duration>,
    pub close_timeout: Option<Duration>,
    pub events: DownstreamEventsPtr,
}

// ---

pub struct ConnectParams {
    // ---
    pub endpoint: Endpoint,
    pub node_id: String,
    pub project_id: Option<String>,
    pub token_source: TokenSourcePtr,
    pub connect_timeout: Option<Duration>,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub events: ConnectionEventsPtr,
}

// ---------------------------------------------------------------------------
// Connection / Connector
// ---------------------------------------------------------------------------

/// One live physical connection multiplexing many channels.
#[async_trait]
pub trait Connection: Send + Sync {
    // ---
    async fn open_upstream(&self, req: UpstreamOpenRequest) -> Result<UpstreamPtr>;

    async fn open_downstream(&self, req: DownstreamOpenRequest) -> Result<DownstreamPtr>;

    /// Replace `old` with a fresh channel opened with the same parameters.
    ///
    /// `old` is left open; the caller closes it once the replacement is bound.
    async fn reopen_upstream(&self, old: UpstreamPtr) -> Result<UpstreamPtr>;

    async fn reopen_downstream(&self, old: DownstreamPtr) -> Result<DownstreamPtr>;

    /// Publish a base-time fact for downstream peers.
    async fn send_base_time(
        &self,
        fact: BaseTimeFact,
        persist: bool,
        timeout: Option<Duration>,
    ) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

// ---

pub type ConnectionPtr = Arc<dyn Connection>;

// ---

/// Factory for [`Connection`]s.
#[async_trait]
pub trait Connector: Send + Sync {
    // ---
    async fn connect(&self, params: ConnectParams) -> Result<ConnectionPtr>;
}

// ---

pub type ConnectorPtr = Arc<dyn Connector>;
