//! Core traits and types for the tsedge channel reliability layer.
//!
//! This crate defines the vocabulary of the system. All other crates depend
//! on `tsedge-domain` and speak its types. No implementations live here.
//!
//! # Structure
//!
//! - `error`        : [`TsEdgeError`] and [`Result<T>`] alias
//! - `data`         : data points, chunks, filters, flush policy
//! - `basetime`     : [`BaseTimeFact`] and the [`StoredBaseTime`] arbitration rule
//! - `endpoint`     : [`Endpoint`] resolution from a server URL
//! - `transport`    : [`Connector`], [`Connection`], channel traits, event sinks
//! - `measurement`  : [`MeasurementService`] REST collaborator

mod basetime;
mod data;
mod endpoint;
mod error;
mod measurement;
mod transport;

// --- error
pub use error::{Result, TsEdgeError};

// --- data
pub use data::{
    // ---
    elapsed_since,
    instant_after,
    ChannelId,
    DataId,
    DataPoint,
    DataPointGroup,
    DownstreamChunk,
    DownstreamFilter,
    DownstreamMetadata,
    FlushPolicy,
    UpstreamChunk,
    UpstreamChunkAck,
    UpstreamState,
};

// --- basetime
pub use basetime::{
    // ---
    BaseTimeFact,
    BaseTimeKind,
    StoredBaseTime,
    BOOTSTRAP_ORIGIN,
    EDGE_RTC_ORIGIN,
    EDGE_RTC_PRIORITY,
};

// --- endpoint
pub use endpoint::Endpoint;

// --- transport
pub use transport::{
    // ---
    ConnectParams,
    Connection,
    ConnectionEvents,
    ConnectionEventsPtr,
    ConnectionPtr,
    ConnectionState,
    Connector,
    ConnectorPtr,
    DownstreamChannel,
    DownstreamEvents,
    DownstreamEventsPtr,
    DownstreamOpenRequest,
    DownstreamPtr,
    TokenSource,
    TokenSourcePtr,
    UpstreamChannel,
    UpstreamEvents,
    UpstreamEventsPtr,
    UpstreamOpenRequest,
    UpstreamPtr,
};

// --- measurement
pub use measurement::{
    // ---
    CreateMeasurement,
    MeasurementService,
    MeasurementServicePtr,
    SequenceUpdate,
};
