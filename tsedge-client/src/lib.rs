//! Client-side reliability and session layer for tsedge.
//!
//! Sits on top of a multiplexed streaming transport (any
//! [`tsedge_domain::Connector`]) and keeps many logical channels alive over
//! one physical connection: a channel that fails is reopened alone, failed
//! writes are replayed on the replacement, and the measurement session is
//! reconciled with the server when the connection closes.
//!
//! # Structure
//!
//! - [`connection`]: [`EdgeConnection`], connect/close lifecycle and close fan-in
//! - `registry`    : generation-checked arena of registrations
//! - `upstream`    : upstream reliability manager, [`UpstreamHandle`]
//! - `downstream`  : downstream reliability manager, [`DownstreamHandle`]
//! - `reconcile`   : session reconciliation at close
//! - [`config`]    : [`ConnectionConfig`]
//! - [`handler`]   : application observer traits
//! - [`throughput`]: [`ByteSampler`] and [`RollingThroughput`]
//!
//! # Threading
//!
//! Transport notifications arrive on transport worker threads. Internal state
//! is guarded by short `parking_lot` locks never held across an `.await`;
//! chunk counters are atomics. Reopens triggered from those threads run on the
//! tokio runtime captured at [`EdgeConnection::connect`].

pub mod config;
pub mod connection;
mod context;
mod downstream;
pub mod handler;
mod reconcile;
mod registry;
pub mod throughput;
mod upstream;

// --- public API
pub use config::ConnectionConfig;
pub use connection::{CloseOutcome, EdgeConnection};
pub use downstream::DownstreamHandle;
pub use handler::{
    // ---
    ConnectionHandler,
    ConnectionHandlerPtr,
    DownstreamHandler,
    DownstreamHandlerPtr,
    UpstreamHandler,
    UpstreamHandlerPtr,
};
pub use reconcile::{ReconcileOutcome, ReconcileStage};
pub use registry::RegistrationId;
pub use throughput::{ByteSampler, ByteSamplerPtr, RollingThroughput};
pub use upstream::UpstreamHandle;
