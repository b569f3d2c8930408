//! In-process simulated transport for tsedge unit and integration testing.
//!
//! [`SimConnector`] implements [`tsedge_domain::Connector`] with plain
//! in-memory state instead of sockets. Every connection it makes talks to one
//! shared [`SimLink`], which plays the server: it records calls and exposes
//! the opened channels so tests can drive the client's callback paths.
//!
//! - Manual or automatic chunk acknowledgement
//! - Injected write, open, reopen and connect failures
//! - Channel close-with-error
//! - Downstream chunk and metadata delivery
//!
//! [`RecordingMeasurements`] and [`StaticToken`] stand in for the REST and
//! authentication collaborators.
//!
//! # Quick start
//!
//! ```rust
//! use tsedge_link_sim::{LinkSimConfig, SimConnector, SimLink};
//!
//! let link = SimLink::new(LinkSimConfig::manual_ack());
//! let connector = SimConnector::new(link.clone());
//! ```

mod channel;
mod config;
mod link;
mod measurement;

// --- public API
pub use channel::{SimDownstream, SimUpstream};
pub use config::LinkSimConfig;
pub use link::{SimConnection, SimConnector, SimLink};
pub use measurement::{MeasurementCall, MeasurementOp, RecordingMeasurements, StaticToken};
