use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

// ---

use super::basetime::BaseTimeKind;
use super::data::ChannelId;
use super::error::Result;

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Parameters for minting a new measurement session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateMeasurement {
    // ---
    pub base_time: DateTime<Utc>,
    pub base_time_kind: BaseTimeKind,
    pub node_id: String,
    pub project_id: Option<String>,
}

// ---

/// Replace the server's expectations for one sequence of a measurement with
/// the counts the client actually observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceUpdate {
    // ---
    pub measurement_id: String,

    /// Upstream channel id; the server knows it as the sequence id.
    pub sequence_id: ChannelId,

    pub expected_data_points: u64,
    pub final_sequence_number: u32,
    pub project_id: Option<String>,
}

// ---------------------------------------------------------------------------
// MeasurementService
// ---------------------------------------------------------------------------

/// REST collaborator that owns the server-side measurement record.
///
/// Implementations handle HTTP, authentication and retries of their own;
/// every call here is attempted once by the caller.
#[async_trait]
pub trait MeasurementService: Send + Sync {
    // ---
    /// Mint a session and return its id.
    async fn create(&self, req: &CreateMeasurement) -> Result<String>;

    /// Mark a measurement complete: every chunk was acknowledged.
    async fn complete(&self, measurement_id: &str, project_id: Option<&str>) -> Result<()>;

    /// End a measurement whose delivery may be incomplete.
    async fn end(&self, measurement_id: &str, project_id: Option<&str>) -> Result<()>;

    /// Replace one sequence's expected counts.
    async fn update_sequence(&self, update: &SequenceUpdate) -> Result<()>;
}

// ---

/// Convenience type alias for a shared [`MeasurementService`].
pub type MeasurementServicePtr = Arc<dyn MeasurementService>;
