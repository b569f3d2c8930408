use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

// ---

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

// ---

use tsedge_domain::{
    // ---
    CreateMeasurement,
    MeasurementService,
    Result,
    SequenceUpdate,
    TokenSource,
    TsEdgeError,
};

// ---------------------------------------------------------------------------
// MeasurementCall
// ---------------------------------------------------------------------------

/// One recorded call against [`RecordingMeasurements`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeasurementCall {
    // ---
    Create(CreateMeasurement),
    Complete {
        measurement_id: String,
        project_id: Option<String>,
    },
    End {
        measurement_id: String,
        project_id: Option<String>,
    },
    UpdateSequence(SequenceUpdate),
}

// ---

/// Operation selector for failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MeasurementOp {
    // ---
    Create,
    Complete,
    End,
    UpdateSequence,
}

// ---------------------------------------------------------------------------
// RecordingMeasurements
// ---------------------------------------------------------------------------

/// In-memory [`MeasurementService`] that records every call.
///
/// Calls for a failing operation are still recorded, then rejected.
#[derive(Default)]
pub struct RecordingMeasurements {
    // ---
    calls: Mutex<Vec<MeasurementCall>>,
    failing: Mutex<HashSet<MeasurementOp>>,
}

// ---

impl RecordingMeasurements {
    // ---
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Reject every future call of `op`.
    pub fn fail(&self, op: MeasurementOp) {
        self.failing.lock().insert(op);
    }

    pub fn calls(&self) -> Vec<MeasurementCall> {
        self.calls.lock().clone()
    }

    pub fn creates(&self) -> usize {
        self.count(|c| matches!(c, MeasurementCall::Create(_)))
    }

    pub fn completes(&self) -> usize {
        self.count(|c| matches!(c, MeasurementCall::Complete { .. }))
    }

    pub fn ends(&self) -> usize {
        self.count(|c| matches!(c, MeasurementCall::End { .. }))
    }

    pub fn sequence_updates(&self) -> Vec<SequenceUpdate> {
        // ---
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                MeasurementCall::UpdateSequence(u) => Some(u.clone()),
                _ => None,
            })
            .collect()
    }

    // ---

    fn count(&self, pred: impl Fn(&MeasurementCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| pred(c)).count()
    }

    fn record(&self, op: MeasurementOp, call: MeasurementCall) -> Result<()> {
        // ---
        self.calls.lock().push(call);
        if self.failing.lock().contains(&op) {
            return Err(TsEdgeError::Measurement(format!("injected {op:?} failure")));
        }
        Ok(())
    }
}

// ---

#[async_trait]
impl MeasurementService for RecordingMeasurements {
    // ---
    async fn create(&self, req: &CreateMeasurement) -> Result<String> {
        // ---
        self.record(MeasurementOp::Create, MeasurementCall::Create(req.clone()))?;
        Ok(Uuid::new_v4().to_string())
    }

    async fn complete(&self, measurement_id: &str, project_id: Option<&str>) -> Result<()> {
        // ---
        self.record(
            MeasurementOp::Complete,
            MeasurementCall::Complete {
                measurement_id: measurement_id.to_string(),
                project_id: project_id.map(str::to_string),
            },
        )
    }

    async fn end(&self, measurement_id: &str, project_id: Option<&str>) -> Result<()> {
        // ---
        self.record(
            MeasurementOp::End,
            MeasurementCall::End {
                measurement_id: measurement_id.to_string(),
                project_id: project_id.map(str::to_string),
            },
        )
    }

    async fn update_sequence(&self, update: &SequenceUpdate) -> Result<()> {
        // ---
        self.record(
            MeasurementOp::UpdateSequence,
            MeasurementCall::UpdateSequence(update.clone()),
        )
    }
}

// ---------------------------------------------------------------------------
// StaticToken
// ---------------------------------------------------------------------------

/// [`TokenSource`] returning a fixed token and counting how often it is asked.
pub struct StaticToken {
    // ---
    token: String,
    client_id: Option<String>,
    requests: AtomicUsize,
}

// ---

impl StaticToken {
    // ---
    pub fn new(token: impl Into<String>) -> Arc<Self> {
        // ---
        Arc::new(Self {
            token: token.into(),
            client_id: None,
            requests: AtomicUsize::new(0),
        })
    }

    /// Token source for an edge authenticated by client secret.
    pub fn with_client_id(token: impl Into<String>, client_id: impl Into<String>) -> Arc<Self> {
        // ---
        Arc::new(Self {
            token: token.into(),
            client_id: Some(client_id.into()),
            requests: AtomicUsize::new(0),
        })
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::Acquire)
    }
}

// ---

#[async_trait]
impl TokenSource for StaticToken {
    // ---
    async fn access_token(&self) -> Result<String> {
        // ---
        self.requests.fetch_add(1, Ordering::AcqRel);
        Ok(self.token.clone())
    }

    fn client_id(&self) -> Option<String> {
        self.client_id.clone()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
