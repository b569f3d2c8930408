//! Session reconciliation at connection close.
//!
//! When every generated chunk was acknowledged the measurement is simply
//! completed. Otherwise each persisted channel's locally observed counts
//! replace the server's expectations, and the measurement is ended. The first
//! failing REST call aborts the remaining steps; nothing is retried.

use std::fmt;

// ---

use tsedge_domain::{
    // ---
    MeasurementService,
    SequenceUpdate,
    TsEdgeError,
    UpstreamPtr,
};

// ---------------------------------------------------------------------------
// ReconcileOutcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileStage {
    // ---
    Complete,
    UpdateSequence,
    End,
}

// ---

impl fmt::Display for ReconcileStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Complete => "complete",
            Self::UpdateSequence => "update-sequence",
            Self::End => "end",
        })
    }
}

// ---

#[derive(Debug)]
pub enum ReconcileOutcome {
    // ---
    /// No persisted session was open.
    NoSession,

    /// Every chunk was acknowledged; the measurement was completed.
    Completed,

    /// Delivery was incomplete; sequences were updated and the measurement ended.
    Ended { sequences_updated: usize },

    /// A REST call failed; later steps were skipped.
    Aborted {
        stage: ReconcileStage,
        error: TsEdgeError,
    },
}

// ---

impl ReconcileOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Aborted { .. })
    }
}

// ---------------------------------------------------------------------------
// SessionReconciler
// ---------------------------------------------------------------------------

pub(crate) struct SessionReconciler<'a> {
    // ---
    pub conn_name: &'a str,
    pub measurements: &'a dyn MeasurementService,
    pub project_id: Option<&'a str>,
}

// ---

impl SessionReconciler<'_> {
    // ---
    /// Reconcile one session. Runs once per connection close.
    pub async fn run(
        &self,
        session_id: Option<&str>,
        channels: &[UpstreamPtr],
        generated: u64,
        received: u64,
    ) -> ReconcileOutcome {
        // ---
        let Some(measurement_id) = session_id else {
            return ReconcileOutcome::NoSession;
        };

        if generated == received {
            tracing::info!(
                conn = %self.conn_name,
                measurement = %measurement_id,
                chunks = generated,
                "all chunks acknowledged; completing measurement"
            );
            return match self
                .measurements
                .complete(measurement_id, self.project_id)
                .await
            {
                Ok(()) => ReconcileOutcome::Completed,
                Err(error) => self.abort(measurement_id, ReconcileStage::Complete, error),
            };
        }

        tracing::warn!(
            conn = %self.conn_name,
            measurement = %measurement_id,
            generated,
            received,
            "unacknowledged chunks; reconciling sequences"
        );

        let mut sequences_updated = 0;
        for channel in channels.iter().filter(|c| c.persist()) {
            // ---
            let state = channel.state();
            let update = SequenceUpdate {
                measurement_id: measurement_id.to_string(),
                sequence_id: channel.id(),
                expected_data_points: state.total_data_points,
                final_sequence_number: state.last_issued_sequence_number,
                project_id: self.project_id.map(str::to_string),
            };

            tracing::debug!(
                conn = %self.conn_name,
                measurement = %measurement_id,
                sequence = %update.sequence_id,
                points = update.expected_data_points,
                last_seq = update.final_sequence_number,
                "updating sequence"
            );

            if let Err(error) = self.measurements.update_sequence(&update).await {
                return self.abort(measurement_id, ReconcileStage::UpdateSequence, error);
            }
            sequences_updated += 1;
        }

        match self.measurements.end(measurement_id, self.project_id).await {
            Ok(()) => {
                tracing::info!(conn = %self.conn_name, measurement = %measurement_id, "measurement ended");
                ReconcileOutcome::Ended { sequences_updated }
            }
            Err(error) => self.abort(measurement_id, ReconcileStage::End, error),
        }
    }

    fn abort(&self, measurement_id: &str, stage: ReconcileStage, error: TsEdgeError) -> ReconcileOutcome {
        // ---
        tracing::warn!(
            conn = %self.conn_name,
            measurement = %measurement_id,
            %stage,
            "reconciliation aborted: {error}"
        );
        ReconcileOutcome::Aborted { stage, error }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
