use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use uuid::Uuid;

// ---

use super::basetime::BaseTimeFact;

// ---------------------------------------------------------------------------
// ChannelId
// ---------------------------------------------------------------------------

/// Transport-assigned identifier of one bound channel instance.
///
/// Never reused: a reopened channel always carries a fresh id. For upstream
/// channels this id doubles as the server-side sequence id.
pub type ChannelId = Uuid;

// ---------------------------------------------------------------------------
// DataId
// ---------------------------------------------------------------------------

/// `(name, type)` pair identifying one data series.
///
/// Also used as the data filter of a downstream subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DataId {
    // ---
    pub name: String,
    pub data_type: String,
}

// ---

impl DataId {
    // ---
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

// ---

impl fmt::Display for DataId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.data_type, self.name)
    }
}

// ---------------------------------------------------------------------------
// DataPoint / DataPointGroup
// ---------------------------------------------------------------------------

/// One sample: elapsed time since the channel's base time plus an opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPoint {
    // ---
    /// Nanoseconds since the base time. Negative when the sample predates it.
    pub elapsed_time: i64,

    pub payload: Bytes,
}

// ---

impl DataPoint {
    // ---
    pub fn new(elapsed_time: i64, payload: impl Into<Bytes>) -> Self {
        Self {
            elapsed_time,
            payload: payload.into(),
        }
    }
}

// ---

/// Ordered samples sharing one [`DataId`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPointGroup {
    // ---
    pub data_id: DataId,
    pub points: Vec<DataPoint>,
}

// ---

impl DataPointGroup {
    // ---
    pub fn new(data_id: DataId, points: Vec<DataPoint>) -> Self {
        Self { data_id, points }
    }

    /// Group holding exactly one point.
    pub fn single(data_id: DataId, point: DataPoint) -> Self {
        Self {
            data_id,
            points: vec![point],
        }
    }

    /// Sum of payload sizes in bytes.
    pub fn payload_len(&self) -> usize {
        self.points.iter().map(|p| p.payload.len()).sum()
    }
}

// ---------------------------------------------------------------------------
// Elapsed time helpers
// ---------------------------------------------------------------------------

/// Elapsed nanoseconds from `base` to `at`, saturating at the `i64` range.
pub fn elapsed_since(base: DateTime<Utc>, at: DateTime<Utc>) -> i64 {
    // ---
    let delta = at.signed_duration_since(base);
    delta.num_nanoseconds().unwrap_or(if delta < chrono::TimeDelta::zero() {
        i64::MIN
    } else {
        i64::MAX
    })
}

/// Wall-clock instant that lies `elapsed_time` nanoseconds after `base`.
pub fn instant_after(base: DateTime<Utc>, elapsed_time: i64) -> DateTime<Utc> {
    base + chrono::TimeDelta::nanoseconds(elapsed_time)
}

// ---------------------------------------------------------------------------
// DownstreamFilter
// ---------------------------------------------------------------------------

/// What one downstream subscription asks for: a source node and one data series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DownstreamFilter {
    // ---
    pub source_node_id: String,
    pub data_filter: DataId,
}

// ---

impl DownstreamFilter {
    // ---
    pub fn new(source_node_id: impl Into<String>, data_filter: DataId) -> Self {
        Self {
            source_node_id: source_node_id.into(),
            data_filter,
        }
    }
}

// ---------------------------------------------------------------------------
// FlushPolicy
// ---------------------------------------------------------------------------

/// Rule controlling when buffered upstream writes are coalesced into a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushPolicy {
    // ---
    /// Every write becomes its own chunk.
    Immediately,

    /// Flush once the interval has elapsed since the last flush.
    Interval(Duration),

    /// Flush once this many payload bytes are buffered.
    BufferSize(u32),

    /// Flush on whichever of the two triggers first.
    IntervalOrBufferSize(Duration, u32),
}

// ---

impl Default for FlushPolicy {
    fn default() -> Self {
        Self::IntervalOrBufferSize(Duration::from_millis(50), 10_000)
    }
}

// ---------------------------------------------------------------------------
// Wire-level notifications
// ---------------------------------------------------------------------------

/// Emitted by the transport each time buffered upstream writes become one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamChunk {
    // ---
    pub sequence_number: u32,
    pub data_point_count: u32,
    pub payload_size: u32,
}

// ---

/// Server acknowledgement of one upstream chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamChunkAck {
    // ---
    pub sequence_number: u32,
    pub result_code: u32,
    pub result_string: String,
}

// ---

/// One chunk delivered on a downstream channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownstreamChunk {
    // ---
    pub sequence_number: u32,
    pub source_node_id: String,
    pub groups: Vec<DataPointGroup>,
}

// ---

impl DownstreamChunk {
    // ---
    pub fn is_empty(&self) -> bool {
        self.groups.iter().all(|g| g.points.is_empty())
    }

    /// Elapsed time of the first point in the chunk, if any.
    pub fn first_elapsed_time(&self) -> Option<i64> {
        self.groups
            .iter()
            .flat_map(|g| g.points.iter())
            .map(|p| p.elapsed_time)
            .next()
    }

    pub fn payload_len(&self) -> usize {
        self.groups.iter().map(DataPointGroup::payload_len).sum()
    }
}

// ---

/// Metadata delivered on a downstream channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownstreamMetadata {
    // ---
    BaseTime(BaseTimeFact),

    /// Any other metadata kind; forwarded verbatim.
    Other { kind: String, source_node_id: String },
}

// ---------------------------------------------------------------------------
// UpstreamState
// ---------------------------------------------------------------------------

/// Locally observed counters of one upstream channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpstreamState {
    // ---
    /// Data points written into the channel, acked or not.
    pub total_data_points: u64,

    /// Sequence number of the last chunk the channel generated.
    pub last_issued_sequence_number: u32,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use chrono::TimeZone;

    use super::*;

    // ---

    #[test]
    fn elapsed_round_trips_through_instant_after() {
        // ---
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let at = base + chrono::TimeDelta::milliseconds(1_500);

        let elapsed = elapsed_since(base, at);
        assert_eq!(elapsed, 1_500_000_000);
        assert_eq!(instant_after(base, elapsed), at);
    }

    // ---

    #[test]
    fn elapsed_is_negative_before_base() {
        // ---
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let at = base - chrono::TimeDelta::seconds(2);

        assert_eq!(elapsed_since(base, at), -2_000_000_000);
    }

    // ---

    #[test]
    fn chunk_with_only_empty_groups_is_empty() {
        // ---
        let chunk = DownstreamChunk {
            sequence_number: 1,
            source_node_id: "node".into(),
            groups: vec![DataPointGroup::new(DataId::new("a", "float"), vec![])],
        };
        assert!(chunk.is_empty());
        assert_eq!(chunk.first_elapsed_time(), None);
    }

    // ---

    #[test]
    fn first_elapsed_time_skips_empty_groups() {
        // ---
        let chunk = DownstreamChunk {
            sequence_number: 1,
            source_node_id: "node".into(),
            groups: vec![
                DataPointGroup::new(DataId::new("a", "float"), vec![]),
                DataPointGroup::new(
                    DataId::new("b", "float"),
                    vec![DataPoint::new(42, vec![1u8, 2]), DataPoint::new(43, vec![3u8])],
                ),
            ],
        };
        assert_eq!(chunk.first_elapsed_time(), Some(42));
        assert_eq!(chunk.payload_len(), 3);
    }

    // ---

    #[test]
    fn default_flush_policy_is_interval_or_size() {
        // ---
        assert_eq!(
            FlushPolicy::default(),
            FlushPolicy::IntervalOrBufferSize(Duration::from_millis(50), 10_000)
        );
    }
}
