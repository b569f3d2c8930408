//! Base-time facts and the arbitration rule applied when several senders
//! contribute one.
//!
//! A base time anchors a channel's relative elapsed-time stamps to wall-clock
//! time. Upstream senders publish their own (`edge_rtc`, priority 20); the
//! server may publish others. A downstream registration keeps the most
//! authoritative one it has seen, where a lower priority number is more
//! authoritative. The server's first-received signal always wins.

use chrono::{DateTime, Utc};

// ---

use super::data::instant_after;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Origin tag of the base time an edge device derives from its own clock.
pub const EDGE_RTC_ORIGIN: &str = "edge_rtc";

/// Priority attached to every [`EDGE_RTC_ORIGIN`] fact.
pub const EDGE_RTC_PRIORITY: u8 = 20;

/// Origin tag of the server's bootstrap signal. Always overwrites.
pub const BOOTSTRAP_ORIGIN: &str = "api_first_received";

// ---------------------------------------------------------------------------
// BaseTimeKind
// ---------------------------------------------------------------------------

/// Which clock a measurement's base time was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseTimeKind {
    // ---
    EdgeRtc,
    ApiFirstReceived,
    Manual,
}

// ---

impl BaseTimeKind {
    // ---
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EdgeRtc => EDGE_RTC_ORIGIN,
            Self::ApiFirstReceived => BOOTSTRAP_ORIGIN,
            Self::Manual => "manual",
        }
    }
}

// ---------------------------------------------------------------------------
// BaseTimeFact
// ---------------------------------------------------------------------------

/// One sender's claim about a session's base time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseTimeFact {
    // ---
    /// Session the fact belongs to; empty for non-persisted channels.
    pub session_id: String,

    /// Origin tag, e.g. [`EDGE_RTC_ORIGIN`].
    pub name: String,

    /// Lower is more authoritative.
    pub priority: u8,

    /// Offset of the fact itself relative to the base time, in nanoseconds.
    pub elapsed_time: i64,

    pub base_time: DateTime<Utc>,
}

// ---

impl BaseTimeFact {
    // ---
    /// The fact an edge sender publishes right after opening an upstream.
    pub fn edge_rtc(session_id: impl Into<String>, base_time: DateTime<Utc>) -> Self {
        Self {
            session_id: session_id.into(),
            name: EDGE_RTC_ORIGIN.into(),
            priority: EDGE_RTC_PRIORITY,
            elapsed_time: 0,
            base_time,
        }
    }

    /// `true` for the server's bootstrap signal.
    pub fn is_bootstrap(&self) -> bool {
        self.name == BOOTSTRAP_ORIGIN
    }
}

// ---------------------------------------------------------------------------
// StoredBaseTime
// ---------------------------------------------------------------------------

/// Base time held by one downstream registration.
///
/// `priority` is `None` until a metadata fact has been accepted. A base time
/// bootstrapped from received data carries no priority, so any later fact
/// replaces it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoredBaseTime {
    // ---
    pub base_time: Option<DateTime<Utc>>,
    pub priority: Option<u8>,
}

// ---

impl StoredBaseTime {
    // ---
    /// Offer `fact`; returns `true` if it replaced the stored value.
    ///
    /// Accepted when nothing authoritative is stored yet, when the fact's
    /// priority is equal or lower (more authoritative), or when the fact is
    /// the bootstrap signal.
    pub fn offer(&mut self, fact: &BaseTimeFact) -> bool {
        // ---
        let wins = fact.is_bootstrap()
            || match self.priority {
                None => true,
                Some(stored) => fact.priority <= stored,
            };

        if wins {
            self.base_time = Some(fact.base_time);
            self.priority = Some(fact.priority);
        }
        wins
    }

    /// Return the stored base time, deriving one on first use.
    ///
    /// When nothing is stored the base time is back-computed so that a point
    /// with `first_elapsed` lands at `received_at`. Returns `None` if nothing
    /// is stored and there is no point to derive from.
    pub fn resolve(
        &mut self,
        first_elapsed: Option<i64>,
        received_at: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        // ---
        if let Some(base) = self.base_time {
            return Some(base);
        }
        let elapsed = first_elapsed?;
        let base = instant_after(received_at, elapsed.saturating_neg());
        self.base_time = Some(base);
        Some(base)
    }
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

    fn fact(name: &str, priority: u8, secs: i64) -> BaseTimeFact {
        BaseTimeFact {
            session_id: String::new(),
            name: name.into(),
            priority,
            elapsed_time: 0,
            base_time: Utc.timestamp_opt(secs, 0).unwrap(),
        }
    }

    // ---

    #[test]
    fn lowest_priority_number_wins_regardless_of_order() {
        // ---
        let mut stored = StoredBaseTime::default();

        assert!(stored.offer(&fact("a", 20, 100)));
        assert!(stored.offer(&fact("b", 10, 200)));
        assert!(!stored.offer(&fact("c", 30, 300)));

        assert_eq!(stored.priority, Some(10));
        assert_eq!(stored.base_time, Some(Utc.timestamp_opt(200, 0).unwrap()));
    }

    // ---

    #[test]
    fn equal_priority_overwrites() {
        // ---
        let mut stored = StoredBaseTime::default();
        stored.offer(&fact("a", 20, 100));

        assert!(stored.offer(&fact("a", 20, 150)));
        assert_eq!(stored.base_time, Some(Utc.timestamp_opt(150, 0).unwrap()));
    }

    // ---

    #[test]
    fn bootstrap_always_wins() {
        // ---
        let mut stored = StoredBaseTime::default();
        stored.offer(&fact("a", 1, 100));

        assert!(stored.offer(&fact(BOOTSTRAP_ORIGIN, 200, 500)));
        assert_eq!(stored.priority, Some(200));
        assert_eq!(stored.base_time, Some(Utc.timestamp_opt(500, 0).unwrap()));

        // A later, more authoritative fact still replaces it.
        assert!(stored.offer(&fact("b", 10, 600)));
        assert_eq!(stored.priority, Some(10));
    }

    // ---

    #[test]
    fn resolve_bootstraps_from_first_point() {
        // ---
        let received_at = Utc.timestamp_opt(1_000, 0).unwrap();
        let mut stored = StoredBaseTime::default();

        let base = stored.resolve(Some(3_000_000_000), received_at);
        assert_eq!(base, Some(Utc.timestamp_opt(997, 0).unwrap()));
        assert_eq!(stored.priority, None, "derived base time carries no priority");

        // Subsequent calls reuse the stored value.
        let later = Utc.timestamp_opt(2_000, 0).unwrap();
        assert_eq!(stored.resolve(Some(0), later), base);
    }

    // ---

    #[test]
    fn derived_base_time_yields_to_any_fact() {
        // ---
        let mut stored = StoredBaseTime::default();
        stored.resolve(Some(0), Utc.timestamp_opt(1_000, 0).unwrap());

        assert!(stored.offer(&fact(EDGE_RTC_ORIGIN, EDGE_RTC_PRIORITY, 900)));
        assert_eq!(stored.priority, Some(EDGE_RTC_PRIORITY));
    }

    // ---

    #[test]
    fn resolve_without_points_is_none() {
        // ---
        let mut stored = StoredBaseTime::default();
        assert_eq!(stored.resolve(None, Utc::now()), None);
        assert_eq!(stored.base_time, None);
    }
}
