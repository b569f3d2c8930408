//! Throughput sampling for sent and received payload bytes.
//!
//! The connection reports payload sizes through [`ByteSampler::add_bytes`]
//! from whichever thread handled the data. [`RollingThroughput`] is the
//! bundled sampler: a ring of equal-width bins covering a sliding window,
//! from which a bits-per-second figure can be read at any time.

use std::sync::Arc;
use std::time::{Duration, Instant};

// ---

use parking_lot::Mutex;

// ---------------------------------------------------------------------------
// ByteSampler
// ---------------------------------------------------------------------------

/// Sink for payload byte counts. Called from transport callback threads.
pub trait ByteSampler: Send + Sync {
    // ---
    fn add_bytes(&self, n: u64);
}

// ---

/// Convenience type alias for a shared [`ByteSampler`].
pub type ByteSamplerPtr = Arc<dyn ByteSampler>;

// ---------------------------------------------------------------------------
// RollingThroughput
// ---------------------------------------------------------------------------

/// Sliding-window throughput over `bins` sub-intervals of `window`.
///
/// Bins older than the window are zeroed lazily on the next add or read,
/// so an idle sampler decays to zero without a timer.
pub struct RollingThroughput {
    // ---
    window: Duration,
    bin_width: Duration,
    inner: Mutex<Bins>,
}

// ---

struct Bins {
    // ---
    counts: Vec<u64>,

    /// Index of the bin covering `current_start`.
    current: usize,

    /// Start of the current bin.
    current_start: Instant,
}

// ---

impl RollingThroughput {
    // ---
    /// `bins` is clamped to at least one.
    pub fn new(window: Duration, bins: usize) -> Self {
        Self::starting_at(window, bins, Instant::now())
    }

    // ---

    pub(crate) fn starting_at(window: Duration, bins: usize, start: Instant) -> Self {
        // ---
        let bins = bins.max(1);
        Self {
            window,
            bin_width: window / bins as u32,
            inner: Mutex::new(Bins {
                counts: vec![0; bins],
                current: 0,
                current_start: start,
            }),
        }
    }

    // ---

    pub(crate) fn add_bytes_at(&self, n: u64, now: Instant) {
        // ---
        let mut bins = self.inner.lock();
        self.advance(&mut bins, now);
        let idx = bins.current;
        bins.counts[idx] = bins.counts[idx].saturating_add(n);
    }

    // ---

    /// Bits per second averaged over the window, as of now.
    pub fn bits_per_second(&self) -> u64 {
        self.bits_per_second_at(Instant::now())
    }

    // ---

    pub(crate) fn bits_per_second_at(&self, now: Instant) -> u64 {
        // ---
        let mut bins = self.inner.lock();
        self.advance(&mut bins, now);

        let bytes: u64 = bins.counts.iter().sum();
        let secs = self.window.as_secs_f64();
        if secs == 0.0 {
            return 0;
        }
        (bytes as f64 * 8.0 / secs) as u64
    }

    // ---

    /// Rotate forward to the bin containing `now`, zeroing every bin skipped.
    fn advance(&self, bins: &mut Bins, now: Instant) {
        // ---
        if self.bin_width.is_zero() {
            return;
        }
        let elapsed = now.saturating_duration_since(bins.current_start);
        let steps = (elapsed.as_nanos() / self.bin_width.as_nanos()) as usize;
        if steps == 0 {
            return;
        }

        let len = bins.counts.len();
        for i in 1..=steps.min(len) {
            let idx = (bins.current + i) % len;
            bins.counts[idx] = 0;
        }
        bins.current = (bins.current + steps) % len;
        bins.current_start += self.bin_width * steps as u32;
    }
}

// ---

impl ByteSampler for RollingThroughput {
    // ---
    fn add_bytes(&self, n: u64) {
        self.add_bytes_at(n, Instant::now());
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
