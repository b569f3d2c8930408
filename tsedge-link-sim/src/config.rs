// ---------------------------------------------------------------------------
// LinkSimConfig
// ---------------------------------------------------------------------------

/// Configuration for the in-process link simulator.
///
/// Defaults to a perfect link: connects succeed and every chunk is
/// acknowledged as soon as it is generated.
#[derive(Debug, Clone)]
pub struct LinkSimConfig {
    // ---
    /// Acknowledge each chunk immediately after generating it. When `false`,
    /// chunks stay pending until [`crate::SimUpstream::ack_pending`] is called.
    pub auto_ack: bool,

    /// Reject every connect attempt.
    pub fail_connect: bool,

    /// Reject every base-time metadata send.
    pub fail_base_time: bool,
}

// ---

impl Default for LinkSimConfig {
    fn default() -> Self {
        // ---
        Self {
            auto_ack: true,
            fail_connect: false,
            fail_base_time: false,
        }
    }
}

// ---

impl LinkSimConfig {
    // ---
    /// Perfect link with no impairments. Useful as a baseline.
    pub fn perfect() -> Self {
        Self::default()
    }

    // ---

    /// Chunks are only acknowledged on request, so tests can close the
    /// connection with acknowledgements outstanding.
    pub fn manual_ack() -> Self {
        // ---
        Self {
            auto_ack: false,
            ..Default::default()
        }
    }

    // ---

    /// Server unreachable.
    pub fn unreachable() -> Self {
        // ---
        Self {
            fail_connect: true,
            ..Default::default()
        }
    }
}
