// ---------------------------------------------------------------------------
// LinkSimConfig
// ---------------------------------------------------------------------------

/// Configuration for the in-process link simulator.
///
/// Applies to every simulated peer connection. The default is a roomy,
/// instantly-drained, fault-free link.
#[derive(Debug, Clone)]
pub struct LinkSimConfig {
    // ---
    /// Socket write-buffer capacity per peer, in bytes. `can_send` reports
    /// infeasible once a message would not fit.
    pub buffer_bytes: u64,

    /// Rate at which each peer's buffer drains onto the wire, bytes per
    /// second. `None` = the whole buffer drains on every `drain` call.
    pub wire_bytes_per_sec: Option<u64>,

    /// Probability `[0.0, 1.0]` that a feasibility check fails with an
    /// error instead of answering.
    pub fault_percent: f64,

    /// RNG seed for reproducible fault sequences. `None` = random.
    pub seed: Option<u64>,
}

// ---

impl Default for LinkSimConfig {
    fn default() -> Self {
        // ---
        Self {
            buffer_bytes: 64 * 1024,
            wire_bytes_per_sec: None,
            fault_percent: 0.0,
            seed: None,
        }
    }
}

// ---

impl LinkSimConfig {
    // ---
    /// Perfect link. Useful as a baseline.
    pub fn perfect() -> Self {
        Self::default()
    }

    // ---

    /// Small buffers behind a slow wire: peers regularly report full
    /// sockets. 4 KiB buffer, 16 KiB/s per peer.
    pub fn congested() -> Self {
        // ---
        Self {
            buffer_bytes: 4 * 1024,
            wire_bytes_per_sec: Some(16 * 1024),
            ..Default::default()
        }
    }

    // ---

    /// Feasibility checks fail 5 % of the time.
    pub fn flaky() -> Self {
        // ---
        Self {
            fault_percent: 0.05,
            ..Default::default()
        }
    }
}
