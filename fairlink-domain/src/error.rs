use std::fmt;
use std::time::Duration;

use thiserror::Error;

use super::peer::PeerId;

// ---

/// Which outstanding-bytes bound rejected an enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowScope {
    // ---
    /// The per-peer bound for one direction.
    Peer,

    /// The bound across all peers for one direction.
    Global,
}

impl fmt::Display for OverflowScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverflowScope::Peer => f.write_str("per-peer"),
            OverflowScope::Global => f.write_str("global"),
        }
    }
}

// ---

#[derive(Debug, Error)]
pub enum FairLinkError {
    // ---
    #[error("invalid weight {weight} for {peer}: weight must be > 0")]
    InvalidWeight { peer: PeerId, weight: f64 },

    #[error("{scope} queue overflow for {peer}: {queued} + {incoming} bytes exceeds {limit}")]
    QueueOverflow {
        peer: PeerId,
        scope: OverflowScope,
        queued: u64,
        incoming: u64,
        limit: u64,
    },

    #[error("clock went backward by {behind:?}")]
    ClockRegression { behind: Duration },

    #[error("{peer} cannot accept bytes right now")]
    TransportInfeasible { peer: PeerId },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

// ---

impl FairLinkError {
    // ---
    /// `true` for conditions the caller should retry later rather than
    /// treat as a failure (backpressure, momentarily full sockets).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FairLinkError::QueueOverflow { .. } | FairLinkError::TransportInfeasible { .. }
        )
    }
}

// ---

pub type Result<T> = std::result::Result<T, FairLinkError>;
