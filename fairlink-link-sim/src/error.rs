//! Error types for `fairlink-link-sim`.

use thiserror::Error;

use fairlink_domain::{FairLinkError, PeerId};

#[derive(Debug, Error)]
pub enum LinkSimError {
    // ---
    #[error("no connection to {0}")]
    NoConnection(PeerId),

    #[error("injected feasibility fault for {0}")]
    InjectedFault(PeerId),

    #[error("link to {0} is down")]
    LinkDown(PeerId),

    #[error("{peer} buffer full: {buffered} of {capacity} bytes")]
    BufferFull {
        peer: PeerId,
        buffered: u64,
        capacity: u64,
    },
}

// ---------------------------------------------------------------------------
// Bridge to fairlink_domain::FairLinkError
// ---------------------------------------------------------------------------

impl From<LinkSimError> for FairLinkError {
    // ---
    fn from(e: LinkSimError) -> Self {
        match e {
            LinkSimError::LinkDown(peer) | LinkSimError::BufferFull { peer, .. } => {
                FairLinkError::TransportInfeasible { peer }
            }
            other => FairLinkError::Transport(other.to_string()),
        }
    }
}
