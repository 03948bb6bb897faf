use std::fmt;
use std::str::FromStr;

use serde::Serialize;

/// Opaque identifier of a directly connected remote server.
///
/// The scheduler only ever compares, orders and hashes `PeerId`s; what the
/// number means is up to the peer directory that resolves it to a live
/// connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct PeerId(u32);

// ---

impl PeerId {
    // ---
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Return the raw identifier.
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl From<u32> for PeerId {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "server-{}", self.0)
    }
}

// ---

impl FromStr for PeerId {
    type Err = std::num::ParseIntError;

    /// Accepts either the bare number (`"7"`) or the display form
    /// (`"server-7"`).
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        // ---
        let raw = s.strip_prefix("server-").unwrap_or(s);
        raw.trim().parse::<u32>().map(Self)
    }
}
