use std::sync::Arc;

// ---------------------------------------------------------------------------
// ByteCost
// ---------------------------------------------------------------------------

/// Anything the fair queue can charge against a peer's virtual time.
///
/// Only the byte length matters for scheduling; payload contents are never
/// inspected.
pub trait ByteCost {
    fn byte_cost(&self) -> u64;
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// Immutable opaque byte blob destined for (or received from) one peer.
///
/// The payload is reference counted so handing a message to the transport
/// and keeping it queued until the hand-off succeeds costs no copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    // ---
    payload: Arc<[u8]>,
}

// ---

impl Message {
    // ---
    pub fn new(payload: impl Into<Arc<[u8]>>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    /// A message of `len` zero bytes. Handy for simulations and tests.
    pub fn zeroed(len: usize) -> Self {
        Self::new(vec![0u8; len])
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

impl ByteCost for Message {
    fn byte_cost(&self) -> u64 {
        self.payload.len() as u64
    }
}

impl From<Vec<u8>> for Message {
    fn from(payload: Vec<u8>) -> Self {
        Self::new(payload)
    }
}

impl From<&[u8]> for Message {
    fn from(payload: &[u8]) -> Self {
        Self::new(payload)
    }
}
