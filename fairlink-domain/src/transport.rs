use super::error::Result;
use super::message::Message;
use super::peer::PeerId;

// ---------------------------------------------------------------------------
// PeerTransport
// ---------------------------------------------------------------------------

/// The byte-moving collaborator underneath the scheduler.
///
/// Both methods must return promptly. A transport that would have to block
/// reports infeasibility instead and lets the scheduler retry on the next
/// tick. Resolving a [`PeerId`] to a live connection is the transport's
/// business; the scheduler never looks inside the id.
pub trait PeerTransport: Send {
    // ---
    /// Whether `msg` can be handed to `peer`'s connection right now
    /// (e.g. its socket write buffer has room).
    ///
    /// `Err` is treated exactly like `Ok(false)` for this tick; the peer's
    /// queued messages are never dropped because of it.
    fn can_send(&mut self, peer: PeerId, msg: &Message) -> Result<bool>;

    /// Hand `msg` to `peer`'s connection.
    ///
    /// Only called after `can_send` returned `Ok(true)` within the same
    /// tick. On `Err` the message stays at the head of the peer's queue.
    fn send(&mut self, peer: PeerId, msg: &Message) -> Result<()>;
}

// ---

impl<T: PeerTransport + ?Sized> PeerTransport for Box<T> {
    // ---
    fn can_send(&mut self, peer: PeerId, msg: &Message) -> Result<bool> {
        (**self).can_send(peer, msg)
    }

    fn send(&mut self, peer: PeerId, msg: &Message) -> Result<()> {
        (**self).send(peer, msg)
    }
}
