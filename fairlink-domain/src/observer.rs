use std::time::{Duration, Instant};

use super::error::FairLinkError;
use super::peer::PeerId;
use super::queue::Direction;

// ---------------------------------------------------------------------------
// TransmitWindow
// ---------------------------------------------------------------------------

/// Serialized transmission interval attributed to one message.
///
/// Messages in one direction are laid end to end: each starts where the
/// previous one finished (or at the tick if the direction was idle) and
/// lasts `bytes / rate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransmitWindow {
    pub start: Instant,
    pub end: Instant,
}

// ---------------------------------------------------------------------------
// QueueObserver
// ---------------------------------------------------------------------------

/// Scheduling event sink.
///
/// All methods default to no-ops; implementors override what they need.
/// Called synchronously from inside the scheduler, so implementations must
/// be cheap and must not call back into the queue.
pub trait QueueObserver: Send {
    // ---
    /// A message entered a peer's sub-queue.
    fn message_queued(&mut self, direction: Direction, peer: PeerId, bytes: u64) {
        let _ = (direction, peer, bytes);
    }

    /// A message was handed to the transport.
    fn message_sent(&mut self, peer: PeerId, bytes: u64, weight: f64, window: TransmitWindow) {
        let _ = (peer, bytes, weight, window);
    }

    /// An inbound message was moved to the delivery FIFO.
    fn message_received(&mut self, peer: PeerId, bytes: u64, weight: f64, window: TransmitWindow) {
        let _ = (peer, bytes, weight, window);
    }

    /// The consumer took an inbound message off the delivery FIFO.
    fn message_delivered(&mut self, peer: PeerId, bytes: u64) {
        let _ = (peer, bytes);
    }

    /// `service` was called with a timestamp earlier than the last one.
    fn clock_regression(&mut self, direction: Direction, behind: Duration) {
        let _ = (direction, behind);
    }

    /// The transport's feasibility check failed for `peer` this tick.
    fn peer_infeasible(&mut self, peer: PeerId, reason: &str) {
        let _ = (peer, reason);
    }
}

// ---

/// Ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl QueueObserver for NullObserver {}

// ---

/// Logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl QueueObserver for TracingObserver {
    // ---
    fn message_queued(&mut self, direction: Direction, peer: PeerId, bytes: u64) {
        tracing::trace!(%direction, %peer, bytes, "queued");
    }

    fn message_sent(&mut self, peer: PeerId, bytes: u64, weight: f64, window: TransmitWindow) {
        tracing::debug!(
            %peer,
            bytes,
            weight,
            duration = ?window.end.saturating_duration_since(window.start),
            "sent",
        );
    }

    fn message_received(&mut self, peer: PeerId, bytes: u64, weight: f64, window: TransmitWindow) {
        tracing::debug!(
            %peer,
            bytes,
            weight,
            duration = ?window.end.saturating_duration_since(window.start),
            "received",
        );
    }

    fn message_delivered(&mut self, peer: PeerId, bytes: u64) {
        tracing::trace!(%peer, bytes, "delivered");
    }

    fn clock_regression(&mut self, direction: Direction, behind: Duration) {
        let err = FairLinkError::ClockRegression { behind };
        tracing::warn!(%direction, "{err}; elapsed time clamped to zero");
    }

    fn peer_infeasible(&mut self, peer: PeerId, reason: &str) {
        tracing::warn!(%peer, reason, "feasibility check failed; peer skipped this tick");
    }
}
