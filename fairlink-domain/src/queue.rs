use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;

use super::error::{FairLinkError, Result};
use super::message::Message;
use super::peer::PeerId;

// ---------------------------------------------------------------------------
// Direction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Send,
    Receive,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Send => f.write_str("send"),
            Direction::Receive => f.write_str("receive"),
        }
    }
}

// ---------------------------------------------------------------------------
// QueueConfig
// ---------------------------------------------------------------------------

/// Scheduler configuration.
///
/// Rates are bytes per second; `0` disables rate limiting for that
/// direction. Byte bounds apply per direction.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    // ---
    pub send_bytes_per_sec: u64,
    pub recv_bytes_per_sec: u64,

    /// Outstanding bytes allowed in one peer's sub-queue. `None` = unbounded.
    pub max_peer_bytes: Option<u64>,

    /// Outstanding bytes allowed across all peers. `None` = unbounded.
    pub max_total_bytes: Option<u64>,

    /// Messages moved per direction per `service` call. Bounds the call
    /// duration even when zero-length messages cost no budget.
    pub max_items_per_service: usize,

    /// Receive phase pauses while the delivery FIFO holds this many
    /// messages. `None` = unbounded.
    pub max_delivery_backlog: Option<usize>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        // ---
        Self {
            send_bytes_per_sec: 0,
            recv_bytes_per_sec: 0,
            max_peer_bytes: None,
            max_total_bytes: None,
            max_items_per_service: 1_024,
            max_delivery_backlog: None,
        }
    }
}

impl QueueConfig {
    // ---
    pub fn validate(&self) -> Result<()> {
        // ---
        if self.max_items_per_service == 0 {
            return Err(FairLinkError::InvalidConfig(
                "max_items_per_service must be at least 1".into(),
            ));
        }
        if self.max_delivery_backlog == Some(0) {
            return Err(FairLinkError::InvalidConfig(
                "max_delivery_backlog must be at least 1".into(),
            ));
        }
        if let (Some(peer), Some(total)) = (self.max_peer_bytes, self.max_total_bytes) {
            if peer > total {
                return Err(FairLinkError::InvalidConfig(format!(
                    "max_peer_bytes ({peer}) exceeds max_total_bytes ({total})"
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// QueueInfo
// ---------------------------------------------------------------------------

/// Occupancy of one peer's sub-queue in one direction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueInfo {
    pub peer: PeerId,
    pub direction: Direction,
    pub queued_bytes: u64,
    pub queued_count: usize,
    pub weight: f64,
}

// ---------------------------------------------------------------------------
// ServiceReport
// ---------------------------------------------------------------------------

/// Why a service phase stopped moving messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Nothing left to move.
    #[default]
    Drained,

    /// The fair choice's head message does not fit the remaining budget.
    Budget,

    /// Messages are queued but no peer can accept one right now.
    Infeasible,

    /// The per-call item cap was reached.
    ItemCap,

    /// The delivery FIFO is full (receive phase only).
    DeliveryBacklog,
}

/// What one `service` call moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ServiceReport {
    pub sent_messages: usize,
    pub sent_bytes: u64,
    pub received_messages: usize,
    pub received_bytes: u64,
    pub send_stop: StopReason,
    pub receive_stop: StopReason,

    /// How far `now` was behind the previous tick, if it went backward.
    pub clock_regression: Option<Duration>,
}

impl ServiceReport {
    // ---
    /// The tick's clock regression as an error value, for callers that
    /// route it through their error handling.
    pub fn clock_error(&self) -> Option<FairLinkError> {
        self.clock_regression
            .map(|behind| FairLinkError::ClockRegression { behind })
    }
}

// ---------------------------------------------------------------------------
// ServerMessageQueue
// ---------------------------------------------------------------------------

/// The contract the rest of the platform programs against.
pub trait ServerMessageQueue {
    // ---
    /// Queue `msg` for sending to `peer`.
    ///
    /// Fails with [`FairLinkError::QueueOverflow`] when an outstanding-bytes
    /// bound would be exceeded; the caller applies backpressure.
    fn add_message(&mut self, peer: PeerId, msg: Message) -> Result<()>;

    /// Pop the next fairly-selected inbound message, if any. Never blocks.
    fn receive(&mut self) -> Option<(Message, PeerId)>;

    /// Run one scheduling tick at `now`.
    fn service(&mut self, now: Instant) -> ServiceReport;

    /// Set `peer`'s fairness weight. Fails with
    /// [`FairLinkError::InvalidWeight`] for non-positive weights.
    fn set_server_weight(&mut self, peer: PeerId, weight: f64) -> Result<()>;

    /// Exact occupancy at call time.
    fn queue_info(&self) -> Vec<QueueInfo>;
}
