use std::collections::VecDeque;
use std::time::Duration;

// ---

use fairlink_domain::{ByteCost, Message};

const NANOS_PER_SEC: u128 = 1_000_000_000;

// ---------------------------------------------------------------------------
// ConnectionStats
// ---------------------------------------------------------------------------

/// Counters for one simulated connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    // ---
    /// Messages / bytes accepted into the socket buffer.
    pub accepted_messages: u64,
    pub accepted_bytes: u64,

    /// Messages / bytes fully drained onto the wire.
    pub wire_messages: u64,
    pub wire_bytes: u64,
}

// ---------------------------------------------------------------------------
// SimConnection
// ---------------------------------------------------------------------------

/// One peer's socket: a bounded write buffer that drains onto the wire.
///
/// Bytes leave the buffer progressively, so a large head message frees
/// room as it drains. A message is handed back by [`SimConnection::drain`]
/// only once its last byte is on the wire.
#[derive(Debug)]
pub(crate) struct SimConnection {
    // ---
    capacity: u64,

    /// `None` = drains completely on every call.
    wire_bytes_per_sec: Option<u64>,

    buffer: VecDeque<Message>,

    /// Bytes still in the buffer, net of the head's drained prefix.
    buffered: u64,

    /// Bytes of the head message already on the wire.
    head_progress: u64,

    /// Sub-byte drain allowance carried between calls, in nano-bytes.
    fraction_nanos: u128,

    /// A stalled connection accepts nothing and drains nothing.
    stalled: bool,

    pub(crate) stats: ConnectionStats,
}

// ---

impl SimConnection {
    // ---
    pub(crate) fn new(capacity: u64, wire_bytes_per_sec: Option<u64>) -> Self {
        // ---
        Self {
            capacity,
            wire_bytes_per_sec,
            buffer: VecDeque::new(),
            buffered: 0,
            head_progress: 0,
            fraction_nanos: 0,
            stalled: false,
            stats: ConnectionStats::default(),
        }
    }

    // ---

    /// Whether a message of `len` bytes can be accepted now.
    ///
    /// An empty buffer accepts any size, like a socket taking a large
    /// write into an idle send buffer.
    pub(crate) fn fits(&self, len: u64) -> bool {
        // ---
        if self.stalled {
            return false;
        }
        self.buffered == 0 || self.buffered.saturating_add(len) <= self.capacity
    }

    pub(crate) fn push(&mut self, msg: Message) {
        // ---
        let len = msg.byte_cost();
        self.buffered += len;
        self.stats.accepted_messages += 1;
        self.stats.accepted_bytes += len;
        self.buffer.push_back(msg);
    }

    pub(crate) fn buffered(&self) -> u64 {
        self.buffered
    }

    pub(crate) fn set_stalled(&mut self, stalled: bool) {
        self.stalled = stalled;
    }

    // ---

    /// Move `elapsed` worth of bytes onto the wire and return the messages
    /// that finished, in order.
    pub(crate) fn drain(&mut self, elapsed: Duration) -> Vec<Message> {
        // ---
        let mut done = Vec::new();
        if self.stalled {
            return done;
        }

        let mut allowance = match self.wire_bytes_per_sec {
            None => u64::MAX,
            Some(rate) => {
                let accrued = rate as u128 * elapsed.as_nanos() + self.fraction_nanos;
                self.fraction_nanos = accrued % NANOS_PER_SEC;
                u64::try_from(accrued / NANOS_PER_SEC).unwrap_or(u64::MAX)
            }
        };

        while let Some(head) = self.buffer.front() {
            let need = head.byte_cost() - self.head_progress;
            if allowance < need {
                self.head_progress += allowance;
                self.buffered -= allowance;
                break;
            }
            allowance -= need;
            self.buffered -= need;
            self.head_progress = 0;

            if let Some(msg) = self.buffer.pop_front() {
                self.stats.wire_messages += 1;
                self.stats.wire_bytes += msg.byte_cost();
                done.push(msg);
            }
        }

        done
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
