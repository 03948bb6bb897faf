//! Discrete-tick byte budget with remainder carry.
//!
//! [`RateLimiter`] turns the time elapsed between two service ticks into a
//! whole-byte allowance. Two remainders roll forward so long-run throughput
//! converges to the configured rate however the ticks are spaced:
//!
//! - the sub-byte fraction of each accrual, kept exactly in nano-bytes
//!   (`rate * elapsed_ns` is integral in those units, so no rounding drift);
//! - unspent whole bytes, capped by the caller at [`RateLimiter::settle`]
//!   (normally the cost of the message the budget was saving for).
//!
//! ```text
//!   accrued   = rate * elapsed + fraction
//!   available = carry + floor(accrued)
//!   fraction  = accrued - floor(accrued)        in [0, 1)
//!   carry     = min(available - spent, cap)     at settle()
//! ```

use std::time::{Duration, Instant};

const NANOS_PER_SEC: u128 = 1_000_000_000;

// ---------------------------------------------------------------------------
// Budget
// ---------------------------------------------------------------------------

/// Result of one [`RateLimiter::budget`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budget {
    // ---
    /// Whole bytes that may be spent this tick. `u64::MAX` when unlimited.
    pub bytes: u64,

    /// Set when `now` was earlier than the previous tick. Elapsed time was
    /// clamped to zero; `bytes` is only the carried remainder.
    pub clock_regression: Option<Duration>,
}

// ---------------------------------------------------------------------------
// RateLimiter
// ---------------------------------------------------------------------------

/// Byte-rate budget for one direction of the scheduler.
///
/// A pure function of `(state, now)`: nothing here samples the wall clock.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    // ---
    /// Configured ceiling. `0` means unlimited.
    bytes_per_sec: u64,

    /// Latest `now` seen. Never moves backward.
    last_service: Instant,

    /// Sub-byte remainder in nano-bytes, always `< NANOS_PER_SEC`.
    fraction_nanos: u128,

    /// Whole bytes rolled over from the previous tick.
    carry: u64,

    /// Budget left in the current tick.
    available: u64,
}

// ---

impl RateLimiter {
    // ---
    pub fn new(bytes_per_sec: u64, start: Instant) -> Self {
        // ---
        Self {
            bytes_per_sec,
            last_service: start,
            fraction_nanos: 0,
            carry: 0,
            available: 0,
        }
    }

    // ---

    /// Change the ceiling. Remainders survive unless switching to
    /// unlimited, where they are meaningless.
    pub fn configure(&mut self, bytes_per_sec: u64) {
        // ---
        self.bytes_per_sec = bytes_per_sec;
        if self.is_unlimited() {
            self.fraction_nanos = 0;
            self.carry = 0;
        }
    }

    pub fn rate(&self) -> u64 {
        self.bytes_per_sec
    }

    pub fn is_unlimited(&self) -> bool {
        self.bytes_per_sec == 0
    }

    pub fn last_service(&self) -> Instant {
        self.last_service
    }

    // ---

    /// Open a tick at `now` and return its whole-byte budget.
    pub fn budget(&mut self, now: Instant) -> Budget {
        // ---
        let (elapsed, clock_regression) = match now.checked_duration_since(self.last_service) {
            Some(elapsed) => {
                self.last_service = now;
                (elapsed, None)
            }
            None => (Duration::ZERO, Some(self.last_service - now)),
        };

        if self.is_unlimited() {
            self.available = u64::MAX;
            return Budget {
                bytes: self.available,
                clock_regression,
            };
        }

        let accrued = self.bytes_per_sec as u128 * elapsed.as_nanos() + self.fraction_nanos;
        let whole = accrued / NANOS_PER_SEC;
        self.fraction_nanos = accrued % NANOS_PER_SEC;

        let whole = u64::try_from(whole).unwrap_or(u64::MAX);
        self.available = self.carry.saturating_add(whole);
        self.carry = 0;

        Budget {
            bytes: self.available,
            clock_regression,
        }
    }

    // ---

    /// Whole bytes still spendable in the current tick.
    pub fn remaining(&self) -> u64 {
        self.available
    }

    pub fn can_afford(&self, bytes: u64) -> bool {
        self.is_unlimited() || bytes <= self.available
    }

    /// Charge `bytes` against the current tick.
    pub fn spend(&mut self, bytes: u64) {
        // ---
        if self.is_unlimited() {
            return;
        }
        debug_assert!(bytes <= self.available, "overspent rate budget");
        self.available = self.available.saturating_sub(bytes);
    }

    // ---

    /// Close the tick, rolling at most `cap` unspent bytes into the next.
    ///
    /// `cap = 0` forfeits whole bytes (the direction went idle); the
    /// sub-byte fraction is always kept.
    pub fn settle(&mut self, cap: u64) {
        // ---
        self.carry = if self.is_unlimited() {
            0
        } else {
            self.available.min(cap)
        };
        self.available = 0;
    }

    /// Whole bytes that will open the next tick.
    pub fn carried(&self) -> u64 {
        self.carry
    }

    /// The transmit time of `bytes` at the configured rate. Zero when
    /// unlimited.
    pub fn transmit_time(&self, bytes: u64) -> Duration {
        // ---
        if self.is_unlimited() {
            return Duration::ZERO;
        }
        let nanos = bytes as u128 * NANOS_PER_SEC / self.bytes_per_sec as u128;
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
