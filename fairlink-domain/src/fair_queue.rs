use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use thiserror::Error;

use super::message::ByteCost;

/// Weight assigned to a peer that was never configured.
pub const DEFAULT_WEIGHT: f64 = 1.0;

// ---------------------------------------------------------------------------
// Internal types
// ---------------------------------------------------------------------------

/// Totally ordered wrapper so virtual times can key a `BTreeSet`.
#[derive(Debug, Clone, Copy)]
struct VirtualTime(f64);

impl PartialEq for VirtualTime {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for VirtualTime {}

impl PartialOrd for VirtualTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VirtualTime {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

// ---

#[derive(Debug)]
struct PeerQueue<T> {
    // ---
    items: VecDeque<T>,

    /// Divisor applied to byte cost when this peer is served.
    weight: f64,

    /// Cumulative served cost / weight. Never decreases.
    virtual_time: f64,

    /// Sum of `byte_cost` over `items`.
    queued_bytes: u64,
}

impl<T> PeerQueue<T> {
    fn new() -> Self {
        Self {
            items: VecDeque::new(),
            weight: DEFAULT_WEIGHT,
            virtual_time: 0.0,
            queued_bytes: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// InvalidWeight
// ---------------------------------------------------------------------------

/// Rejected weight. Weights must be finite and strictly positive.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
#[error("weight must be finite and > 0, got {0}")]
pub struct InvalidWeight(pub f64);

// ---------------------------------------------------------------------------
// PeerStats
// ---------------------------------------------------------------------------

/// Occupancy snapshot for one peer's sub-queue.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeerStats {
    pub queued_bytes: u64,
    pub queued_count: usize,
    pub weight: f64,
    pub virtual_time: f64,
}

// ---------------------------------------------------------------------------
// WeightedFairQueue
// ---------------------------------------------------------------------------

/// Weighted fair queue over per-peer FIFOs.
///
/// Each peer carries a virtual time: the byte cost already served for it
/// divided by its weight. [`WeightedFairQueue::next_peer`] picks the peer
/// with the smallest virtual time whose head item passes the caller's
/// feasibility predicate, ties going to the smaller key. Serving `n` bytes
/// advances the peer by `n / weight`, so heavier peers are picked more
/// often in proportion to their weight.
///
/// A peer that goes idle and comes back adopts at least the virtual time of
/// the most recent service, so idleness cannot be banked as credit.
///
/// Items are never reordered within a peer. The queue knows nothing about
/// time or rates; budgeting is the caller's job.
#[derive(Debug)]
pub struct WeightedFairQueue<K, T> {
    // ---
    /// Every peer seen, including drained peers and weight-only entries.
    peers: BTreeMap<K, PeerQueue<T>>,

    /// Non-empty peers ordered by `(virtual_time, key)`.
    active: BTreeSet<(VirtualTime, K)>,

    /// Virtual time of the most recently served peer.
    clock: f64,

    total_bytes: u64,
    total_count: usize,
}

// ---

impl<K, T> Default for WeightedFairQueue<K, T> {
    fn default() -> Self {
        Self {
            peers: BTreeMap::new(),
            active: BTreeSet::new(),
            clock: 0.0,
            total_bytes: 0,
            total_count: 0,
        }
    }
}

// ---

impl<K, T> WeightedFairQueue<K, T>
where
    K: Ord + Clone,
    T: ByteCost,
{
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    // ---

    /// Append `item` to `peer`'s FIFO, creating the sub-queue if needed.
    pub fn push(&mut self, peer: K, item: T) {
        // ---
        let cost = item.byte_cost();
        let clock = self.clock;
        let entry = self.peers.entry(peer.clone()).or_insert_with(PeerQueue::new);

        if entry.items.is_empty() {
            entry.virtual_time = entry.virtual_time.max(clock);
            self.active.insert((VirtualTime(entry.virtual_time), peer));
        }

        entry.items.push_back(item);
        entry.queued_bytes += cost;
        self.total_bytes += cost;
        self.total_count += 1;
    }

    // ---

    /// Head of `peer`'s FIFO.
    pub fn front(&self, peer: &K) -> Option<&T> {
        self.peers.get(peer).and_then(|q| q.items.front())
    }

    // ---

    /// Remove and return the head of `peer`'s FIFO, charging its byte cost
    /// to the peer's virtual time.
    pub fn pop(&mut self, peer: &K) -> Option<T> {
        // ---
        let entry = self.peers.get_mut(peer)?;
        let item = entry.items.pop_front()?;

        self.active
            .remove(&(VirtualTime(entry.virtual_time), peer.clone()));

        let cost = item.byte_cost();
        self.clock = self.clock.max(entry.virtual_time);
        entry.virtual_time += cost as f64 / entry.weight;
        entry.queued_bytes -= cost;
        self.total_bytes -= cost;
        self.total_count -= 1;

        if !entry.items.is_empty() {
            self.active
                .insert((VirtualTime(entry.virtual_time), peer.clone()));
        }

        Some(item)
    }

    // ---

    /// The peer to serve next among non-empty peers whose head item passes
    /// `feasible`, or `None` when no peer can make progress.
    ///
    /// `feasible` is consulted in fairness order and at most once per
    /// active peer.
    pub fn next_peer<F>(&self, mut feasible: F) -> Option<K>
    where
        F: FnMut(&K, &T) -> bool,
    {
        // ---
        for (_, peer) in &self.active {
            let Some(head) = self.front(peer) else {
                continue;
            };
            if feasible(peer, head) {
                return Some(peer.clone());
            }
        }
        None
    }

    // ---

    /// Set the weight used for future virtual-time advances of `peer`.
    ///
    /// Creates a weight-only entry for unseen peers so the weight applies
    /// from the first push. Accumulated virtual time is not rewritten.
    pub fn set_weight(&mut self, peer: K, weight: f64) -> Result<(), InvalidWeight> {
        // ---
        if !(weight.is_finite() && weight > 0.0) {
            return Err(InvalidWeight(weight));
        }
        let clock = self.clock;
        let entry = self.peers.entry(peer).or_insert_with(|| {
            let mut q = PeerQueue::new();
            q.virtual_time = clock;
            q
        });
        entry.weight = weight;
        Ok(())
    }

    /// Current weight of `peer`, [`DEFAULT_WEIGHT`] if never set.
    pub fn weight(&self, peer: &K) -> f64 {
        self.peers.get(peer).map_or(DEFAULT_WEIGHT, |q| q.weight)
    }

    // ---

    /// Drop `peer` entirely: its pending items, weight and fairness state.
    ///
    /// Returns the discarded items in FIFO order, or `None` for an unknown
    /// peer.
    pub fn remove(&mut self, peer: &K) -> Option<Vec<T>> {
        // ---
        let entry = self.peers.remove(peer)?;
        if !entry.items.is_empty() {
            self.active
                .remove(&(VirtualTime(entry.virtual_time), peer.clone()));
        }
        self.total_bytes -= entry.queued_bytes;
        self.total_count -= entry.items.len();
        Some(entry.items.into_iter().collect())
    }

    // ---

    /// `true` if `peer` has nothing queued (unknown peers are empty).
    pub fn empty(&self, peer: &K) -> bool {
        self.peers.get(peer).map_or(true, |q| q.items.is_empty())
    }

    /// `true` if any peer has something queued.
    pub fn has_any(&self) -> bool {
        !self.active.is_empty()
    }

    pub fn queued_bytes(&self, peer: &K) -> u64 {
        self.peers.get(peer).map_or(0, |q| q.queued_bytes)
    }

    pub fn queued_count(&self, peer: &K) -> usize {
        self.peers.get(peer).map_or(0, |q| q.items.len())
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn total_count(&self) -> usize {
        self.total_count
    }

    pub fn virtual_time(&self, peer: &K) -> Option<f64> {
        self.peers.get(peer).map(|q| q.virtual_time)
    }

    /// Largest head-of-line cost across active peers.
    pub fn max_front_cost(&self) -> Option<u64> {
        // ---
        self.active
            .iter()
            .filter_map(|(_, peer)| self.front(peer))
            .map(ByteCost::byte_cost)
            .max()
    }

    /// Every known peer with its occupancy, in key order.
    pub fn stats(&self) -> impl Iterator<Item = (&K, PeerStats)> + '_ {
        // ---
        self.peers.iter().map(|(peer, q)| {
            (
                peer,
                PeerStats {
                    queued_bytes: q.queued_bytes,
                    queued_count: q.items.len(),
                    weight: q.weight,
                    virtual_time: q.virtual_time,
                },
            )
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
