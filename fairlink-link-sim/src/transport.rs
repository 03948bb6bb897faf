use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

// ---

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

// ---

use fairlink_domain::{ByteCost, Message, PeerId, PeerTransport, Result};

use super::config::LinkSimConfig;
use super::connection::{ConnectionStats, SimConnection};
use super::error::LinkSimError;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct SimState {
    // ---
    config: LinkSimConfig,
    connections: BTreeMap<PeerId, SimConnection>,
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One message that finished draining onto the simulated wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireFrame {
    pub peer: PeerId,
    pub msg: Message,
}

// ---------------------------------------------------------------------------
// LinkSimTransport
// ---------------------------------------------------------------------------

/// In-process [`PeerTransport`]. Does not use real sockets.
///
/// Every connected peer gets a bounded write buffer. `can_send` answers
/// from buffer room and `send` appends to it; the paired
/// [`LinkSimHandle`] drains buffers onto the wire as simulated time
/// passes.
pub struct LinkSimTransport {
    // ---
    state: Arc<Mutex<SimState>>,

    /// Set to `false` to simulate a link outage. Every peer reports
    /// infeasible until re-enabled.
    link_enabled: Arc<AtomicBool>,

    rng: StdRng,
    fault_percent: f64,
}

// ---

impl LinkSimTransport {
    // ---
    /// Create a transport and the handle that controls it.
    pub fn new(config: LinkSimConfig) -> (Self, LinkSimHandle) {
        // ---
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let fault_percent = config.fault_percent.clamp(0.0, 1.0);

        let state = Arc::new(Mutex::new(SimState {
            config,
            connections: BTreeMap::new(),
        }));
        let link_enabled = Arc::new(AtomicBool::new(true));

        let handle = LinkSimHandle {
            state: Arc::clone(&state),
            link_enabled: Arc::clone(&link_enabled),
        };

        let transport = Self {
            state,
            link_enabled,
            rng,
            fault_percent,
        };

        (transport, handle)
    }

    // ---

    fn link_up(&self) -> bool {
        self.link_enabled.load(Ordering::Relaxed)
    }

    fn inject_fault(&mut self) -> bool {
        self.fault_percent > 0.0 && self.rng.gen::<f64>() < self.fault_percent
    }
}

// ---

impl PeerTransport for LinkSimTransport {
    // ---
    fn can_send(&mut self, peer: PeerId, msg: &Message) -> Result<bool> {
        // ---
        if !self.link_up() {
            return Ok(false);
        }
        if self.inject_fault() {
            return Err(LinkSimError::InjectedFault(peer).into());
        }

        let state = lock(&self.state);
        let conn = state
            .connections
            .get(&peer)
            .ok_or(LinkSimError::NoConnection(peer))?;
        Ok(conn.fits(msg.byte_cost()))
    }

    fn send(&mut self, peer: PeerId, msg: &Message) -> Result<()> {
        // ---
        if !self.link_up() {
            return Err(LinkSimError::LinkDown(peer).into());
        }

        let mut state = lock(&self.state);
        let capacity = state.config.buffer_bytes;
        let conn = state
            .connections
            .get_mut(&peer)
            .ok_or(LinkSimError::NoConnection(peer))?;

        if !conn.fits(msg.byte_cost()) {
            return Err(LinkSimError::BufferFull {
                peer,
                buffered: conn.buffered(),
                capacity,
            }
            .into());
        }

        conn.push(msg.clone());
        tracing::trace!(
            %peer,
            bytes = msg.byte_cost(),
            buffered = conn.buffered(),
            "link-sim: accepted",
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// LinkSimHandle
// ---------------------------------------------------------------------------

/// Control side of a [`LinkSimTransport`]: peer membership, outages and
/// the wire drain. Cheap to clone.
#[derive(Clone)]
pub struct LinkSimHandle {
    // ---
    state: Arc<Mutex<SimState>>,
    link_enabled: Arc<AtomicBool>,
}

// ---

impl LinkSimHandle {
    // ---
    /// Open a connection to `peer`. Reconnecting keeps the existing buffer.
    pub fn connect(&self, peer: PeerId) {
        // ---
        let mut state = lock(&self.state);
        let capacity = state.config.buffer_bytes;
        let rate = state.config.wire_bytes_per_sec;
        state
            .connections
            .entry(peer)
            .or_insert_with(|| SimConnection::new(capacity, rate));
        tracing::debug!(%peer, "link-sim: connected");
    }

    /// Drop `peer`'s connection and anything still buffered for it.
    /// Returns `false` if it was not connected.
    pub fn disconnect(&self, peer: PeerId) -> bool {
        // ---
        let removed = lock(&self.state).connections.remove(&peer);
        if let Some(conn) = &removed {
            tracing::debug!(%peer, lost_bytes = conn.buffered(), "link-sim: disconnected");
        }
        removed.is_some()
    }

    // ---

    /// Enable or disable the whole link.
    pub fn link_enable(&self, enabled: bool) {
        // ---
        self.link_enabled.store(enabled, Ordering::Relaxed);
        tracing::info!(enabled, "link-sim: link state changed");
    }

    pub fn is_link_enabled(&self) -> bool {
        self.link_enabled.load(Ordering::Relaxed)
    }

    /// Freeze one peer's socket: it refuses new bytes and stops draining.
    /// Returns `false` if the peer is not connected.
    pub fn set_stalled(&self, peer: PeerId, stalled: bool) -> bool {
        // ---
        match lock(&self.state).connections.get_mut(&peer) {
            Some(conn) => {
                conn.set_stalled(stalled);
                true
            }
            None => false,
        }
    }

    // ---

    /// Advance every connection by `elapsed` and collect the messages that
    /// reached the wire, grouped by peer in ascending id order.
    pub fn drain(&self, elapsed: Duration) -> Vec<WireFrame> {
        // ---
        let mut state = lock(&self.state);
        let mut frames = Vec::new();
        for (peer, conn) in state.connections.iter_mut() {
            frames.extend(
                conn.drain(elapsed)
                    .into_iter()
                    .map(|msg| WireFrame { peer: *peer, msg }),
            );
        }
        frames
    }

    // ---

    pub fn peers(&self) -> Vec<PeerId> {
        lock(&self.state).connections.keys().copied().collect()
    }

    pub fn buffered(&self, peer: PeerId) -> Option<u64> {
        lock(&self.state).connections.get(&peer).map(|c| c.buffered())
    }

    pub fn stats(&self, peer: PeerId) -> Option<ConnectionStats> {
        lock(&self.state).connections.get(&peer).map(|c| c.stats)
    }

    // ---

    /// Drain the link every `period` and forward wire frames to `wire_tx`.
    ///
    /// The task ends when the receiving side of `wire_tx` is dropped.
    pub fn spawn_drain(
        &self,
        period: Duration,
        wire_tx: mpsc::UnboundedSender<WireFrame>,
    ) -> JoinHandle<()> {
        // ---
        let handle = self.clone();
        tokio::spawn(async move {
            // ---
            let mut ticker = tokio::time::interval(period);
            let mut last = Instant::now();

            loop {
                ticker.tick().await;
                let now = Instant::now();
                let elapsed = now.saturating_duration_since(last);
                last = now;

                for frame in handle.drain(elapsed) {
                    if wire_tx.send(frame).is_err() {
                        tracing::debug!("link-sim: wire receiver dropped, drain task exiting");
                        return;
                    }
                }
                if wire_tx.is_closed() {
                    return;
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
