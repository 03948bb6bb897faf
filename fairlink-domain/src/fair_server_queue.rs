//! [`FairServerMessageQueue`]: dual-direction fair bandwidth scheduler.
//!
//! Outbound and inbound traffic each get a [`WeightedFairQueue`] keyed by
//! [`PeerId`] and a [`RateLimiter`]. Every [`service`] tick runs two
//! independent phases:
//!
//! ```text
//!  add_message ──► send WFQ ──(fair pick, can_send, budget)──► PeerTransport::send
//!
//!  on_bytes_arrived ──► recv WFQ ──(fair pick, budget)──► delivery FIFO ──► receive
//! ```
//!
//! A phase keeps picking the least-served feasible peer until the pick's
//! head message no longer fits the budget, no peer can accept bytes, the
//! queues drain, or the per-call item cap is hit. Unspent budget rolls
//! forward, capped at the largest head-of-line message; a drained
//! direction forfeits its whole-byte remainder so idle time is not banked.
//!
//! [`service`]: ServerMessageQueue::service

use std::collections::VecDeque;
use std::time::{Duration, Instant};

// ---

use super::error::{FairLinkError, OverflowScope, Result};
use super::fair_queue::WeightedFairQueue;
use super::message::{ByteCost, Message};
use super::observer::{QueueObserver, TracingObserver, TransmitWindow};
use super::peer::PeerId;
use super::queue::{
    // ---
    Direction,
    QueueConfig,
    QueueInfo,
    ServerMessageQueue,
    ServiceReport,
    StopReason,
};
use super::rate_limiter::RateLimiter;
use super::transport::PeerTransport;

// ---------------------------------------------------------------------------
// Internal types
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct PhaseOutcome {
    messages: usize,
    bytes: u64,
    stop: StopReason,
    clock_regression: Option<Duration>,
}

// ---------------------------------------------------------------------------
// FairServerMessageQueue
// ---------------------------------------------------------------------------

/// Fair send/receive scheduler over a [`PeerTransport`].
///
/// Owns every per-peer queue and both rate limiters; producers only reach
/// them through the [`ServerMessageQueue`] operations. All methods take
/// `&mut self`, so a single owner (or a lock around the whole value)
/// serializes producers and the service tick.
pub struct FairServerMessageQueue<T, O = TracingObserver> {
    // ---
    transport: T,
    observer: O,
    config: QueueConfig,

    send_queues: WeightedFairQueue<PeerId, Message>,
    recv_queues: WeightedFairQueue<PeerId, Message>,

    send_rate: RateLimiter,
    recv_rate: RateLimiter,

    /// Inbound messages in fair-selection order, ready for `receive`.
    delivery: VecDeque<(Message, PeerId)>,

    /// Where the last sent message's transmit window ended.
    last_send_end: Instant,

    /// Where the last received message's transmit window ended.
    last_recv_end: Instant,

    /// High-water mark of `now` across service calls.
    last_service: Instant,
}

// ---

impl<T: PeerTransport> FairServerMessageQueue<T, TracingObserver> {
    // ---
    /// Build a scheduler whose rate accounting starts at `start`.
    pub fn new(transport: T, config: QueueConfig, start: Instant) -> Result<Self> {
        Self::with_observer(transport, TracingObserver, config, start)
    }
}

// ---

impl<T: PeerTransport, O: QueueObserver> FairServerMessageQueue<T, O> {
    // ---
    pub fn with_observer(
        transport: T,
        observer: O,
        config: QueueConfig,
        start: Instant,
    ) -> Result<Self> {
        // ---
        config.validate()?;

        tracing::debug!(
            send_bytes_per_sec = config.send_bytes_per_sec,
            recv_bytes_per_sec = config.recv_bytes_per_sec,
            max_peer_bytes = ?config.max_peer_bytes,
            max_total_bytes = ?config.max_total_bytes,
            max_items_per_service = config.max_items_per_service,
            "FairServerMessageQueue: config",
        );

        Ok(Self {
            transport,
            observer,
            send_rate: RateLimiter::new(config.send_bytes_per_sec, start),
            recv_rate: RateLimiter::new(config.recv_bytes_per_sec, start),
            config,
            send_queues: WeightedFairQueue::new(),
            recv_queues: WeightedFairQueue::new(),
            delivery: VecDeque::new(),
            last_send_end: start,
            last_recv_end: start,
            last_service: start,
        })
    }

    // ---

    /// Transport callback: `msg` arrived from `peer`.
    ///
    /// Subject to the same byte bounds as the send side; on
    /// [`FairLinkError::QueueOverflow`] the transport should stop reading
    /// from that peer until the receive side drains.
    pub fn on_bytes_arrived(&mut self, peer: PeerId, msg: Message) -> Result<()> {
        // ---
        let bytes = msg.byte_cost();
        check_bounds(&self.recv_queues, &self.config, peer, bytes)?;
        self.recv_queues.push(peer, msg);
        self.observer.message_queued(Direction::Receive, peer, bytes);
        Ok(())
    }

    // ---

    /// Send-side weight only.
    pub fn set_send_weight(&mut self, peer: PeerId, weight: f64) -> Result<()> {
        // ---
        self.send_queues
            .set_weight(peer, weight)
            .map_err(|e| FairLinkError::InvalidWeight { peer, weight: e.0 })
    }

    /// Receive-side weight only.
    pub fn set_receive_weight(&mut self, peer: PeerId, weight: f64) -> Result<()> {
        // ---
        self.recv_queues
            .set_weight(peer, weight)
            .map_err(|e| FairLinkError::InvalidWeight { peer, weight: e.0 })
    }

    /// Send-side weight of `peer` (1.0 unless configured).
    pub fn server_weight(&self, peer: PeerId) -> f64 {
        self.send_queues.weight(&peer)
    }

    pub fn receive_weight(&self, peer: PeerId) -> f64 {
        self.recv_queues.weight(&peer)
    }

    // ---

    /// Disconnect `peer`: drop both of its sub-queues and its weights.
    ///
    /// Returns how many outbound messages were discarded. Messages already
    /// handed to the transport, or already in the delivery FIFO, are not
    /// touched.
    pub fn remove_peer(&mut self, peer: PeerId) -> usize {
        // ---
        let outbound = self.send_queues.remove(&peer).map_or(0, |m| m.len());
        let inbound = self.recv_queues.remove(&peer).map_or(0, |m| m.len());
        tracing::info!(%peer, outbound, inbound, "peer removed");
        outbound
    }

    // ---

    /// Change both rate ceilings. Takes effect at the next tick.
    pub fn set_rates(&mut self, send_bytes_per_sec: u64, recv_bytes_per_sec: u64) {
        // ---
        self.send_rate.configure(send_bytes_per_sec);
        self.recv_rate.configure(recv_bytes_per_sec);
        self.config.send_bytes_per_sec = send_bytes_per_sec;
        self.config.recv_bytes_per_sec = recv_bytes_per_sec;
    }

    // ---

    /// Log one line per known peer and direction, and return the snapshot.
    pub fn report_queue_info(&self, now: Instant) -> Vec<QueueInfo> {
        // ---
        let info = self.queue_info();
        let since_service = now.saturating_duration_since(self.last_service);
        for q in &info {
            tracing::info!(
                peer = %q.peer,
                direction = %q.direction,
                queued_bytes = q.queued_bytes,
                queued_count = q.queued_count,
                weight = q.weight,
                ?since_service,
                "queue info",
            );
        }
        info
    }

    // ---

    /// Messages waiting in the delivery FIFO.
    pub fn delivery_len(&self) -> usize {
        self.delivery.len()
    }

    /// Bytes waiting across all send-side sub-queues.
    pub fn pending_send_bytes(&self) -> u64 {
        self.send_queues.total_bytes()
    }

    /// Bytes waiting across all receive-side sub-queues.
    pub fn pending_receive_bytes(&self) -> u64 {
        self.recv_queues.total_bytes()
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn observer(&self) -> &O {
        &self.observer
    }

    // ---------------------------------------------------------------------------
    // Service phases
    // ---------------------------------------------------------------------------

    fn service_send(&mut self, now: Instant, prev_tick: Instant) -> PhaseOutcome {
        // ---
        let budget = self.send_rate.budget(now);
        if let Some(behind) = budget.clock_regression {
            self.observer.clock_regression(Direction::Send, behind);
        }

        let mut out = PhaseOutcome {
            clock_regression: budget.clock_regression,
            ..Default::default()
        };
        let mut skipped: Vec<PeerId> = Vec::new();
        let mut window_start = self.last_send_end.max(prev_tick);

        loop {
            if out.messages >= self.config.max_items_per_service {
                out.stop = StopReason::ItemCap;
                break;
            }

            let transport = &mut self.transport;
            let observer = &mut self.observer;
            let next = self.send_queues.next_peer(|peer, msg| {
                // ---
                if skipped.contains(peer) {
                    return false;
                }
                let feasible = match transport.can_send(*peer, msg) {
                    Ok(feasible) => feasible,
                    Err(e) => {
                        observer.peer_infeasible(*peer, &e.to_string());
                        false
                    }
                };
                if !feasible {
                    skipped.push(*peer);
                }
                feasible
            });

            let Some(peer) = next else {
                out.stop = if self.send_queues.has_any() {
                    StopReason::Infeasible
                } else {
                    StopReason::Drained
                };
                break;
            };

            let Some(head) = self.send_queues.front(&peer) else {
                skipped.push(peer);
                continue;
            };
            let cost = head.byte_cost();

            // Head-of-line on budget: stop rather than let a cheaper
            // message from a more-served peer jump ahead.
            if !self.send_rate.can_afford(cost) {
                out.stop = StopReason::Budget;
                break;
            }

            if let Err(e) = self.transport.send(peer, head) {
                self.observer.peer_infeasible(peer, &e.to_string());
                skipped.push(peer);
                continue;
            }

            let weight = self.send_queues.weight(&peer);
            self.send_queues.pop(&peer);
            self.send_rate.spend(cost);

            let end = window_start + self.send_rate.transmit_time(cost);
            self.observer.message_sent(
                peer,
                cost,
                weight,
                TransmitWindow {
                    start: window_start,
                    end,
                },
            );
            window_start = end;

            out.messages += 1;
            out.bytes += cost;
        }

        if self.send_queues.has_any() {
            let cap = self.send_queues.max_front_cost().unwrap_or(0);
            self.send_rate.settle(cap);
            self.last_send_end = window_start;
        } else {
            self.send_rate.settle(0);
            self.last_send_end = window_start.max(self.send_rate.last_service());
        }

        out
    }

    // ---

    fn service_receive(&mut self, now: Instant, prev_tick: Instant) -> PhaseOutcome {
        // ---
        let budget = self.recv_rate.budget(now);
        if let Some(behind) = budget.clock_regression {
            self.observer.clock_regression(Direction::Receive, behind);
        }

        let mut out = PhaseOutcome {
            clock_regression: budget.clock_regression,
            ..Default::default()
        };
        let mut window_start = self.last_recv_end.max(prev_tick);

        loop {
            if out.messages >= self.config.max_items_per_service {
                out.stop = StopReason::ItemCap;
                break;
            }
            if let Some(max) = self.config.max_delivery_backlog {
                if self.delivery.len() >= max && self.recv_queues.has_any() {
                    out.stop = StopReason::DeliveryBacklog;
                    break;
                }
            }

            let Some(peer) = self.recv_queues.next_peer(|_, _| true) else {
                out.stop = StopReason::Drained;
                break;
            };

            let cost = self.recv_queues.front(&peer).map_or(0, ByteCost::byte_cost);
            if !self.recv_rate.can_afford(cost) {
                out.stop = StopReason::Budget;
                break;
            }

            let weight = self.recv_queues.weight(&peer);
            let Some(msg) = self.recv_queues.pop(&peer) else {
                break;
            };
            self.recv_rate.spend(cost);
            self.delivery.push_back((msg, peer));

            let end = window_start + self.recv_rate.transmit_time(cost);
            self.observer.message_received(
                peer,
                cost,
                weight,
                TransmitWindow {
                    start: window_start,
                    end,
                },
            );
            window_start = end;

            out.messages += 1;
            out.bytes += cost;
        }

        if self.recv_queues.has_any() {
            let cap = self.recv_queues.max_front_cost().unwrap_or(0);
            self.recv_rate.settle(cap);
            self.last_recv_end = window_start;
        } else {
            self.recv_rate.settle(0);
            self.last_recv_end = window_start.max(self.recv_rate.last_service());
        }

        out
    }
}

// ---------------------------------------------------------------------------
// ServerMessageQueue
// ---------------------------------------------------------------------------

impl<T: PeerTransport, O: QueueObserver> ServerMessageQueue for FairServerMessageQueue<T, O> {
    // ---
    fn add_message(&mut self, peer: PeerId, msg: Message) -> Result<()> {
        // ---
        let bytes = msg.byte_cost();
        check_bounds(&self.send_queues, &self.config, peer, bytes)?;
        self.send_queues.push(peer, msg);
        self.observer.message_queued(Direction::Send, peer, bytes);
        Ok(())
    }

    fn receive(&mut self) -> Option<(Message, PeerId)> {
        // ---
        let (msg, peer) = self.delivery.pop_front()?;
        self.observer.message_delivered(peer, msg.byte_cost());
        Some((msg, peer))
    }

    fn service(&mut self, now: Instant) -> ServiceReport {
        // ---
        let prev_tick = self.last_service;
        let send = self.service_send(now, prev_tick);
        let recv = self.service_receive(now, prev_tick);
        self.last_service = self.last_service.max(now);

        tracing::trace!(
            sent = send.messages,
            sent_bytes = send.bytes,
            received = recv.messages,
            received_bytes = recv.bytes,
            send_stop = ?send.stop,
            receive_stop = ?recv.stop,
            "service tick",
        );

        ServiceReport {
            sent_messages: send.messages,
            sent_bytes: send.bytes,
            received_messages: recv.messages,
            received_bytes: recv.bytes,
            send_stop: send.stop,
            receive_stop: recv.stop,
            clock_regression: send.clock_regression.or(recv.clock_regression),
        }
    }

    /// Applies to both directions.
    fn set_server_weight(&mut self, peer: PeerId, weight: f64) -> Result<()> {
        // ---
        self.set_send_weight(peer, weight)?;
        self.set_receive_weight(peer, weight)?;
        tracing::debug!(%peer, weight, "server weight set");
        Ok(())
    }

    fn queue_info(&self) -> Vec<QueueInfo> {
        // ---
        let send = self.send_queues.stats().map(|(peer, s)| QueueInfo {
            peer: *peer,
            direction: Direction::Send,
            queued_bytes: s.queued_bytes,
            queued_count: s.queued_count,
            weight: s.weight,
        });
        let recv = self.recv_queues.stats().map(|(peer, s)| QueueInfo {
            peer: *peer,
            direction: Direction::Receive,
            queued_bytes: s.queued_bytes,
            queued_count: s.queued_count,
            weight: s.weight,
        });

        let mut info: Vec<QueueInfo> = send.chain(recv).collect();
        info.sort_by_key(|q| (q.peer, q.direction));
        info
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn check_bounds(
    queues: &WeightedFairQueue<PeerId, Message>,
    config: &QueueConfig,
    peer: PeerId,
    incoming: u64,
) -> Result<()> {
    // ---
    if let Some(limit) = config.max_peer_bytes {
        let queued = queues.queued_bytes(&peer);
        if queued.saturating_add(incoming) > limit {
            return Err(FairLinkError::QueueOverflow {
                peer,
                scope: OverflowScope::Peer,
                queued,
                incoming,
                limit,
            });
        }
    }
    if let Some(limit) = config.max_total_bytes {
        let queued = queues.total_bytes();
        if queued.saturating_add(incoming) > limit {
            return Err(FairLinkError::QueueOverflow {
                peer,
                scope: OverflowScope::Global,
                queued,
                incoming,
                limit,
            });
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use std::collections::BTreeSet;
    use std::time::Duration;

    use super::*;
    use crate::observer::NullObserver;

    // ---

    #[derive(Default)]
    struct ScriptedTransport {
        /// `can_send` returns `Ok(false)`.
        blocked: BTreeSet<PeerId>,
        /// `can_send` returns `Err`.
        faulty: BTreeSet<PeerId>,
        /// `send` returns `Err`.
        refusing: BTreeSet<PeerId>,
        sent: Vec<(PeerId, Message)>,
    }

    impl ScriptedTransport {
        fn bytes_to(&self, peer: PeerId) -> u64 {
            self.sent
                .iter()
                .filter(|(p, _)| *p == peer)
                .map(|(_, m)| m.len() as u64)
                .sum()
        }

        fn count_to(&self, peer: PeerId) -> usize {
            self.sent.iter().filter(|(p, _)| *p == peer).count()
        }
    }

    impl PeerTransport for ScriptedTransport {
        fn can_send(&mut self, peer: PeerId, _msg: &Message) -> Result<bool> {
            if self.faulty.contains(&peer) {
                return Err(FairLinkError::Transport("socket poisoned".into()));
            }
            Ok(!self.blocked.contains(&peer))
        }

        fn send(&mut self, peer: PeerId, msg: &Message) -> Result<()> {
            if self.refusing.contains(&peer) {
                return Err(FairLinkError::TransportInfeasible { peer });
            }
            self.sent.push((peer, msg.clone()));
            Ok(())
        }
    }

    // ---

    #[derive(Default)]
    struct Recorder {
        sent: Vec<TransmitWindow>,
        regressions: Vec<(Direction, Duration)>,
        infeasible: Vec<PeerId>,
        delivered: usize,
    }

    impl QueueObserver for Recorder {
        fn message_sent(
            &mut self,
            _peer: PeerId,
            _bytes: u64,
            _weight: f64,
            window: TransmitWindow,
        ) {
            self.sent.push(window);
        }

        fn message_delivered(&mut self, _peer: PeerId, _bytes: u64) {
            self.delivered += 1;
        }

        fn clock_regression(&mut self, direction: Direction, behind: Duration) {
            self.regressions.push((direction, behind));
        }

        fn peer_infeasible(&mut self, peer: PeerId, _reason: &str) {
            self.infeasible.push(peer);
        }
    }

    // ---

    const A: PeerId = PeerId::new(1);
    const B: PeerId = PeerId::new(2);
    const C: PeerId = PeerId::new(3);

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn rated(send: u64, recv: u64) -> QueueConfig {
        QueueConfig {
            send_bytes_per_sec: send,
            recv_bytes_per_sec: recv,
            ..Default::default()
        }
    }

    fn queue(
        config: QueueConfig,
        t0: Instant,
    ) -> FairServerMessageQueue<ScriptedTransport, Recorder> {
        FairServerMessageQueue::with_observer(
            ScriptedTransport::default(),
            Recorder::default(),
            config,
            t0,
        )
        .unwrap()
    }

    /// Message whose payload starts with a big-endian sequence number.
    fn numbered(seq: u32, len: usize) -> Message {
        let mut payload = vec![0u8; len.max(4)];
        payload[..4].copy_from_slice(&seq.to_be_bytes());
        Message::new(payload)
    }

    fn seq_of(msg: &Message) -> u32 {
        u32::from_be_bytes(msg.payload()[..4].try_into().unwrap())
    }

    // ---

    #[test]
    fn weighted_share_over_one_second() {
        // ---
        let t0 = Instant::now();
        let mut q = queue(rated(1_000, 0), t0);
        q.set_server_weight(A, 1.0).unwrap();
        q.set_server_weight(B, 3.0).unwrap();
        for i in 0..50 {
            q.add_message(A, numbered(i, 100)).unwrap();
            q.add_message(B, numbered(i, 100)).unwrap();
        }

        for tick in 1..=100 {
            q.service(t0 + ms(10 * tick));
        }

        let a = q.transport().bytes_to(A);
        let b = q.transport().bytes_to(B);
        assert!(a + b <= 1_100, "sent {} bytes in 1s at 1000 B/s", a + b);
        assert!((150..=350).contains(&a), "weight-1 peer got {a} bytes");
        assert!((650..=850).contains(&b), "weight-3 peer got {b} bytes");
    }

    // ---

    #[test]
    fn tenth_message_overflows_peer_bound() {
        // ---
        let t0 = Instant::now();
        let mut q = queue(
            QueueConfig {
                max_peer_bytes: Some(900),
                ..Default::default()
            },
            t0,
        );

        for i in 0..9 {
            q.add_message(A, numbered(i, 100)).unwrap();
        }
        let err = q.add_message(A, numbered(9, 100)).unwrap_err();
        assert!(matches!(
            err,
            FairLinkError::QueueOverflow {
                scope: OverflowScope::Peer,
                queued: 900,
                incoming: 100,
                limit: 900,
                ..
            }
        ));
        assert!(err.is_transient());

        // Other peers have their own allowance.
        q.add_message(B, numbered(0, 100)).unwrap();
    }

    // ---

    #[test]
    fn global_bound_spans_peers() {
        // ---
        let t0 = Instant::now();
        let mut q = queue(
            QueueConfig {
                max_total_bytes: Some(250),
                ..Default::default()
            },
            t0,
        );
        q.add_message(A, numbered(0, 100)).unwrap();
        q.add_message(B, numbered(0, 100)).unwrap();
        let err = q.add_message(C, numbered(0, 100)).unwrap_err();
        assert!(matches!(
            err,
            FairLinkError::QueueOverflow {
                scope: OverflowScope::Global,
                ..
            }
        ));

        // Draining frees room again.
        q.service(t0 + ms(1));
        q.add_message(C, numbered(0, 100)).unwrap();
    }

    // ---

    #[test]
    fn weight_set_before_first_message_applies_immediately() {
        // ---
        let t0 = Instant::now();
        let mut q = queue(
            QueueConfig {
                max_items_per_service: 30,
                ..Default::default()
            },
            t0,
        );
        q.set_server_weight(A, 2.0).unwrap();
        assert_eq!(q.server_weight(A), 2.0);
        assert_eq!(q.server_weight(B), 1.0);

        for i in 0..40 {
            q.add_message(A, numbered(i, 100)).unwrap();
            q.add_message(B, numbered(i, 100)).unwrap();
        }
        let report = q.service(t0 + ms(1));
        assert_eq!(report.sent_messages, 30);
        assert_eq!(report.send_stop, StopReason::ItemCap);

        let a = q.transport().count_to(A);
        assert!((19..=21).contains(&a), "weight-2 peer sent {a} of 30");
    }

    // ---

    #[test]
    fn invalid_weight_leaves_prior_weight() {
        // ---
        let t0 = Instant::now();
        let mut q = queue(QueueConfig::default(), t0);
        q.set_server_weight(A, 4.0).unwrap();

        let err = q.set_server_weight(A, 0.0).unwrap_err();
        assert!(matches!(err, FairLinkError::InvalidWeight { peer, .. } if peer == A));
        assert!(q.set_server_weight(A, -2.0).is_err());
        assert_eq!(q.server_weight(A), 4.0);
        assert_eq!(q.receive_weight(A), 4.0);
    }

    // ---

    #[test]
    fn direction_weights_are_independent() {
        // ---
        let t0 = Instant::now();
        let mut q = queue(QueueConfig::default(), t0);
        q.set_send_weight(A, 3.0).unwrap();
        q.set_receive_weight(A, 0.5).unwrap();
        assert_eq!(q.server_weight(A), 3.0);
        assert_eq!(q.receive_weight(A), 0.5);
    }

    // ---

    #[test]
    fn per_peer_order_is_preserved() {
        // ---
        let t0 = Instant::now();
        let mut q = queue(rated(5_000, 0), t0);
        q.set_server_weight(B, 2.5).unwrap();
        for i in 0..30 {
            q.add_message(A, numbered(i, 40 + (i as usize * 13) % 90)).unwrap();
            q.add_message(B, numbered(i, 10 + (i as usize * 29) % 150)).unwrap();
        }
        for tick in 1..=400 {
            q.service(t0 + ms(5 * tick));
        }
        assert_eq!(q.pending_send_bytes(), 0);

        for peer in [A, B] {
            let seqs: Vec<u32> = q
                .transport()
                .sent
                .iter()
                .filter(|(p, _)| *p == peer)
                .map(|(_, m)| seq_of(m))
                .collect();
            assert_eq!(seqs, (0..30).collect::<Vec<_>>(), "{peer} out of order");
        }
    }

    // ---

    #[test]
    fn cumulative_sends_stay_within_rate_plus_one_message() {
        // ---
        let t0 = Instant::now();
        let rate = 2_000_u64;
        let max_msg = 300_usize;
        let mut q = queue(rated(rate, 0), t0);
        q.set_server_weight(C, 2.0).unwrap();

        let mut seq = 0;
        for peer in [A, B, C] {
            for i in 0..200 {
                seq += 1;
                q.add_message(peer, numbered(i, 4 + (seq * 7_919) % (max_msg - 4)))
                    .unwrap();
            }
        }

        let mut now = t0;
        let mut total = 0;
        for i in 0..400u64 {
            now += Duration::from_micros(500 + (i * 3_571) % 20_000);
            total += q.service(now).sent_bytes;
            let allowed = rate as f64 * (now - t0).as_secs_f64() + max_msg as f64;
            assert!(
                (total as f64) <= allowed,
                "sent {total} bytes by {:?}, limit {allowed}",
                now - t0
            );
        }
        assert!(total > 0);
    }

    // ---

    #[test]
    fn blocked_peer_does_not_stall_others() {
        // ---
        let t0 = Instant::now();
        let mut q = queue(rated(1_000, 0), t0);
        q.transport_mut().blocked.insert(A);
        for i in 0..20 {
            q.add_message(A, numbered(i, 50)).unwrap();
            q.add_message(B, numbered(i, 50)).unwrap();
        }

        for tick in 1..=10 {
            let report = q.service(t0 + ms(50 * tick));
            assert_eq!(report.sent_messages, 1, "tick {tick}: B must be served");
        }
        assert_eq!(q.transport().count_to(A), 0);
        assert_eq!(q.transport().count_to(B), 10);
        assert_eq!(q.pending_send_bytes(), 20 * 50 + 10 * 50);

        // Once A unblocks it is behind on virtual time and goes first.
        q.transport_mut().blocked.clear();
        q.service(t0 + ms(550));
        assert_eq!(q.transport().sent.last().map(|(p, _)| *p), Some(A));
    }

    // ---

    #[test]
    fn everything_blocked_reports_infeasible_and_carries_bounded_budget() {
        // ---
        let t0 = Instant::now();
        let mut q = queue(rated(1_000, 0), t0);
        q.transport_mut().blocked.insert(A);
        q.add_message(A, numbered(0, 120)).unwrap();

        let report = q.service(t0 + ms(10_000));
        assert_eq!(report.sent_messages, 0);
        assert_eq!(report.send_stop, StopReason::Infeasible);

        // Ten seconds of budget collapses to one message's worth.
        q.transport_mut().blocked.clear();
        q.add_message(A, numbered(1, 120)).unwrap();
        let report = q.service(t0 + ms(10_000));
        assert_eq!(report.sent_messages, 1);
        assert_eq!(report.send_stop, StopReason::Budget);
    }

    // ---

    #[test]
    fn faulty_feasibility_check_skips_peer_and_keeps_messages() {
        // ---
        let t0 = Instant::now();
        let mut q = queue(QueueConfig::default(), t0);
        q.transport_mut().faulty.insert(A);
        for i in 0..3 {
            q.add_message(A, numbered(i, 10)).unwrap();
            q.add_message(B, numbered(i, 10)).unwrap();
        }

        let report = q.service(t0 + ms(1));
        assert_eq!(report.sent_messages, 3);
        assert_eq!(report.send_stop, StopReason::Infeasible);
        assert_eq!(q.observer().infeasible, vec![A], "one report per tick");
        assert_eq!(q.transport().count_to(B), 3);

        let info = q.queue_info();
        let a_send = info
            .iter()
            .find(|i| i.peer == A && i.direction == Direction::Send)
            .unwrap();
        assert_eq!(a_send.queued_count, 3);
    }

    // ---

    #[test]
    fn failed_send_keeps_message_at_head() {
        // ---
        let t0 = Instant::now();
        let mut q = queue(QueueConfig::default(), t0);
        q.transport_mut().refusing.insert(A);
        q.add_message(A, numbered(0, 10)).unwrap();
        q.add_message(A, numbered(1, 10)).unwrap();

        let report = q.service(t0 + ms(1));
        assert_eq!(report.sent_messages, 0);

        q.transport_mut().refusing.clear();
        q.service(t0 + ms(2));
        let seqs: Vec<u32> = q.transport().sent.iter().map(|(_, m)| seq_of(m)).collect();
        assert_eq!(seqs, vec![0, 1]);
    }

    // ---

    #[test]
    fn clock_regression_is_reported_and_clamped() {
        // ---
        let t0 = Instant::now();
        let mut q = queue(rated(1_000, 1_000), t0);
        for i in 0..10 {
            q.add_message(A, numbered(i, 100)).unwrap();
        }

        assert_eq!(q.service(t0 + ms(500)).sent_messages, 5);
        let report = q.service(t0 + ms(300));
        assert_eq!(report.sent_messages, 0);
        assert_eq!(report.clock_regression, Some(ms(200)));
        assert!(matches!(
            report.clock_error(),
            Some(FairLinkError::ClockRegression { behind }) if behind == ms(200)
        ));
        assert_eq!(
            q.observer().regressions,
            vec![(Direction::Send, ms(200)), (Direction::Receive, ms(200))]
        );

        // Scheduling continues from the high-water mark.
        let report = q.service(t0 + ms(700));
        assert_eq!(report.sent_messages, 2);
        assert!(report.clock_error().is_none());
    }

    // ---

    #[test]
    fn zero_length_messages_are_capped_per_call() {
        // ---
        let t0 = Instant::now();
        let mut q = queue(
            QueueConfig {
                send_bytes_per_sec: 1_000,
                max_items_per_service: 4,
                ..Default::default()
            },
            t0,
        );
        for _ in 0..10 {
            q.add_message(A, Message::zeroed(0)).unwrap();
        }

        // No time has passed, so no budget, but empty messages are free.
        let report = q.service(t0);
        assert_eq!(report.sent_messages, 4);
        assert_eq!(report.sent_bytes, 0);
        assert_eq!(report.send_stop, StopReason::ItemCap);
    }

    // ---

    #[test]
    fn idle_direction_does_not_bank_budget() {
        // ---
        let t0 = Instant::now();
        let mut q = queue(rated(1_000, 0), t0);

        q.service(t0 + ms(10_000));
        q.add_message(A, numbered(0, 50)).unwrap();

        let report = q.service(t0 + ms(10_010));
        assert_eq!(report.sent_messages, 0);
        assert_eq!(report.send_stop, StopReason::Budget);

        let report = q.service(t0 + ms(10_050));
        assert_eq!(report.sent_messages, 1);
    }

    // ---

    #[test]
    fn transmit_windows_are_back_to_back() {
        // ---
        let t0 = Instant::now();
        let mut q = queue(rated(1_000, 0), t0);
        q.add_message(A, numbered(0, 100)).unwrap();
        q.add_message(B, numbered(0, 200)).unwrap();

        q.service(t0 + ms(300));
        let w = &q.observer().sent;
        assert_eq!(w.len(), 2);
        assert_eq!(w[0].start, t0);
        assert_eq!(w[0].end, t0 + ms(100));
        assert_eq!(w[1].start, w[0].end);
        assert_eq!(w[1].end, t0 + ms(300));
    }

    // ---

    #[test]
    fn receive_side_interleaves_peers_by_weight() {
        // ---
        let t0 = Instant::now();
        let mut q = queue(rated(0, 1_000), t0);
        q.set_receive_weight(B, 3.0).unwrap();
        for i in 0..8 {
            q.on_bytes_arrived(A, numbered(i, 100)).unwrap();
            q.on_bytes_arrived(B, numbered(i, 100)).unwrap();
        }

        let report = q.service(t0 + ms(800));
        assert_eq!(report.received_messages, 8);
        assert_eq!(report.receive_stop, StopReason::Budget);

        let mut order = Vec::new();
        while let Some((msg, peer)) = q.receive() {
            order.push((peer, seq_of(&msg)));
        }
        let from_a: Vec<u32> = order.iter().filter(|(p, _)| *p == A).map(|(_, s)| *s).collect();
        let from_b: Vec<u32> = order.iter().filter(|(p, _)| *p == B).map(|(_, s)| *s).collect();
        assert_eq!(from_a, vec![0, 1]);
        assert_eq!(from_b, (0..6).collect::<Vec<_>>());
        assert!(q.receive().is_none());
        assert_eq!(q.observer().delivered, 8);
    }

    // ---

    #[test]
    fn delivery_backlog_pauses_receive_phase() {
        // ---
        let t0 = Instant::now();
        let mut q = queue(
            QueueConfig {
                max_delivery_backlog: Some(3),
                ..Default::default()
            },
            t0,
        );
        for i in 0..5 {
            q.on_bytes_arrived(A, numbered(i, 10)).unwrap();
        }

        let report = q.service(t0 + ms(1));
        assert_eq!(report.received_messages, 3);
        assert_eq!(report.receive_stop, StopReason::DeliveryBacklog);

        q.receive().unwrap();
        q.receive().unwrap();
        let report = q.service(t0 + ms(2));
        assert_eq!(report.received_messages, 2);
        assert_eq!(report.receive_stop, StopReason::Drained);
        assert_eq!(q.delivery_len(), 3);
    }

    // ---

    #[test]
    fn inbound_bound_applies_backpressure() {
        // ---
        let t0 = Instant::now();
        let mut q = queue(
            QueueConfig {
                max_peer_bytes: Some(100),
                ..Default::default()
            },
            t0,
        );
        q.on_bytes_arrived(A, numbered(0, 60)).unwrap();
        assert!(q.on_bytes_arrived(A, numbered(1, 60)).is_err());
        assert_eq!(q.pending_receive_bytes(), 60);
    }

    // ---

    #[test]
    fn remove_peer_drops_its_queues_only() {
        // ---
        let t0 = Instant::now();
        let mut q = queue(rated(1, 0), t0);
        q.set_server_weight(A, 5.0).unwrap();
        for i in 0..4 {
            q.add_message(A, numbered(i, 10)).unwrap();
            q.add_message(B, numbered(i, 10)).unwrap();
        }
        q.on_bytes_arrived(A, numbered(0, 10)).unwrap();

        assert_eq!(q.remove_peer(A), 4);
        assert_eq!(q.server_weight(A), 1.0);
        assert_eq!(q.pending_send_bytes(), 40);
        assert_eq!(q.pending_receive_bytes(), 0);
        assert!(q.queue_info().iter().all(|i| i.peer != A));
        assert_eq!(q.remove_peer(A), 0);
    }

    // ---

    #[test]
    fn queue_info_is_exact_and_ordered() {
        // ---
        let t0 = Instant::now();
        let mut q: FairServerMessageQueue<ScriptedTransport, NullObserver> =
            FairServerMessageQueue::with_observer(
                ScriptedTransport::default(),
                NullObserver,
                QueueConfig::default(),
                t0,
            )
            .unwrap();
        q.add_message(B, numbered(0, 30)).unwrap();
        q.add_message(B, numbered(1, 20)).unwrap();
        q.on_bytes_arrived(A, numbered(0, 7)).unwrap();
        q.set_server_weight(C, 2.0).unwrap();

        let info = q.queue_info();
        let rows: Vec<(PeerId, Direction, u64, usize)> = info
            .iter()
            .map(|i| (i.peer, i.direction, i.queued_bytes, i.queued_count))
            .collect();
        assert_eq!(
            rows,
            vec![
                (A, Direction::Receive, 7, 1),
                (B, Direction::Send, 50, 2),
                (C, Direction::Send, 0, 0),
                (C, Direction::Receive, 0, 0),
            ]
        );

        q.service(t0 + ms(1));
        assert!(q.queue_info().iter().all(|i| i.queued_count == 0));
    }

    // ---

    #[test]
    fn invalid_config_is_rejected() {
        // ---
        let config = QueueConfig {
            max_items_per_service: 0,
            ..Default::default()
        };
        let result =
            FairServerMessageQueue::new(ScriptedTransport::default(), config, Instant::now());
        assert!(matches!(result, Err(FairLinkError::InvalidConfig(_))));
    }

    // ---

    #[test]
    fn oversized_head_stops_the_phase_until_it_fits() {
        // ---
        let t0 = Instant::now();
        let mut q = queue(rated(1_000, 0), t0);
        q.add_message(A, numbered(0, 300)).unwrap();
        q.add_message(B, numbered(0, 50)).unwrap();

        // A is the fair pick (tie, smaller id). Its 300 B head does not fit
        // the 100 B budget, and B's 50 B message must not jump ahead.
        let report = q.service(t0 + ms(100));
        assert_eq!(report.sent_messages, 0);
        assert_eq!(report.send_stop, StopReason::Budget);
        assert_eq!(q.transport().count_to(B), 0);

        // The carried 100 B plus 200 B of new budget lets A through.
        let report = q.service(t0 + ms(300));
        assert_eq!(report.sent_messages, 1);
        assert_eq!(report.send_stop, StopReason::Budget);
        assert_eq!(q.transport().bytes_to(A), 300);

        let report = q.service(t0 + ms(350));
        assert_eq!(report.sent_messages, 1);
        assert_eq!(report.send_stop, StopReason::Drained);
        assert_eq!(q.transport().bytes_to(B), 50);
    }

    // ---

    #[test]
    fn rate_changes_apply_mid_backlog() {
        // ---
        let t0 = Instant::now();
        let mut q = queue(
            QueueConfig {
                send_bytes_per_sec: 1_000,
                max_items_per_service: 10,
                ..Default::default()
            },
            t0,
        );
        for i in 0..30 {
            q.add_message(A, numbered(i, 100)).unwrap();
        }

        let report = q.service(t0 + ms(100));
        assert_eq!(report.sent_messages, 1);
        assert_eq!(report.send_stop, StopReason::Budget);

        q.set_rates(0, 0);
        assert_eq!(q.config().send_bytes_per_sec, 0);
        let report = q.service(t0 + ms(110));
        assert_eq!(report.sent_messages, 10);
        assert_eq!(report.send_stop, StopReason::ItemCap);

        // Back to limited: no credit is inherited from the unlimited ticks.
        q.set_rates(1_000, 0);
        let report = q.service(t0 + ms(120));
        assert_eq!(report.sent_messages, 0);
        assert_eq!(report.send_stop, StopReason::Budget);

        let report = q.service(t0 + ms(210));
        assert_eq!(report.sent_messages, 1);
        assert_eq!(q.transport().count_to(A), 12);
        assert_eq!(q.pending_send_bytes(), 1_800);
    }
}
