//! Synthetic traffic sources.
//!
//! Each [`Producer`] runs on its own `std::thread` and pushes fixed-size
//! messages for one peer as fast as the scheduler accepts them. Outbound
//! producers call `add_message`; inbound producers stand in for a
//! connection's read loop and call `on_bytes_arrived`. Either way a
//! [`FairLinkError::QueueOverflow`] is backpressure: the producer sleeps
//! and retries the same message.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

// ---

use fairlink_domain::{
    // ---
    Direction,
    FairLinkError,
    Message,
    PeerId,
    PeerTransport,
    QueueObserver,
};

use super::shared::SharedQueue;

// ---------------------------------------------------------------------------
// ProducerStats
// ---------------------------------------------------------------------------

/// What one producer achieved before it stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerStats {
    // ---
    pub accepted_messages: u64,
    pub accepted_bytes: u64,

    /// Attempts refused with `QueueOverflow`.
    pub backpressured: u64,
}

// ---------------------------------------------------------------------------
// Producer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Producer {
    // ---
    pub peer: PeerId,
    pub direction: Direction,
    pub message_size: usize,

    /// Sleep after a `QueueOverflow` before retrying.
    pub backoff: Duration,
}

// ---

impl Producer {
    // ---
    pub fn new(peer: PeerId, direction: Direction, message_size: usize) -> Self {
        Self {
            peer,
            direction,
            message_size,
            backoff: Duration::from_millis(1),
        }
    }

    // ---

    /// Start producing on a new thread until `stop` is set or the queue
    /// returns a non-transient error.
    pub fn spawn<T, O>(
        self,
        queue: SharedQueue<T, O>,
        stop: Arc<AtomicBool>,
    ) -> JoinHandle<ProducerStats>
    where
        T: PeerTransport + 'static,
        O: QueueObserver + 'static,
    {
        // ---
        thread::spawn(move || self.run(&queue, &stop))
    }

    fn run<T, O>(&self, queue: &SharedQueue<T, O>, stop: &AtomicBool) -> ProducerStats
    where
        T: PeerTransport,
        O: QueueObserver,
    {
        // ---
        tracing::debug!(peer = %self.peer, direction = %self.direction, "producer started");

        let mut stats = ProducerStats::default();
        let msg = Message::zeroed(self.message_size);

        while !stop.load(Ordering::Relaxed) {
            let result = match self.direction {
                Direction::Send => queue.add_message(self.peer, msg.clone()),
                Direction::Receive => queue.on_bytes_arrived(self.peer, msg.clone()),
            };

            match result {
                Ok(()) => {
                    stats.accepted_messages += 1;
                    stats.accepted_bytes += msg.len() as u64;
                }
                Err(FairLinkError::QueueOverflow { .. }) => {
                    stats.backpressured += 1;
                    thread::sleep(self.backoff);
                }
                Err(e) => {
                    tracing::warn!(
                        peer = %self.peer,
                        direction = %self.direction,
                        "producer stopping: {e}",
                    );
                    break;
                }
            }
        }

        tracing::debug!(
            peer = %self.peer,
            direction = %self.direction,
            accepted = stats.accepted_messages,
            backpressured = stats.backpressured,
            "producer stopped",
        );
        stats
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    use std::time::Instant;

    use fairlink_domain::{FairServerMessageQueue, NullObserver, QueueConfig, Result};

    struct Sink;

    impl PeerTransport for Sink {
        fn can_send(&mut self, _peer: PeerId, _msg: &Message) -> Result<bool> {
            Ok(true)
        }

        fn send(&mut self, _peer: PeerId, _msg: &Message) -> Result<()> {
            Ok(())
        }
    }

    fn bounded(max_peer_bytes: u64) -> SharedQueue<Sink, NullObserver> {
        // ---
        let config = QueueConfig {
            max_peer_bytes: Some(max_peer_bytes),
            ..Default::default()
        };
        let q = FairServerMessageQueue::with_observer(Sink, NullObserver, config, Instant::now())
            .unwrap();
        SharedQueue::new(q)
    }

    #[test]
    fn producer_backs_off_at_the_bound() {
        // ---
        let q = bounded(1_000);
        let stop = Arc::new(AtomicBool::new(false));
        let handle =
            Producer::new(PeerId::new(1), Direction::Send, 100).spawn(q.clone(), Arc::clone(&stop));

        thread::sleep(Duration::from_millis(30));
        stop.store(true, Ordering::Relaxed);
        let stats = handle.join().unwrap();

        assert_eq!(stats.accepted_messages, 10);
        assert!(stats.backpressured > 0);
        assert_eq!(q.lock().pending_send_bytes(), 1_000);
    }

    #[test]
    fn inbound_producer_feeds_the_receive_side() {
        // ---
        let q = bounded(500);
        let stop = Arc::new(AtomicBool::new(false));
        let producer = Producer::new(PeerId::new(2), Direction::Receive, 50);
        let handle = producer.spawn(q.clone(), Arc::clone(&stop));

        thread::sleep(Duration::from_millis(20));
        q.service(Instant::now());
        thread::sleep(Duration::from_millis(20));
        stop.store(true, Ordering::Relaxed);
        let stats = handle.join().unwrap();

        // First fill, one drain into the delivery FIFO, second fill.
        assert_eq!(stats.accepted_messages, 20);
        assert_eq!(q.lock().delivery_len(), 10);
        assert_eq!(q.lock().pending_receive_bytes(), 500);
    }
}
