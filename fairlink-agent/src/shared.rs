//! [`SharedQueue`]: one scheduler shared between producer threads, the
//! service driver and the consumer.
//!
//! The scheduler itself is single-owner. Every operation here takes the
//! mutex for its duration, so concurrent `service` calls are serialized and
//! producers never observe a half-finished tick. Nothing awaits while the
//! lock is held.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

// ---

use fairlink_domain::{
    // ---
    FairServerMessageQueue,
    Message,
    PeerId,
    PeerTransport,
    QueueInfo,
    QueueObserver,
    Result,
    ServerMessageQueue,
    ServiceReport,
    TracingObserver,
};

// ---------------------------------------------------------------------------
// SharedQueue
// ---------------------------------------------------------------------------

pub struct SharedQueue<T, O = TracingObserver> {
    inner: Arc<Mutex<FairServerMessageQueue<T, O>>>,
}

// ---

impl<T, O> Clone for SharedQueue<T, O> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

// ---

impl<T: PeerTransport, O: QueueObserver> SharedQueue<T, O> {
    // ---
    pub fn new(queue: FairServerMessageQueue<T, O>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(queue)),
        }
    }

    /// Lock the scheduler. A panic in another holder does not leave the
    /// queue in a torn state (every mutation completes before returning),
    /// so a poisoned lock is taken over.
    pub fn lock(&self) -> MutexGuard<'_, FairServerMessageQueue<T, O>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ---

    pub fn add_message(&self, peer: PeerId, msg: Message) -> Result<()> {
        self.lock().add_message(peer, msg)
    }

    pub fn on_bytes_arrived(&self, peer: PeerId, msg: Message) -> Result<()> {
        self.lock().on_bytes_arrived(peer, msg)
    }

    pub fn receive(&self) -> Option<(Message, PeerId)> {
        self.lock().receive()
    }

    pub fn service(&self, now: Instant) -> ServiceReport {
        self.lock().service(now)
    }

    pub fn set_server_weight(&self, peer: PeerId, weight: f64) -> Result<()> {
        self.lock().set_server_weight(peer, weight)
    }

    pub fn set_send_weight(&self, peer: PeerId, weight: f64) -> Result<()> {
        self.lock().set_send_weight(peer, weight)
    }

    pub fn set_receive_weight(&self, peer: PeerId, weight: f64) -> Result<()> {
        self.lock().set_receive_weight(peer, weight)
    }

    pub fn remove_peer(&self, peer: PeerId) -> usize {
        self.lock().remove_peer(peer)
    }

    pub fn queue_info(&self) -> Vec<QueueInfo> {
        self.lock().queue_info()
    }

    pub fn report_queue_info(&self, now: Instant) -> Vec<QueueInfo> {
        self.lock().report_queue_info(now)
    }
}

// ---

impl<T: PeerTransport, O: QueueObserver> ServerMessageQueue for SharedQueue<T, O> {
    // ---
    fn add_message(&mut self, peer: PeerId, msg: Message) -> Result<()> {
        SharedQueue::add_message(self, peer, msg)
    }

    fn receive(&mut self) -> Option<(Message, PeerId)> {
        SharedQueue::receive(self)
    }

    fn service(&mut self, now: Instant) -> ServiceReport {
        SharedQueue::service(self, now)
    }

    fn set_server_weight(&mut self, peer: PeerId, weight: f64) -> Result<()> {
        SharedQueue::set_server_weight(self, peer, weight)
    }

    fn queue_info(&self) -> Vec<QueueInfo> {
        SharedQueue::queue_info(self)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
