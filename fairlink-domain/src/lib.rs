//! Core types, weighted fair queue, rate limiter and fair server message
//! queue for the fairlink inter-server transport.
//!
//! This crate is the vocabulary of the system and holds the scheduling
//! core. It performs no I/O and spawns nothing: the transport is injected
//! through [`PeerTransport`] and time is whatever `Instant` the caller
//! passes to `service`.
//!
//! # Structure
//!
//! - `error`            : [`FairLinkError`] and [`Result<T>`] alias
//! - `peer`             : [`PeerId`]
//! - `message`          : [`Message`], [`ByteCost`]
//! - `transport`        : [`PeerTransport`] collaborator trait
//! - `queue`            : [`ServerMessageQueue`] contract, config and reports
//! - `observer`         : [`QueueObserver`] event hooks
//! - `fair_queue`       : [`WeightedFairQueue`]
//! - `rate_limiter`     : [`RateLimiter`]
//! - `fair_server_queue`: [`FairServerMessageQueue`]

mod error;
mod fair_queue;
mod fair_server_queue;
mod message;
mod observer;
mod peer;
mod queue;
mod rate_limiter;
mod transport;

// --- error
pub use error::{FairLinkError, OverflowScope, Result};

// --- peer / message
pub use message::{ByteCost, Message};
pub use peer::PeerId;

// --- transport
pub use transport::PeerTransport;

// --- queue contract
pub use queue::{
    // ---
    Direction,
    QueueConfig,
    QueueInfo,
    ServerMessageQueue,
    ServiceReport,
    StopReason,
};

// --- observer
pub use observer::{NullObserver, QueueObserver, TracingObserver, TransmitWindow};

// --- scheduling core
pub use fair_queue::{InvalidWeight, PeerStats, WeightedFairQueue, DEFAULT_WEIGHT};
pub use fair_server_queue::FairServerMessageQueue;
pub use rate_limiter::{Budget, RateLimiter};
