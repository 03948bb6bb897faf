//! In-process link simulator for fairlink testing and demos.
//!
//! [`LinkSimTransport`] implements [`fairlink_domain::PeerTransport`] on top
//! of per-peer simulated socket buffers instead of real sockets.
//! [`LinkSimHandle`] drives it from the outside. [`LinkSimConfig`] controls
//! the impairments:
//!
//! - Socket write-buffer capacity (drives `can_send` infeasibility)
//! - Per-peer wire drain rate
//! - Whole-link outage and per-peer stalls
//! - Injected feasibility-check faults with a deterministic RNG seed
//!
//! # Quick start
//!
//! ```rust
//! use fairlink_domain::PeerId;
//! use fairlink_link_sim::{LinkSimConfig, LinkSimTransport};
//!
//! let (transport, link) = LinkSimTransport::new(LinkSimConfig::congested());
//! link.connect(PeerId::new(1));
//! # drop(transport);
//! ```

mod config;
mod connection;
mod error;
mod transport;

// --- public API
pub use config::LinkSimConfig;
pub use connection::ConnectionStats;
pub use error::LinkSimError;
pub use transport::{LinkSimHandle, LinkSimTransport, WireFrame};
