//! Runtime glue around the fair server message queue.
//!
//! - [`config`]  : clap [`Config`] and its conversion into domain settings
//! - [`shared`]  : [`SharedQueue`], the scheduler behind a mutex
//! - [`driver`]  : [`ServiceDriver`], the periodic `service` task
//! - [`producer`]: [`Producer`], synthetic per-peer traffic threads

pub mod config;
pub mod driver;
pub mod producer;
pub mod shared;

// --- public API
pub use config::{Config, WeightArg};
pub use driver::{DriverTotals, ServiceDriver};
pub use producer::{Producer, ProducerStats};
pub use shared::SharedQueue;
