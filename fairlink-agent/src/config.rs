//! CLI configuration for `fairlink-agent`.
//!
//! Usage:
//!   fairlink-agent --peers 3 --send-rate 65536 --weight 2=3 --duration-secs 10
//!   fairlink-agent --link-buffer 4096 --link-rate 16384 --fault-percent 1 --json

use std::time::Duration;

// ---

use anyhow::{bail, Context};
use clap::Parser;

// ---

use fairlink_domain::{PeerId, QueueConfig};
use fairlink_link_sim::LinkSimConfig;

// ---------------------------------------------------------------------------
// WeightArg
// ---------------------------------------------------------------------------

/// One `<peer>=<weight>` command-line assignment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightArg {
    pub peer: PeerId,
    pub weight: f64,
}

/// Parse `3=2.5` or `server-3=2.5`.
fn parse_weight(s: &str) -> Result<WeightArg, String> {
    // ---
    let (peer, weight) = s
        .split_once('=')
        .ok_or_else(|| format!("expected <peer>=<weight>, got {s:?}"))?;

    let peer: PeerId = peer
        .trim()
        .parse()
        .map_err(|e| format!("bad peer id {peer:?}: {e}"))?;
    let weight: f64 = weight
        .trim()
        .parse()
        .map_err(|e| format!("bad weight {weight:?}: {e}"))?;

    if !weight.is_finite() || weight <= 0.0 {
        return Err(format!("weight must be finite and > 0, got {weight}"));
    }
    Ok(WeightArg { peer, weight })
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Parser)]
#[command(
    name = "fairlink-agent",
    about = "Weighted fair inter-server message scheduler over a simulated link"
)]
pub struct Config {
    // ---
    /// Outbound rate ceiling in bytes per second. 0 = unlimited.
    #[arg(long, default_value_t = 64 * 1024)]
    pub send_rate: u64,

    /// Inbound rate ceiling in bytes per second. 0 = unlimited.
    #[arg(long, default_value_t = 64 * 1024)]
    pub recv_rate: u64,

    /// Number of simulated peers, numbered 1..=N.
    #[arg(long, default_value_t = 3)]
    pub peers: u32,

    /// Weight for both directions of one peer, as `<peer>=<weight>`.
    /// Repeatable.
    #[arg(long = "weight", value_parser = parse_weight)]
    pub weights: Vec<WeightArg>,

    /// Outbound-only weight override, as `<peer>=<weight>`. Repeatable.
    #[arg(long = "send-weight", value_parser = parse_weight)]
    pub send_weights: Vec<WeightArg>,

    /// Inbound-only weight override, as `<peer>=<weight>`. Repeatable.
    #[arg(long = "recv-weight", value_parser = parse_weight)]
    pub recv_weights: Vec<WeightArg>,

    /// Per-peer queued byte bound, per direction. 0 = unbounded.
    #[arg(long, default_value_t = 64 * 1024)]
    pub max_peer_bytes: u64,

    /// Queued byte bound across all peers, per direction. 0 = unbounded.
    #[arg(long, default_value_t = 0)]
    pub max_total_bytes: u64,

    /// Messages moved per direction in one service call.
    #[arg(long, default_value_t = 1_024)]
    pub max_items_per_service: usize,

    /// Delivered-but-unconsumed inbound messages before the receive phase
    /// pauses. 0 = unbounded.
    #[arg(long, default_value_t = 0)]
    pub max_delivery_backlog: usize,

    /// Service period in milliseconds.
    #[arg(long, default_value_t = 10)]
    pub tick_ms: u64,

    /// Payload size of generated messages, bytes.
    #[arg(long, default_value_t = 1_024)]
    pub message_size: usize,

    /// Run for this many seconds, then exit. 0 = until Ctrl-C.
    #[arg(long, default_value_t = 0)]
    pub duration_secs: u64,

    /// Queue report period in seconds. 0 = no periodic report.
    #[arg(long, default_value_t = 1)]
    pub report_secs: u64,

    /// Simulated socket write buffer per peer, bytes.
    #[arg(long, default_value_t = 64 * 1024)]
    pub link_buffer: u64,

    /// Simulated wire drain rate per peer, bytes per second. 0 = instant.
    #[arg(long, default_value_t = 0)]
    pub link_rate: u64,

    /// Percentage of feasibility checks that fail with an injected fault.
    #[arg(long, default_value_t = 0.0)]
    pub fault_percent: f64,

    /// RNG seed for reproducible fault injection.
    #[arg(long)]
    pub seed: Option<u64>,

    /// Emit queue reports as JSON lines on stdout.
    #[arg(long)]
    pub json: bool,
}

// ---

impl Config {
    // ---
    /// Scheduler settings derived from the command line.
    pub fn queue_config(&self) -> anyhow::Result<QueueConfig> {
        // ---
        let non_zero = |v: u64| (v > 0).then_some(v);

        let config = QueueConfig {
            send_bytes_per_sec: self.send_rate,
            recv_bytes_per_sec: self.recv_rate,
            max_peer_bytes: non_zero(self.max_peer_bytes),
            max_total_bytes: non_zero(self.max_total_bytes),
            max_items_per_service: self.max_items_per_service,
            max_delivery_backlog: (self.max_delivery_backlog > 0)
                .then_some(self.max_delivery_backlog),
        };

        // Producers run flat out; without a bound they would grow the
        // queues without limit.
        if config.max_peer_bytes.is_none() && config.max_total_bytes.is_none() {
            bail!("at least one of --max-peer-bytes / --max-total-bytes must be non-zero");
        }

        config.validate().context("invalid queue configuration")?;
        Ok(config)
    }

    /// Link simulator settings derived from the command line.
    pub fn link_config(&self) -> anyhow::Result<LinkSimConfig> {
        // ---
        if !(0.0..=100.0).contains(&self.fault_percent) {
            bail!("--fault-percent must be within 0..=100, got {}", self.fault_percent);
        }
        Ok(LinkSimConfig {
            buffer_bytes: self.link_buffer,
            wire_bytes_per_sec: (self.link_rate > 0).then_some(self.link_rate),
            fault_percent: self.fault_percent / 100.0,
            seed: self.seed,
        })
    }

    pub fn peer_ids(&self) -> impl Iterator<Item = PeerId> {
        (1..=self.peers).map(PeerId::new)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    pub fn report_every(&self) -> Option<Duration> {
        (self.report_secs > 0).then(|| Duration::from_secs(self.report_secs))
    }

    pub fn run_for(&self) -> Option<Duration> {
        (self.duration_secs > 0).then(|| Duration::from_secs(self.duration_secs))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
