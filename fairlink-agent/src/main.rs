//! fairlink agent.
//!
//! Runs the fair server message queue against the in-process link
//! simulator: one outbound and one inbound producer per peer, a service
//! driver, and a wire drain. Prints per-peer shares on exit so weights can
//! be checked against what actually reached the wire.
//!
//! Usage:
//!   fairlink-agent --peers 3 --weight 3=4 --send-rate 65536 --duration-secs 10
//!   RUST_LOG=debug fairlink-agent --link-rate 8192 --link-buffer 4096

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

// ---

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::info;
use tracing_subscriber::EnvFilter;

// ---

use fairlink_agent::{Config, Producer, ServiceDriver, SharedQueue};
use fairlink_domain::{ByteCost, Direction, FairServerMessageQueue, PeerId};
use fairlink_link_sim::{LinkSimTransport, WireFrame};

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct PeerShare {
    peer: PeerId,
    weight: f64,
    wire_bytes: u64,
    share: f64,
}

// ---------------------------------------------------------------------------
// main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---
    let cfg = Config::parse();

    let no_color = std::env::var("EMACS").is_ok()
        || std::env::var("NO_COLOR").is_ok()
        || std::env::var("CARGO_TERM_COLOR").as_deref() == Ok("never")
        || !std::io::IsTerminal::is_terminal(&std::io::stdout());

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(!no_color)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "fairlink-agent starting");

    let queue_cfg = cfg.queue_config()?;
    let link_cfg = cfg.link_config()?;
    info!(?queue_cfg, ?link_cfg, peers = cfg.peers, "configuration");

    // Link simulator and scheduler.
    let (transport, link) = LinkSimTransport::new(link_cfg);
    for peer in cfg.peer_ids() {
        link.connect(peer);
    }

    let queue = FairServerMessageQueue::new(transport, queue_cfg, Instant::now())
        .context("failed to build scheduler")?;
    let queue = SharedQueue::new(queue);

    for w in &cfg.weights {
        queue
            .set_server_weight(w.peer, w.weight)
            .with_context(|| format!("--weight {}={}", w.peer, w.weight))?;
    }
    for w in &cfg.send_weights {
        queue
            .set_send_weight(w.peer, w.weight)
            .with_context(|| format!("--send-weight {}={}", w.peer, w.weight))?;
    }
    for w in &cfg.recv_weights {
        queue
            .set_receive_weight(w.peer, w.weight)
            .with_context(|| format!("--recv-weight {}={}", w.peer, w.weight))?;
    }

    // Wire: the link drain forwards finished frames here.
    let (wire_tx, mut wire_rx) = mpsc::unbounded_channel::<WireFrame>();
    let drain_task = link.spawn_drain(cfg.tick(), wire_tx);

    let (stop_tx, stop_rx) = watch::channel(false);

    let mut wire_stop = stop_rx.clone();
    let wire_task = tokio::spawn(async move {
        // ---
        let mut per_peer: BTreeMap<PeerId, u64> = BTreeMap::new();
        loop {
            tokio::select! {
                frame = wire_rx.recv() => match frame {
                    Some(frame) => {
                        *per_peer.entry(frame.peer).or_default() += frame.msg.byte_cost();
                    }
                    None => break,
                },
                _ = wire_stop.changed() => break,
            }
        }
        per_peer
    });

    // Producers: one outbound and one inbound per peer.
    let stop_producers = Arc::new(AtomicBool::new(false));
    let mut producers = Vec::new();
    for peer in cfg.peer_ids() {
        for direction in [Direction::Send, Direction::Receive] {
            let producer = Producer::new(peer, direction, cfg.message_size);
            producers.push(producer.spawn(queue.clone(), Arc::clone(&stop_producers)));
        }
    }

    let driver = ServiceDriver::new(queue.clone(), cfg.tick())
        .with_reports(cfg.report_every(), cfg.json)
        .spawn(stop_rx);

    info!(peers = cfg.peers, tick = ?cfg.tick(), "running");

    match cfg.run_for() {
        Some(d) => {
            tokio::select! {
                _ = tokio::time::sleep(d) => info!("run time elapsed"),
                r = tokio::signal::ctrl_c() => { r?; info!("interrupted"); }
            }
        }
        None => {
            tokio::signal::ctrl_c().await?;
            info!("interrupted");
        }
    }

    // Shutdown: producers first so the queue stops growing.
    info!("shutting down");
    stop_producers.store(true, Ordering::Relaxed);
    let producer_stats = tokio::task::spawn_blocking(move || {
        producers
            .into_iter()
            .filter_map(|h| h.join().ok())
            .collect::<Vec<_>>()
    })
    .await?;

    stop_tx.send(true).ok();
    let totals = driver.await?;
    let wire = wire_task.await?;
    drain_task.abort();

    let backpressured: u64 = producer_stats.iter().map(|s| s.backpressured).sum();
    info!(?totals, backpressured, "final totals");

    // Per-peer share of what reached the wire.
    let total_wire: u64 = wire.values().sum();
    let shares: Vec<PeerShare> = {
        let q = queue.lock();
        cfg.peer_ids()
            .map(|peer| {
                let wire_bytes = wire.get(&peer).copied().unwrap_or(0);
                PeerShare {
                    peer,
                    weight: q.server_weight(peer),
                    wire_bytes,
                    share: if total_wire == 0 {
                        0.0
                    } else {
                        wire_bytes as f64 / total_wire as f64
                    },
                }
            })
            .collect()
    };

    for s in &shares {
        info!(
            peer = %s.peer,
            weight = s.weight,
            wire_bytes = s.wire_bytes,
            share = %format!("{:.3}", s.share),
            "wire share",
        );
    }
    if cfg.json {
        println!("{}", serde_json::to_string(&shares)?);
    }

    Ok(())
}
