//! [`ServiceDriver`]: the periodic task that calls `service`.
//!
//! ```text
//!   tick ──► lock ──► service(now) ──► drain delivery FIFO ──► unlock
//!   report_every ──► queue report (tracing, optional JSON line on stdout)
//!   shutdown (watch) ──► final report, return totals
//! ```
//!
//! The driver also plays the consumer role for inbound traffic: everything
//! the receive phase delivered is taken off the FIFO in the same critical
//! section.

use std::time::{Duration, Instant};

// ---

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Interval, MissedTickBehavior};

// ---

use fairlink_domain::{
    // ---
    ByteCost,
    PeerTransport,
    QueueInfo,
    QueueObserver,
    ServerMessageQueue,
    ServiceReport,
    StopReason,
    TracingObserver,
};

use super::shared::SharedQueue;

// ---------------------------------------------------------------------------
// DriverTotals
// ---------------------------------------------------------------------------

/// Running totals across every tick the driver has run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DriverTotals {
    // ---
    pub ticks: u64,
    pub sent_messages: u64,
    pub sent_bytes: u64,
    pub received_messages: u64,
    pub received_bytes: u64,
    pub delivered_messages: u64,
    pub delivered_bytes: u64,

    /// Ticks whose send phase ended on the rate budget.
    pub send_budget_stops: u64,

    /// Ticks whose send phase ended with every backlogged peer infeasible.
    pub send_infeasible_stops: u64,
}

impl DriverTotals {
    // ---
    fn absorb(&mut self, report: &ServiceReport) {
        // ---
        self.ticks += 1;
        self.sent_messages += report.sent_messages as u64;
        self.sent_bytes += report.sent_bytes;
        self.received_messages += report.received_messages as u64;
        self.received_bytes += report.received_bytes;
        match report.send_stop {
            StopReason::Budget => self.send_budget_stops += 1,
            StopReason::Infeasible => self.send_infeasible_stops += 1,
            _ => {}
        }
    }
}

// ---

#[derive(Serialize)]
struct ReportLine<'a> {
    uptime_ms: u128,
    totals: &'a DriverTotals,
    queues: &'a [QueueInfo],
}

// ---------------------------------------------------------------------------
// ServiceDriver
// ---------------------------------------------------------------------------

pub struct ServiceDriver<T, O = TracingObserver> {
    // ---
    queue: SharedQueue<T, O>,
    tick: Duration,

    /// `None` = only the final report.
    report_every: Option<Duration>,

    /// Print each report as a JSON line on stdout as well as logging it.
    json: bool,

    started: Instant,
    totals: DriverTotals,
}

// ---

impl<T, O> ServiceDriver<T, O>
where
    T: PeerTransport + 'static,
    O: QueueObserver + 'static,
{
    // ---
    pub fn new(queue: SharedQueue<T, O>, tick: Duration) -> Self {
        // ---
        Self {
            queue,
            tick,
            report_every: None,
            json: false,
            started: Instant::now(),
            totals: DriverTotals::default(),
        }
    }

    pub fn with_reports(mut self, every: Option<Duration>, json: bool) -> Self {
        // ---
        self.report_every = every;
        self.json = json;
        self
    }

    // ---

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<DriverTotals> {
        tokio::spawn(self.run(shutdown))
    }

    /// Tick until `shutdown` turns `true` or its sender is dropped.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> DriverTotals {
        // ---
        tracing::info!(
            tick = ?self.tick,
            report_every = ?self.report_every,
            "service driver started",
        );
        self.started = Instant::now();

        let mut ticker = interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut reporter: Option<Interval> = self.report_every.map(|every| {
            let mut r = interval_at(tokio::time::Instant::now() + every, every);
            r.set_missed_tick_behavior(MissedTickBehavior::Skip);
            r
        });

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick_once(),

                _ = next_report(&mut reporter) => self.report(),

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.report();
        tracing::info!(
            ticks = self.totals.ticks,
            sent_bytes = self.totals.sent_bytes,
            delivered_bytes = self.totals.delivered_bytes,
            "service driver stopped",
        );
        self.totals
    }

    // ---

    fn tick_once(&mut self) {
        // ---
        let mut q = self.queue.lock();
        let report = q.service(Instant::now());
        self.totals.absorb(&report);

        while let Some((msg, _peer)) = q.receive() {
            self.totals.delivered_messages += 1;
            self.totals.delivered_bytes += msg.byte_cost();
        }
    }

    fn report(&self) {
        // ---
        let queues = self.queue.report_queue_info(Instant::now());
        tracing::info!(
            ticks = self.totals.ticks,
            sent_messages = self.totals.sent_messages,
            sent_bytes = self.totals.sent_bytes,
            received_bytes = self.totals.received_bytes,
            budget_stops = self.totals.send_budget_stops,
            infeasible_stops = self.totals.send_infeasible_stops,
            "driver report",
        );

        if self.json {
            let line = ReportLine {
                uptime_ms: self.started.elapsed().as_millis(),
                totals: &self.totals,
                queues: &queues,
            };
            match serde_json::to_string(&line) {
                Ok(json) => println!("{json}"),
                Err(e) => tracing::warn!("report serialization failed: {e}"),
            }
        }
    }
}

// ---

async fn next_report(reporter: &mut Option<Interval>) {
    // ---
    match reporter {
        Some(r) => {
            r.tick().await;
        }
        None => std::future::pending().await,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
