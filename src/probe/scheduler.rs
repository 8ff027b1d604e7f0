use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::{Measurement, Probe};

/// Called with each run's measurements, on the probe's own task.
pub type MeasurementHandler = Box<dyn Fn(&[Measurement]) + Send + Sync>;

struct ScheduledProbe {
    probe: Probe,
    interval: Duration,
}

/// Scheduler drives registered probes on independent cadences and
/// delivers their measurements to a handler callback.
///
/// Each probe owns a task: tick zero fires immediately, then a fixed
/// monotone ticker with skipped (not queued) overdue ticks. A probe
/// never overlaps itself; probes run fully in parallel with no shared
/// lock. Errors from a run are absorbed here and scheduling continues.
pub struct Scheduler {
    probes: Vec<ScheduledProbe>,
    handler: Arc<MeasurementHandler>,
}

impl Scheduler {
    /// Creates a scheduler delivering measurements to `handler`.
    pub fn new(handler: MeasurementHandler) -> Self {
        Self {
            probes: Vec::new(),
            handler: Arc::new(handler),
        }
    }

    /// Registers a probe with its execution interval.
    pub fn add(&mut self, probe: Probe, interval: Duration) {
        self.probes.push(ScheduledProbe { probe, interval });
    }

    /// Runs all registered probes until `cancel` fires, then waits for
    /// every in-flight run to return.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut tasks = JoinSet::new();

        for sp in self.probes.drain(..) {
            let handler = Arc::clone(&self.handler);
            let cancel = cancel.clone();
            tasks.spawn(run_probe(sp, handler, cancel));
        }

        info!(probe_count = tasks.len(), "scheduler started");

        while tasks.join_next().await.is_some() {}

        info!("scheduler stopped");
    }
}

async fn run_probe(sp: ScheduledProbe, handler: Arc<MeasurementHandler>, cancel: CancellationToken) {
    let probe_type = sp.probe.probe_type();
    info!(probe = %probe_type, interval = ?sp.interval, "starting probe");

    // Tick zero: run immediately, then settle onto the ticker.
    execute_probe(&sp.probe, &handler).await;

    let mut ticker = tokio::time::interval_at(Instant::now() + sp.interval, sp.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(probe = %probe_type, "stopping probe");
                return;
            }
            _ = ticker.tick() => {
                // Runs to completion before the next select, so a slow
                // run delays (and Skip then drops) overdue ticks rather
                // than stacking them, and cancellation waits it out.
                execute_probe(&sp.probe, &handler).await;
            }
        }
    }
}

async fn execute_probe(probe: &Probe, handler: &MeasurementHandler) {
    let probe_type = probe.probe_type();
    let start = Instant::now();

    match probe.run().await {
        Err(e) => {
            error!(
                probe = %probe_type,
                elapsed = ?start.elapsed(),
                error = %e,
                "probe run failed",
            );
        }
        Ok(measurements) => {
            debug!(
                probe = %probe_type,
                measurements = measurements.len(),
                elapsed = ?start.elapsed(),
                "probe completed",
            );

            if !measurements.is_empty() {
                handler(&measurements);
            }
        }
    }
}
