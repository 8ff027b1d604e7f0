use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::health::HealthServer;
use crate::probe::ping::DEFAULT_PING_COUNT;
use crate::probe::{
    BufferbloatProbe, DnsProbe, MeasurementHandler, PingProbe, Probe, Scheduler,
};
use crate::push::Pusher;
use crate::store::Store;

/// How often the pusher drains the buffer.
const PUSH_INTERVAL: Duration = Duration::from_secs(60);

/// How often retention cleanup runs.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Domain queried by the DNS probe; only the round trip matters.
const QUERY_DOMAIN: &str = "example.com";

/// Agent orchestrates all components: store, scheduler, pusher,
/// retention cleanup, and the health endpoint.
pub struct Agent {
    cfg: Config,
    store: Arc<Store>,
    health: HealthServer,
    cancel: CancellationToken,
    scheduler_task: Option<JoinHandle<()>>,
    pusher_task: Option<JoinHandle<()>>,
    cleanup_task: Option<JoinHandle<()>>,
}

impl Agent {
    /// Creates a new Agent, opening the measurement store. A store that
    /// cannot be opened or migrated is a fatal initialization failure.
    pub fn new(cfg: Config, health_addr: &str) -> Result<Self> {
        let store = Store::open(&cfg.storage.db_path).context("opening measurement store")?;
        info!(db_path = %cfg.storage.db_path.display(), "storage initialized");

        Ok(Self {
            cfg,
            store: Arc::new(store),
            health: HealthServer::new(health_addr),
            cancel: CancellationToken::new(),
            scheduler_task: None,
            pusher_task: None,
            cleanup_task: None,
        })
    }

    /// Start all components and begin measuring.
    pub async fn start(&mut self) -> Result<()> {
        // 1. Health endpoint first so liveness answers during startup.
        self.health
            .start()
            .await
            .context("starting health server")?;

        // 2. Sink: persist each run's batch, then update health. A save
        // failure loses that batch only; the next tick measures afresh.
        let sink_store = Arc::clone(&self.store);
        let health_state = self.health.state();
        let handler: MeasurementHandler = Box::new(move |measurements| {
            if let Err(e) = sink_store.save_measurements(measurements) {
                error!(error = %e, "failed to save measurements");
                return;
            }

            for m in measurements {
                health_state.record_measurement(m.probe_type);
            }

            debug!(count = measurements.len(), "measurements saved");
        });

        // 3. Scheduler with the three probes on their cadences.
        let mut scheduler = Scheduler::new(handler);

        scheduler.add(
            Probe::Ping(PingProbe::new(
                self.cfg.targets.ping.clone(),
                DEFAULT_PING_COUNT,
            )),
            self.cfg.schedule.ping_interval,
        );

        scheduler.add(
            Probe::Dns(DnsProbe::new(self.cfg.targets.dns.clone(), QUERY_DOMAIN)),
            self.cfg.schedule.dns_interval,
        );

        let bufferbloat_target = self
            .cfg
            .targets
            .ping
            .first()
            .map(String::as_str)
            .unwrap_or_default();
        scheduler.add(
            Probe::Bufferbloat(BufferbloatProbe::new(
                bufferbloat_target,
                &self.cfg.targets.bufferbloat_download_url,
            )),
            self.cfg.schedule.bufferbloat_interval,
        );

        self.scheduler_task = Some(tokio::spawn(scheduler.run(self.cancel.child_token())));

        // 4. Pusher, unless running local-only.
        if self.cfg.push_enabled() {
            let pusher = Pusher::new(
                self.cfg.server.url.clone(),
                self.cfg.server.api_key.clone(),
                self.cfg.server.probe_id.clone(),
                Arc::clone(&self.store),
            )
            .context("creating pusher")?;

            let cancel = self.cancel.child_token();
            self.pusher_task = Some(tokio::spawn(async move {
                pusher.run(cancel, PUSH_INTERVAL).await;
            }));
        } else {
            warn!("no server URL or API key configured, running in local-only mode");
        }

        // 5. Daily retention cleanup.
        self.cleanup_task = Some(self.spawn_cleanup());

        info!(probe_name = %self.cfg.probe.name, "agent fully started");

        Ok(())
    }

    /// Gracefully stop all components, draining in-flight work.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        // The scheduler returns once every in-flight run has finished.
        if let Some(task) = self.scheduler_task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "scheduler task join failed");
            }
        }

        // The pusher makes one final drain attempt before returning.
        if let Some(task) = self.pusher_task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "pusher task join failed");
            }
        }

        if let Some(task) = self.cleanup_task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "cleanup task join failed");
            }
        }

        self.health.stop().await?;

        self.store.close().context("closing store")?;

        Ok(())
    }

    /// Spawn the daily cleanup loop. On shutdown it aborts the sleep
    /// and returns without running a partial cleanup.
    fn spawn_cleanup(&self) -> JoinHandle<()> {
        let cancel = self.cancel.child_token();
        let store = Arc::clone(&self.store);
        let retention_days = self.cfg.storage.local_retention_days;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(
                tokio::time::Instant::now() + CLEANUP_INTERVAL,
                CLEANUP_INTERVAL,
            );
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        match store.cleanup(retention_days) {
                            Ok(deleted) => {
                                info!(retention_days, deleted, "cleanup completed");
                            }
                            Err(e) => {
                                error!(error = %e, "cleanup failed");
                            }
                        }
                    }
                }
            }
        })
    }
}
