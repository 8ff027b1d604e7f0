//! Local liveness endpoint reporting per-probe sink freshness.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Deadline for the HTTP server to finish in-flight requests on stop.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

/// Shared counters behind the /health endpoint. Updated lock-free from
/// the probe sink; no ordering is required between the fields.
pub struct HealthState {
    started_at: DateTime<Utc>,
    measurement_count: AtomicI64,
    last_ping_ms: AtomicI64,
    last_dns_ms: AtomicI64,
    last_bufferbloat_ms: AtomicI64,
}

impl HealthState {
    fn new() -> Self {
        Self {
            started_at: Utc::now(),
            measurement_count: AtomicI64::new(0),
            last_ping_ms: AtomicI64::new(0),
            last_dns_ms: AtomicI64::new(0),
            last_bufferbloat_ms: AtomicI64::new(0),
        }
    }

    /// Records one sunk measurement of the given kind.
    pub fn record_measurement(&self, probe_type: crate::probe::ProbeType) {
        self.measurement_count.fetch_add(1, Ordering::Relaxed);

        let now = Utc::now().timestamp_millis();
        let slot = match probe_type {
            crate::probe::ProbeType::Ping => &self.last_ping_ms,
            crate::probe::ProbeType::Dns => &self.last_dns_ms,
            crate::probe::ProbeType::Bufferbloat => &self.last_bufferbloat_ms,
        };
        slot.store(now, Ordering::Relaxed);
    }

    fn status(&self) -> Status {
        Status {
            // Liveness, not readiness: true whenever the endpoint is up.
            healthy: true,
            uptime: format_uptime(self.started_at),
            last_ping: load_timestamp(&self.last_ping_ms),
            last_dns: load_timestamp(&self.last_dns_ms),
            last_bufferbloat: load_timestamp(&self.last_bufferbloat_ms),
            measurement_count: self.measurement_count.load(Ordering::Relaxed),
        }
    }
}

/// JSON document served at /health.
#[derive(Debug, Serialize)]
pub struct Status {
    pub healthy: bool,
    pub uptime: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_ping: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_dns: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_bufferbloat: Option<DateTime<Utc>>,
    pub measurement_count: i64,
}

fn load_timestamp(slot: &AtomicI64) -> Option<DateTime<Utc>> {
    let ms = slot.load(Ordering::Relaxed);
    if ms == 0 {
        return None;
    }
    Utc.timestamp_millis_opt(ms).single()
}

fn format_uptime(started_at: DateTime<Utc>) -> String {
    let elapsed = (Utc::now() - started_at).num_seconds().max(0) as u64;
    humantime::format_duration(Duration::from_secs(elapsed)).to_string()
}

/// HTTP server exposing the health status.
pub struct HealthServer {
    state: Arc<HealthState>,
    addr: String,
    shutdown: parking_lot::Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl HealthServer {
    /// Creates a health server that will listen on `addr` (the `:port`
    /// shorthand binds all interfaces).
    pub fn new(addr: &str) -> Self {
        Self {
            state: Arc::new(HealthState::new()),
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
        }
    }

    /// Handle for the probe sink to record measurements.
    pub fn state(&self) -> Arc<HealthState> {
        Arc::clone(&self.state)
    }

    /// Binds the listener and starts serving in a background task.
    pub async fn start(&self) -> Result<()> {
        let bind_addr = if self.addr.starts_with(':') {
            format!("0.0.0.0{}", self.addr)
        } else {
            self.addr.clone()
        };

        let app = Router::new()
            .route("/health", get(health_handler))
            .with_state(Arc::clone(&self.state));

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        let serve_cancel = cancel.clone();

        let handle = tokio::spawn(async move {
            info!(addr = %local_addr, "health server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                serve_cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                error!(error = %e, "health server error");
            }
        });

        *self.shutdown.lock() = Some((cancel, handle));

        Ok(())
    }

    /// Gracefully shuts the server down, waiting up to the deadline for
    /// in-flight requests.
    pub async fn stop(&self) -> Result<()> {
        let Some((cancel, handle)) = self.shutdown.lock().take() else {
            return Ok(());
        };

        cancel.cancel();

        if tokio::time::timeout(SHUTDOWN_DEADLINE, handle).await.is_err() {
            error!("health server did not stop within deadline");
        }

        Ok(())
    }
}

async fn health_handler(State(state): State<Arc<HealthState>>) -> Json<Status> {
    Json(state.status())
}
