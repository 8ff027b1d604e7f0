//! Batching push pipeline from the local buffer to the ingest endpoint.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::Serialize;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::store::{format_timestamp, Store, StoredMeasurement};

/// Records drained per batch. The drain loop continues only while
/// batches come back full, which loosely bounds one tick's work while
/// still catching up after long outages.
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Per-request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Push failure kinds. Both are retried implicitly on the next tick;
/// rate limiting is kept distinct so operators can tell them apart in
/// the logs.
#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error("rate limited by server")]
    RateLimited,
    #[error("server returned {status}: {body}")]
    Status { status: StatusCode, body: String },
}

/// JSON body sent to the ingest endpoint.
#[derive(Serialize)]
struct IngestPayload<'a> {
    probe_id: &'a str,
    measurements: Vec<IngestMeasurement>,
}

/// One measurement on the wire. `latency_min`/`latency_max` are stored
/// locally but not shipped; absent metrics stay absent.
#[derive(Serialize)]
struct IngestMeasurement {
    timestamp: String,
    target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    latency_avg: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    latency_p95: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    jitter: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    packet_loss: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dns_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bufferbloat: Option<f64>,
}

impl IngestMeasurement {
    fn project(stored: &StoredMeasurement) -> Self {
        let m = &stored.measurement;
        Self {
            timestamp: format_timestamp(&m.timestamp),
            target: m.target.clone(),
            latency_avg: m.latency_avg,
            latency_p95: m.latency_p95,
            jitter: m.jitter,
            packet_loss: m.packet_loss,
            dns_time: m.dns_time,
            bufferbloat: m.bufferbloat,
        }
    }
}

/// Pusher drains unsynced measurements to the ingest endpoint.
///
/// Delivery is at-least-once: records are marked synced strictly after
/// a successful response, so a crash in between replays the batch and
/// the server deduplicates.
pub struct Pusher {
    server_url: String,
    api_key: String,
    probe_id: String,
    store: Arc<Store>,
    client: reqwest::Client,
    batch_size: usize,
}

impl Pusher {
    /// Creates a pusher for the given ingest server.
    pub fn new(
        server_url: impl Into<String>,
        api_key: impl Into<String>,
        probe_id: impl Into<String>,
        store: Arc<Store>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("building ingest HTTP client")?;

        Ok(Self {
            server_url: server_url.into(),
            api_key: api_key.into(),
            probe_id: probe_id.into(),
            store,
            client,
            batch_size: DEFAULT_BATCH_SIZE,
        })
    }

    /// Loops draining the buffer every `interval` until `cancel` fires,
    /// then makes one final drain attempt and returns.
    pub async fn run(&self, cancel: CancellationToken, interval: Duration) {
        info!(server = %self.server_url, interval = ?interval, "pusher started");

        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.push_all().await;
                    info!("pusher stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.push_all().await;
                }
            }
        }
    }

    /// Drains all pending batches. Any failure ends the drain; the next
    /// tick retries, which is the only backoff.
    pub async fn push_all(&self) {
        loop {
            let batch = match self.store.get_unsynced(self.batch_size) {
                Ok(batch) => batch,
                Err(e) => {
                    error!(error = %e, "failed to fetch unsynced measurements");
                    return;
                }
            };

            if batch.is_empty() {
                return;
            }

            if let Err(e) = self.push_batch(&batch).await {
                warn!(
                    batch_size = batch.len(),
                    error = %e,
                    "push failed, will retry next cycle",
                );
                return;
            }

            let ids: Vec<i64> = batch.iter().map(|m| m.id).collect();
            if let Err(e) = self.store.mark_synced(&ids) {
                error!(error = %e, "failed to mark measurements as synced");
                return;
            }

            info!(count = batch.len(), "pushed measurements");

            // A short batch means the buffer is drained.
            if batch.len() < self.batch_size {
                return;
            }
        }
    }

    async fn push_batch(&self, batch: &[StoredMeasurement]) -> Result<()> {
        let payload = IngestPayload {
            probe_id: &self.probe_id,
            measurements: batch.iter().map(IngestMeasurement::project).collect(),
        };

        let body = serde_json::to_vec(&payload).context("encoding ingest payload")?;
        let compressed = gzip(&body).context("compressing ingest payload")?;

        let url = format!("{}/api/v1/ingest", self.server_url);
        let resp = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .header(CONTENT_ENCODING, "gzip")
            .header("X-API-Key", &self.api_key)
            .body(compressed)
            .send()
            .await
            .context("sending ingest request")?;

        let status = resp.status();
        // Read the body regardless: it carries diagnostics on failure
        // and draining it keeps the connection reusable.
        let body = resp.text().await.unwrap_or_default();

        interpret_status(status, body)?;

        Ok(())
    }
}

/// Maps an ingest response to the push outcome. 207 means the server
/// rejected individual records but took the batch; at-least-once is
/// preserved by treating it as delivered.
fn interpret_status(status: StatusCode, body: String) -> Result<(), PushError> {
    match status {
        StatusCode::OK | StatusCode::MULTI_STATUS => Ok(()),
        StatusCode::TOO_MANY_REQUESTS => Err(PushError::RateLimited),
        _ => Err(PushError::Status { status, body }),
    }
}

fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).context("gzip write")?;
    encoder.finish().context("gzip finish")
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::probe::{Measurement, ProbeType};

    fn stored(id: i64) -> StoredMeasurement {
        let mut m = Measurement::new(ProbeType::Ping, "1.1.1.1");
        m.timestamp = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        m.latency_min = Some(5.0);
        m.latency_avg = Some(10.0);
        m.latency_max = Some(50.0);
        m.latency_p95 = Some(45.0);
        m.packet_loss = Some(0.0);

        StoredMeasurement {
            id,
            synced: false,
            measurement: m,
        }
    }

    #[test]
    fn test_interpret_status() {
        assert!(interpret_status(StatusCode::OK, String::new()).is_ok());
        assert!(interpret_status(StatusCode::MULTI_STATUS, String::new()).is_ok());

        let rate_limited = interpret_status(StatusCode::TOO_MANY_REQUESTS, String::new());
        assert!(matches!(rate_limited, Err(PushError::RateLimited)));

        let server_error =
            interpret_status(StatusCode::INTERNAL_SERVER_ERROR, "boom".to_string());
        match server_error {
            Err(PushError::Status { status, body }) => {
                assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
                assert_eq!(body, "boom");
            }
            other => panic!("expected status error, got {other:?}"),
        }
    }

    #[test]
    fn test_projection_drops_min_max() {
        let projected = IngestMeasurement::project(&stored(1));
        let json = serde_json::to_string(&projected).expect("serialize");

        assert!(!json.contains("latency_min"));
        assert!(!json.contains("latency_max"));
        assert!(json.contains("\"latency_avg\":10.0"));
        assert!(json.contains("\"latency_p95\":45.0"));
        // Absent metrics stay off the wire.
        assert!(!json.contains("dns_time"));
        assert!(!json.contains("bufferbloat"));
    }

    #[test]
    fn test_payload_shape() {
        let payload = IngestPayload {
            probe_id: "probe-7",
            measurements: vec![
                IngestMeasurement::project(&stored(1)),
                IngestMeasurement::project(&stored(2)),
            ],
        };

        let value: serde_json::Value =
            serde_json::from_slice(&serde_json::to_vec(&payload).expect("encode"))
                .expect("decode");

        assert_eq!(value["probe_id"], "probe-7");
        assert_eq!(value["measurements"].as_array().expect("array").len(), 2);
        assert_eq!(
            value["measurements"][0]["timestamp"],
            "2024-01-01T00:00:00.000000000Z",
        );
    }

    #[test]
    fn test_gzip_round_trip() {
        use std::io::Read;

        let data = b"{\"probe_id\":\"p\",\"measurements\":[]}";
        let compressed = gzip(data).expect("gzip");
        assert_ne!(compressed.as_slice(), data.as_slice());

        let mut decoder = flate2::read::GzDecoder::new(compressed.as_slice());
        let mut decompressed = Vec::new();
        decoder.read_to_end(&mut decompressed).expect("gunzip");
        assert_eq!(decompressed, data);
    }
}
