use std::net::IpAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::ping::ping_with_fallback;
use super::{resolve_target, Measurement, ProbeType, Prober};

/// Hard ceiling on one full run (idle phase + loaded phase).
const RUN_DEADLINE: Duration = Duration::from_secs(30);

/// Client timeout for the saturating download.
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(25);

/// TCP ramp-up wait before the loaded ping; measuring during slow-start
/// underestimates the queueing delay.
const WARMUP: Duration = Duration::from_millis(500);

/// How long to wait for the cancelled download to wind down. The result
/// does not depend on its cleanup.
const DRAIN_WINDOW: Duration = Duration::from_secs(1);

const DEFAULT_PING_TARGET: &str = "1.1.1.1";
const DEFAULT_DOWNLOAD_URL: &str = "https://speed.cloudflare.com/__down?bytes=5000000";

/// Latency-under-load probe.
///
/// Derives bufferbloat as `loaded_latency - idle_latency` against a
/// single ping target, saturating the downlink with a large download
/// while the loaded ping runs.
pub struct BufferbloatProbe {
    ping_target: String,
    download_url: String,
    ping_count: usize,
}

impl BufferbloatProbe {
    /// Creates a bufferbloat probe. Empty arguments fall back to a
    /// public ping target and download URL.
    pub fn new(ping_target: &str, download_url: &str) -> Self {
        let ping_target = if ping_target.is_empty() {
            DEFAULT_PING_TARGET
        } else {
            ping_target
        };
        let download_url = if download_url.is_empty() {
            DEFAULT_DOWNLOAD_URL
        } else {
            download_url
        };

        Self {
            ping_target: ping_target.to_string(),
            download_url: download_url.to_string(),
            ping_count: super::ping::DEFAULT_PING_COUNT,
        }
    }

    async fn measure(&self) -> Result<Vec<Measurement>> {
        let addr = resolve_target(&self.ping_target).await?;

        let idle_latency = self
            .measure_latency(addr)
            .await
            .context("measuring idle latency")?;

        let loaded_latency = self
            .measure_latency_under_load(addr)
            .await
            .context("measuring loaded latency")?;

        Ok(vec![build_measurement(
            &self.ping_target,
            idle_latency,
            loaded_latency,
        )])
    }

    /// Average RTT in milliseconds over one echo sequence.
    async fn measure_latency(&self, addr: IpAddr) -> Result<f64> {
        let stats = ping_with_fallback(addr, self.ping_count)
            .await
            .context("no successful pings")?;

        Ok(stats.avg_ms())
    }

    /// Pings while a concurrent download keeps the link saturated, then
    /// cancels the download and waits briefly for it to acknowledge.
    async fn measure_latency_under_load(&self, addr: IpAddr) -> Result<f64> {
        let cancel = CancellationToken::new();
        let download = tokio::spawn(run_download(
            self.download_url.clone(),
            cancel.child_token(),
        ));

        tokio::time::sleep(WARMUP).await;

        let latency = self.measure_latency(addr).await.context("loaded ping")?;

        cancel.cancel();

        match tokio::time::timeout(DRAIN_WINDOW, download).await {
            Ok(Ok(Err(e))) => debug!(error = %e, "download ended with error"),
            Ok(Err(e)) => debug!(error = %e, "download task join failed"),
            Ok(Ok(Ok(()))) => {}
            // Drain window elapsed; the download task unwinds on its own
            // and the latency result stands.
            Err(_) => {}
        }

        Ok(latency)
    }
}

impl Prober for BufferbloatProbe {
    fn probe_type(&self) -> ProbeType {
        ProbeType::Bufferbloat
    }

    async fn run(&self) -> Result<Vec<Measurement>> {
        tokio::time::timeout(RUN_DEADLINE, self.measure())
            .await
            .context("bufferbloat run exceeded deadline")?
    }
}

/// Streams the download URL, discarding body bytes as they arrive so
/// backpressure keeps the link saturated, until cancelled or complete.
async fn run_download(url: String, cancel: CancellationToken) -> Result<()> {
    let client = reqwest::Client::builder()
        .timeout(DOWNLOAD_TIMEOUT)
        .build()
        .context("building download client")?;

    let resp = client
        .get(&url)
        .send()
        .await
        .context("download request failed")?;

    if !resp.status().is_success() {
        anyhow::bail!("download failed with status {}", resp.status());
    }

    let mut stream = resp.bytes_stream();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            chunk = stream.next() => match chunk {
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e).context("reading download body"),
                None => return Ok(()),
            }
        }
    }
}

fn build_measurement(target: &str, idle_latency_ms: f64, loaded_latency_ms: f64) -> Measurement {
    let mut m = Measurement::new(ProbeType::Bufferbloat, target);
    m.latency_avg = Some(idle_latency_ms);
    m.bufferbloat = Some(loaded_latency_ms - idle_latency_ms);
    m
}
