pub mod bufferbloat;
pub mod dns;
pub mod ping;
pub mod scheduler;

use std::net::IpAddr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use bufferbloat::BufferbloatProbe;
pub use dns::DnsProbe;
pub use ping::PingProbe;
pub use scheduler::{MeasurementHandler, Scheduler};

/// Identifies the kind of measurement a probe produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeType {
    Ping,
    Dns,
    Bufferbloat,
}

impl ProbeType {
    /// Returns the canonical string form used in storage and on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Dns => "dns",
            Self::Bufferbloat => "bufferbloat",
        }
    }

    /// Parses the canonical string form.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "ping" => Ok(Self::Ping),
            "dns" => Ok(Self::Dns),
            "bufferbloat" => Ok(Self::Bufferbloat),
            other => anyhow::bail!("unknown probe type {other:?}"),
        }
    }
}

impl std::fmt::Display for ProbeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single sample produced by one probe run against one target.
///
/// Metrics not relevant to a probe kind stay `None` and round-trip as
/// SQL NULL / omitted JSON keys, never as zero.
#[derive(Debug, Clone, Serialize)]
pub struct Measurement {
    pub timestamp: DateTime<Utc>,
    pub probe_type: ProbeType,
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_avg: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_p95: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jitter: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packet_loss: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bufferbloat: Option<f64>,
}

impl Measurement {
    /// Creates a measurement stamped now, with all metrics absent.
    pub fn new(probe_type: ProbeType, target: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            probe_type,
            target: target.into(),
            latency_min: None,
            latency_avg: None,
            latency_max: None,
            latency_p95: None,
            jitter: None,
            packet_loss: None,
            dns_time: None,
            bufferbloat: None,
        }
    }
}

/// Prober is the capability all probe implementations provide.
///
/// `run` is synchronous from the scheduler's viewpoint; it may fan out
/// internally but must come back within its own internal timeout. On
/// total failure it returns an error and no measurements; on partial
/// failure it returns only the successful targets.
pub trait Prober: Send + Sync {
    /// Returns the probe type identifier.
    fn probe_type(&self) -> ProbeType;

    /// Executes the probe and returns its measurements.
    fn run(&self) -> impl std::future::Future<Output = Result<Vec<Measurement>>> + Send;
}

/// Probe dispatches to a concrete prober.
///
/// Uses enum dispatch rather than trait objects for zero-cost async
/// dispatch (avoids `Pin<Box<dyn Future>>` overhead on every run).
pub enum Probe {
    Ping(PingProbe),
    Dns(DnsProbe),
    Bufferbloat(BufferbloatProbe),
    #[cfg(test)]
    Test(test_support::TestProbe),
}

impl Probe {
    /// Returns the probe type identifier.
    pub fn probe_type(&self) -> ProbeType {
        match self {
            Self::Ping(p) => p.probe_type(),
            Self::Dns(p) => p.probe_type(),
            Self::Bufferbloat(p) => p.probe_type(),
            #[cfg(test)]
            Self::Test(p) => p.probe_type(),
        }
    }

    /// Executes the probe and returns its measurements.
    pub async fn run(&self) -> Result<Vec<Measurement>> {
        match self {
            Self::Ping(p) => p.run().await,
            Self::Dns(p) => p.run().await,
            Self::Bufferbloat(p) => p.run().await,
            #[cfg(test)]
            Self::Test(p) => p.run().await,
        }
    }
}

/// Resolves a target spec (IP literal or hostname) to an address.
pub(crate) async fn resolve_target(target: &str) -> Result<IpAddr> {
    if let Ok(ip) = target.parse::<IpAddr>() {
        return Ok(ip);
    }

    let mut addrs = tokio::net::lookup_host((target, 0))
        .await
        .with_context(|| format!("resolving {target}"))?;

    addrs
        .next()
        .map(|a| a.ip())
        .with_context(|| format!("no addresses for {target}"))
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::Result;

    use super::{Measurement, ProbeType, Prober};

    /// Scripted probe for scheduler tests: sleeps, counts runs, and
    /// flags any overlapping execution of itself.
    pub struct TestProbe {
        pub delay: Duration,
        pub runs: Arc<AtomicUsize>,
        pub active: Arc<AtomicBool>,
        pub overlapped: Arc<AtomicBool>,
    }

    impl TestProbe {
        pub fn new(delay: Duration) -> Self {
            Self {
                delay,
                runs: Arc::new(AtomicUsize::new(0)),
                active: Arc::new(AtomicBool::new(false)),
                overlapped: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    impl Prober for TestProbe {
        fn probe_type(&self) -> ProbeType {
            ProbeType::Ping
        }

        async fn run(&self) -> Result<Vec<Measurement>> {
            if self.active.swap(true, Ordering::SeqCst) {
                self.overlapped.store(true, Ordering::SeqCst);
            }

            tokio::time::sleep(self.delay).await;

            self.active.store(false, Ordering::SeqCst);
            self.runs.fetch_add(1, Ordering::SeqCst);

            Ok(vec![Measurement::new(ProbeType::Ping, "test-target")])
        }
    }
}
