use std::net::IpAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use surge_ping::{Client, Config, PingIdentifier, PingSequence, ICMP};
use tokio::task::JoinSet;
use tracing::warn;

use super::{resolve_target, Measurement, ProbeType, Prober};

/// Echoes sent per target when the config does not override it.
pub const DEFAULT_PING_COUNT: usize = 10;

/// Wall-clock budget for one target's full echo sequence.
const TARGET_TIMEOUT: Duration = Duration::from_secs(10);

/// ICMP echo probe against a set of targets.
pub struct PingProbe {
    targets: Vec<String>,
    count: usize,
}

impl PingProbe {
    /// Creates a ping probe for the given targets, sending `count`
    /// echoes per target on each run.
    pub fn new(targets: Vec<String>, count: usize) -> Self {
        Self { targets, count }
    }

    async fn ping_target(target: &str, count: usize) -> Result<Measurement> {
        let addr = resolve_target(target).await?;

        let stats = ping_with_fallback(addr, count)
            .await
            .with_context(|| format!("no echo replies from {target}"))?;

        let mut m = Measurement::new(ProbeType::Ping, target);
        m.packet_loss = Some(stats.packet_loss());

        if !stats.rtts_ms.is_empty() {
            let min = stats.rtts_ms.iter().copied().fold(f64::INFINITY, f64::min);
            let max = stats
                .rtts_ms
                .iter()
                .copied()
                .fold(f64::NEG_INFINITY, f64::max);
            let avg = stats.rtts_ms.iter().sum::<f64>() / stats.rtts_ms.len() as f64;

            m.latency_min = Some(min);
            m.latency_avg = Some(avg);
            m.latency_max = Some(max);
            m.latency_p95 = Some(calculate_p95(&stats.rtts_ms));
            m.jitter = Some(calculate_jitter(&stats.rtts_ms));
        }

        Ok(m)
    }
}

impl Prober for PingProbe {
    fn probe_type(&self) -> ProbeType {
        ProbeType::Ping
    }

    async fn run(&self) -> Result<Vec<Measurement>> {
        let mut tasks = JoinSet::new();

        for target in &self.targets {
            let target = target.clone();
            let count = self.count;
            tasks.spawn(async move {
                let result = Self::ping_target(&target, count).await;
                (target, result)
            });
        }

        let mut measurements = Vec::new();
        let mut failures = Vec::new();

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(m))) => measurements.push(m),
                Ok((target, Err(e))) => {
                    warn!(target = %target, error = %e, "ping target failed");
                    failures.push(format!("{target}: {e:#}"));
                }
                Err(e) => failures.push(format!("ping task join: {e}")),
            }
        }

        if measurements.is_empty() && !failures.is_empty() {
            anyhow::bail!("all targets failed: {}", failures.join("; "));
        }

        Ok(measurements)
    }
}

/// Outcome of one echo sequence against a single address.
pub(crate) struct PingStats {
    pub sent: usize,
    pub received: usize,
    pub rtts_ms: Vec<f64>,
}

impl PingStats {
    /// Loss as a percentage of echoes sent.
    pub fn packet_loss(&self) -> f64 {
        if self.sent == 0 {
            return 0.0;
        }
        (self.sent - self.received) as f64 / self.sent as f64 * 100.0
    }

    /// Mean round-trip time in milliseconds, 0 with no replies.
    pub fn avg_ms(&self) -> f64 {
        if self.rtts_ms.is_empty() {
            return 0.0;
        }
        self.rtts_ms.iter().sum::<f64>() / self.rtts_ms.len() as f64
    }
}

/// Pings an address, trying a privileged raw socket first and falling
/// back to an unprivileged DGRAM socket when that attempt errors or
/// yields zero replies. Returns `None` when both attempts come back
/// empty.
///
/// Privilege is discovered at use time: the same binary runs as root on
/// bare metal and as an ordinary user in containers.
pub(crate) async fn ping_with_fallback(addr: IpAddr, count: usize) -> Option<PingStats> {
    if let Ok(client) = Client::new(&privileged_config(addr)) {
        let stats = ping_session(&client, addr, count).await;
        if stats.received > 0 {
            return Some(stats);
        }
    }

    let client = Client::new(&unprivileged_config(addr)).ok()?;
    let stats = ping_session(&client, addr, count).await;
    if stats.received > 0 {
        Some(stats)
    } else {
        None
    }
}

fn privileged_config(addr: IpAddr) -> Config {
    match addr {
        IpAddr::V4(_) => Config::default(),
        IpAddr::V6(_) => Config::builder().kind(ICMP::V6).build(),
    }
}

fn unprivileged_config(addr: IpAddr) -> Config {
    let builder = Config::builder().sock_type_hint(socket2::Type::DGRAM);
    match addr {
        IpAddr::V4(_) => builder.build(),
        IpAddr::V6(_) => builder.kind(ICMP::V6).build(),
    }
}

/// Sends `count` sequential echoes; the per-echo timeout divides the
/// target budget so the sequence stays within it.
async fn ping_session(client: &Client, addr: IpAddr, count: usize) -> PingStats {
    let mut pinger = client.pinger(addr, PingIdentifier(rand::random())).await;
    pinger.timeout(TARGET_TIMEOUT / count.max(1) as u32);

    let mut stats = PingStats {
        sent: 0,
        received: 0,
        rtts_ms: Vec::with_capacity(count),
    };

    for seq in 0..count {
        stats.sent += 1;
        if let Ok((_, rtt)) = pinger.ping(PingSequence(seq as u16), &[]).await {
            stats.received += 1;
            stats.rtts_ms.push(rtt.as_secs_f64() * 1000.0);
        }
    }

    stats
}

/// 95th-percentile RTT via a ceiling index into the sorted sample,
/// clamped to the sample bounds.
pub(crate) fn calculate_p95(rtts_ms: &[f64]) -> f64 {
    if rtts_ms.is_empty() {
        return 0.0;
    }

    let mut sorted = rtts_ms.to_vec();
    sorted.sort_by(f64::total_cmp);

    let mut idx = (sorted.len() as f64 * 0.95).ceil() as usize;
    if idx >= sorted.len() {
        idx = sorted.len() - 1;
    }

    sorted[idx]
}

/// RFC 3550 interarrival jitter: an EWMA with gain 1/16 over absolute
/// consecutive-sample differences. Defined only for two or more
/// samples; otherwise 0.
pub(crate) fn calculate_jitter(rtts_ms: &[f64]) -> f64 {
    if rtts_ms.len() < 2 {
        return 0.0;
    }

    let mut jitter = 0.0;
    for pair in rtts_ms.windows(2) {
        let diff = (pair[1] - pair[0]).abs();
        jitter += (diff - jitter) / 16.0;
    }

    jitter
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_p95_empty_sample() {
        assert_eq!(calculate_p95(&[]), 0.0);
    }

    #[test]
    fn test_p95_single_sample() {
        assert_eq!(calculate_p95(&[42.0]), 42.0);
    }

    #[test]
    fn test_p95_picks_upper_tail() {
        let rtts: Vec<f64> = (1..=20).map(f64::from).collect();
        // ceil(20 * 0.95) = 19, so the second-to-last sorted sample.
        assert_eq!(calculate_p95(&rtts), 20.0);

        let rtts: Vec<f64> = (1..=10).map(f64::from).collect();
        // ceil(10 * 0.95) = 10, clamped to the last index.
        assert_eq!(calculate_p95(&rtts), 10.0);
    }

    #[test]
    fn test_p95_unsorted_input() {
        assert_eq!(calculate_p95(&[30.0, 10.0, 20.0]), 30.0);
    }

    #[test]
    fn test_p95_non_decreasing_in_max() {
        let low = calculate_p95(&[1.0, 2.0, 3.0]);
        let high = calculate_p95(&[1.0, 2.0, 100.0]);
        assert!(high >= low);
    }

    #[test]
    fn test_jitter_short_samples() {
        assert_eq!(calculate_jitter(&[]), 0.0);
        assert_eq!(calculate_jitter(&[5.0]), 0.0);
    }

    #[test]
    fn test_jitter_constant_rtts() {
        assert_eq!(calculate_jitter(&[10.0, 10.0, 10.0]), 0.0);
    }

    #[test]
    fn test_jitter_known_value() {
        // Single 10ms step: J = 0 + (10 - 0) / 16.
        let j = calculate_jitter(&[10.0, 20.0]);
        assert!((j - 0.625).abs() < 1e-9);
    }

    #[test]
    fn test_jitter_never_negative() {
        let j = calculate_jitter(&[50.0, 10.0, 45.0, 5.0]);
        assert!(j >= 0.0);
    }

    #[test]
    fn test_packet_loss_percentage() {
        let stats = PingStats {
            sent: 10,
            received: 7,
            rtts_ms: vec![],
        };
        assert!((stats.packet_loss() - 30.0).abs() < 1e-9);

        let none_sent = PingStats {
            sent: 0,
            received: 0,
            rtts_ms: vec![],
        };
        assert_eq!(none_sent.packet_loss(), 0.0);
    }

    #[test]
    fn test_avg_rtt() {
        let stats = PingStats {
            sent: 3,
            received: 3,
            rtts_ms: vec![10.0, 20.0, 30.0],
        };
        assert!((stats.avg_ms() - 20.0).abs() < 1e-9);
    }
}
