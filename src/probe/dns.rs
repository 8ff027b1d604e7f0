use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RecordType};
use tokio::net::UdpSocket;
use tokio::task::JoinSet;
use tracing::warn;

use super::{resolve_target, Measurement, ProbeType, Prober};

/// Per-exchange timeout.
const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

const RESOLV_CONF: &str = "/etc/resolv.conf";

/// Used when /etc/resolv.conf is unreadable or names no usable server
/// (minimal containers); latency is still worth measuring against a
/// well-known public resolver.
const FALLBACK_RESOLVER: IpAddr = IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1));

/// DNS resolution-time probe against a set of resolvers.
///
/// The answer content is ignored; only the round trip is measured.
pub struct DnsProbe {
    resolvers: Vec<String>,
    query_domain: String,
}

impl DnsProbe {
    /// Creates a DNS probe. A resolver spec is an IP, a hostname, or
    /// the literal `system` for the OS default resolver.
    pub fn new(resolvers: Vec<String>, query_domain: impl Into<String>) -> Self {
        Self {
            resolvers,
            query_domain: query_domain.into(),
        }
    }

    async fn query_resolver(spec: &str, query_domain: &str) -> Result<Measurement> {
        let (target, ip) = if spec == "system" {
            let ip = system_resolver(Path::new(RESOLV_CONF));
            (format!("system-{ip}"), ip)
        } else {
            (spec.to_string(), resolve_target(spec).await?)
        };

        let wire = build_query(query_domain)?;
        let server = SocketAddr::new(ip, 53);

        let start = Instant::now();
        exchange(&wire, server)
            .await
            .with_context(|| format!("DNS query to {server} failed"))?;
        let elapsed = start.elapsed();

        let mut m = Measurement::new(ProbeType::Dns, target);
        m.dns_time = Some(elapsed.as_millis() as f64);

        Ok(m)
    }
}

impl Prober for DnsProbe {
    fn probe_type(&self) -> ProbeType {
        ProbeType::Dns
    }

    async fn run(&self) -> Result<Vec<Measurement>> {
        let mut tasks = JoinSet::new();

        for resolver in &self.resolvers {
            let resolver = resolver.clone();
            let domain = self.query_domain.clone();
            tasks.spawn(async move {
                let result = Self::query_resolver(&resolver, &domain).await;
                (resolver, result)
            });
        }

        let mut measurements = Vec::new();
        let mut failures = Vec::new();

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(m))) => measurements.push(m),
                Ok((resolver, Err(e))) => {
                    warn!(resolver = %resolver, error = %e, "DNS resolver failed");
                    failures.push(format!("{resolver}: {e:#}"));
                }
                Err(e) => failures.push(format!("dns task join: {e}")),
            }
        }

        if measurements.is_empty() && !failures.is_empty() {
            anyhow::bail!("all resolvers failed: {}", failures.join("; "));
        }

        Ok(measurements)
    }
}

/// Builds a recursive A query for the domain, wire-encoded.
fn build_query(domain: &str) -> Result<Vec<u8>> {
    let fqdn = if domain.ends_with('.') {
        domain.to_string()
    } else {
        format!("{domain}.")
    };

    let name =
        Name::from_ascii(&fqdn).with_context(|| format!("invalid query domain {domain:?}"))?;

    let mut msg = Message::new();
    msg.set_id(rand::random());
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(true);
    msg.add_query(Query::query(name, RecordType::A));

    msg.to_vec().context("encoding DNS query")
}

/// One UDP request/response exchange. The response is parsed only to
/// confirm the server answered with a well-formed message.
async fn exchange(wire: &[u8], server: SocketAddr) -> Result<()> {
    let bind_addr: SocketAddr = if server.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };

    let socket = UdpSocket::bind(bind_addr)
        .await
        .context("binding UDP socket")?;

    socket
        .send_to(wire, server)
        .await
        .context("sending query")?;

    let mut buf = [0u8; 512];
    let (n, _) = tokio::time::timeout(QUERY_TIMEOUT, socket.recv_from(&mut buf))
        .await
        .context("query timed out")?
        .context("receiving response")?;

    Message::from_vec(&buf[..n]).context("parsing response")?;

    Ok(())
}

/// Reads the OS default resolver from a resolv.conf-format file,
/// falling back to a public resolver when the file is unreadable or
/// holds no parseable nameserver.
fn system_resolver(path: &Path) -> IpAddr {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return FALLBACK_RESOLVER;
    };

    first_nameserver(&contents).unwrap_or(FALLBACK_RESOLVER)
}

fn first_nameserver(contents: &str) -> Option<IpAddr> {
    for line in contents.lines() {
        let line = line.trim();
        let Some(rest) = line.strip_prefix("nameserver") else {
            continue;
        };
        if let Some(value) = rest.split_whitespace().next() {
            return value.parse().ok();
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_first_nameserver_basic() {
        let conf = "# generated by resolvconf\nnameserver 9.9.9.9\nnameserver 1.0.0.1\n";
        assert_eq!(
            first_nameserver(conf),
            Some(IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9)))
        );
    }

    #[test]
    fn test_first_nameserver_skips_other_directives() {
        let conf = "search example.internal\noptions ndots:2\nnameserver 10.0.0.53\n";
        assert_eq!(
            first_nameserver(conf),
            Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 53)))
        );
    }

    #[test]
    fn test_first_nameserver_none_present() {
        assert_eq!(first_nameserver("search example.internal\n"), None);
        assert_eq!(first_nameserver(""), None);
    }

    #[test]
    fn test_system_resolver_unreadable_file_falls_back() {
        let ip = system_resolver(Path::new("/nonexistent/resolv.conf"));
        assert_eq!(ip, FALLBACK_RESOLVER);
        // The target label a `system` resolver run would carry.
        assert_eq!(format!("system-{ip}"), "system-1.1.1.1");
    }

    #[test]
    fn test_system_resolver_reads_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "nameserver 192.168.1.1").expect("write");

        let ip = system_resolver(file.path());
        assert_eq!(ip, IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)));
    }

    #[test]
    fn test_build_query_sets_recursion_and_question() {
        let wire = build_query("example.com").expect("build query");
        let msg = Message::from_vec(&wire).expect("decode");

        assert!(msg.recursion_desired());
        assert_eq!(msg.queries().len(), 1);
        assert_eq!(msg.queries()[0].query_type(), RecordType::A);
        assert_eq!(msg.queries()[0].name().to_ascii(), "example.com.");
    }

    #[test]
    fn test_build_query_rejects_overlong_label() {
        // Single labels are capped at 63 octets.
        let label = "a".repeat(70);
        assert!(build_query(&format!("{label}.com")).is_err());
    }
}
