use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level configuration for the probe agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Dashboard ingest server connection.
    #[serde(default)]
    pub server: ServerConfig,

    /// Per-probe execution cadences.
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// What each probe measures against.
    #[serde(default)]
    pub targets: TargetsConfig,

    /// Informational labels for this probe instance.
    #[serde(default)]
    pub probe: ProbeConfig,

    /// Local measurement buffer settings.
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Dashboard ingest server connection.
///
/// With an empty `url` or `api_key` the agent runs in local-only mode:
/// measurements accumulate in the buffer and nothing is pushed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Base URL of the ingest server.
    #[serde(default)]
    pub url: String,

    /// Auth token sent as X-API-Key.
    #[serde(default)]
    pub api_key: String,

    /// Opaque identifier included in every ingest payload.
    #[serde(default)]
    pub probe_id: String,
}

/// Per-probe execution cadences.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Ping cadence. Default: 30s, minimum 5s.
    #[serde(default = "default_ping_interval", with = "humantime_serde")]
    pub ping_interval: Duration,

    /// DNS cadence. Default: 60s, minimum 10s.
    #[serde(default = "default_dns_interval", with = "humantime_serde")]
    pub dns_interval: Duration,

    /// Bufferbloat cadence. Default: 5m, minimum 60s.
    #[serde(default = "default_bufferbloat_interval", with = "humantime_serde")]
    pub bufferbloat_interval: Duration,
}

/// Probe targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetsConfig {
    /// Hosts/IPs to ping.
    #[serde(default = "default_ping_targets")]
    pub ping: Vec<String>,

    /// DNS resolvers: IPs, hostnames, or the literal `system`.
    #[serde(default = "default_dns_resolvers")]
    pub dns: Vec<String>,

    /// Large file downloaded to saturate the link during the
    /// bufferbloat loaded phase.
    #[serde(default = "default_download_url")]
    pub bufferbloat_download_url: String,
}

/// Informational probe labels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Free-form probe name.
    #[serde(default = "default_probe_name")]
    pub name: String,

    /// Free-form location label.
    #[serde(default)]
    pub location: String,
}

/// Local measurement buffer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Synced records older than this many days are purged.
    #[serde(default = "default_retention_days")]
    pub local_retention_days: u32,

    /// SQLite database path; the parent directory is created if missing.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

// --- Default value functions ---

fn default_ping_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_dns_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_bufferbloat_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_ping_targets() -> Vec<String> {
    vec![
        "1.1.1.1".to_string(),
        "8.8.8.8".to_string(),
        "9.9.9.9".to_string(),
    ]
}

fn default_dns_resolvers() -> Vec<String> {
    vec![
        "1.1.1.1".to_string(),
        "8.8.8.8".to_string(),
        "system".to_string(),
    ]
}

fn default_download_url() -> String {
    "https://speed.cloudflare.com/__down?bytes=5000000".to_string()
}

fn default_probe_name() -> String {
    "default".to_string()
}

fn default_retention_days() -> u32 {
    30
}

fn default_db_path() -> PathBuf {
    netpulse_dir().join("measurements.db")
}

/// Per-user state directory (`~/.netpulse`).
fn netpulse_dir() -> PathBuf {
    directories::UserDirs::new()
        .map(|dirs| dirs.home_dir().join(".netpulse"))
        .unwrap_or_else(|| PathBuf::from(".netpulse"))
}

// --- Default trait impls ---

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            ping_interval: default_ping_interval(),
            dns_interval: default_dns_interval(),
            bufferbloat_interval: default_bufferbloat_interval(),
        }
    }
}

impl Default for TargetsConfig {
    fn default() -> Self {
        Self {
            ping: default_ping_targets(),
            dns: default_dns_resolvers(),
            bufferbloat_download_url: default_download_url(),
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            name: default_probe_name(),
            location: String::new(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            local_retention_days: default_retention_days(),
            db_path: default_db_path(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file. Missing keys take their
    /// defaults; unknown keys are ignored.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and sane cadences.
    pub fn validate(&self) -> Result<()> {
        if self.targets.ping.is_empty() {
            bail!("at least one ping target is required");
        }

        if self.targets.dns.is_empty() {
            bail!("at least one DNS resolver is required");
        }

        if self.schedule.ping_interval < Duration::from_secs(5) {
            bail!("schedule.ping_interval must be at least 5s");
        }

        if self.schedule.dns_interval < Duration::from_secs(10) {
            bail!("schedule.dns_interval must be at least 10s");
        }

        if self.schedule.bufferbloat_interval < Duration::from_secs(60) {
            bail!("schedule.bufferbloat_interval must be at least 60s");
        }

        if self.targets.bufferbloat_download_url.is_empty() {
            bail!("targets.bufferbloat_download_url is required");
        }

        Ok(())
    }

    /// Whether the agent should push to a remote server, or run
    /// local-only.
    pub fn push_enabled(&self) -> bool {
        !self.server.url.is_empty() && !self.server.api_key.is_empty()
    }

    /// Default config file path (`~/.netpulse/config.yaml`).
    pub fn default_path() -> PathBuf {
        netpulse_dir().join("config.yaml")
    }

    /// Write a template config file with placeholder credentials to the
    /// given path, creating the parent directory if needed.
    pub fn write_template(path: &Path) -> Result<()> {
        let mut cfg = Config::default();
        cfg.server.url = "http://localhost:3000".to_string();
        cfg.server.api_key = "np_probe_YOUR_API_KEY_HERE".to_string();
        cfg.server.probe_id = "YOUR_PROBE_UUID_HERE".to_string();
        cfg.probe.name = "my-probe".to_string();
        cfg.probe.location = "Home Office".to_string();

        let body = serde_yaml::to_string(&cfg).context("serializing config template")?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating config directory {}", parent.display()))?;
        }

        let header = "# NetPulse probe configuration\n\
                      # Set server.url and server.api_key, then run: netpulse-probe run\n\n";

        std::fs::write(path, format!("{header}{body}"))
            .with_context(|| format!("writing config template {}", path.display()))
    }
}
