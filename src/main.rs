use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use netpulse_probe::agent::Agent;
use netpulse_probe::config::Config;

/// Continuous Internet-quality monitoring probe agent.
#[derive(Parser)]
#[command(name = "netpulse-probe", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a template configuration file and exit.
    Init,

    /// Start the probe agent.
    Run {
        /// Address for the health check HTTP server.
        #[arg(long, default_value = ":9100")]
        health_addr: String,
    },

    /// Print version information and exit.
    Version,
}

/// Build-time version info.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} ({}/{})",
            RELEASE,
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() {
    if let Err(e) = real_main() {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn real_main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version before anything else.
    if let Command::Version = cli.command {
        println!("netpulse-probe {}", version::full());
        return Ok(());
    }

    let config_path = cli.config.unwrap_or_else(Config::default_path);

    if let Command::Init = cli.command {
        return init_config(&config_path);
    }

    let Command::Run { health_addr } = cli.command else {
        unreachable!("all other subcommands handled above");
    };

    // Initialize tracing.
    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    let cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    tracing::info!(
        version = version::RELEASE,
        config_path = %config_path.display(),
        probe_name = %cfg.probe.name,
        ping_targets = ?cfg.targets.ping,
        dns_resolvers = ?cfg.targets.dns,
        "starting netpulse probe",
    );

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg, &health_addr).await })
}

fn init_config(path: &std::path::Path) -> Result<()> {
    if path.exists() {
        bail!("config file already exists at {}", path.display());
    }

    Config::write_template(path)
        .with_context(|| format!("writing config template to {}", path.display()))?;

    println!("Config template written to {}", path.display());
    println!("Edit the file and set your server URL and API key, then run: netpulse-probe run");

    Ok(())
}

async fn run(cfg: Config, health_addr: &str) -> Result<()> {
    // Set up signal handling.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    // Start the agent.
    let mut agent = Agent::new(cfg, health_addr)?;
    agent.start().await?;

    // Wait for shutdown signal.
    let _ = shutdown_rx.await;

    // Graceful shutdown.
    agent.stop().await?;

    tracing::info!("netpulse probe stopped");

    Ok(())
}
