//! cachemgrd - Cache Orchestrator
//!
//! Command line entry point: one operation per invocation.

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use cachemgr_common::{EnableRequest, PurgeMode, TopologyKind};
use cachemgrd::{CacheMgr, CacheMgrConfig, HostRegistry, JsonStateStore, DEFAULT_CONFIG_PATH};

/// Varnish cache orchestrator for nginx-hosted sites
#[derive(Parser, Debug)]
#[command(name = "cachemgrd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error), overridden by RUST_LOG
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Enable caching for a site
    Enable(EnableArgs),
    /// Disable caching for a site
    Disable {
        /// Site identifier
        site: String,
    },
    /// Invalidate cached content of a site
    Purge(PurgeArgs),
    /// Print the recorded state of a site
    Status {
        /// Site identifier
        site: String,
    },
    /// Validate the configuration file and exit
    CheckConfig,
}

#[derive(Args, Debug)]
struct EnableArgs {
    /// Site identifier
    site: String,

    /// Default object TTL in seconds
    #[arg(long, default_value = "3600")]
    ttl: u32,

    /// Daemon memory budget, e.g. 256M
    #[arg(long, default_value = "256M")]
    memory: String,

    /// Port topology (shared_port, dedicated_port)
    #[arg(long, default_value = "shared_port")]
    topology: TopologyKind,

    /// Internal origin port, dedicated_port only
    #[arg(long)]
    backend_port: Option<u16>,
}

#[derive(Args, Debug)]
struct PurgeArgs {
    /// Site identifier
    site: String,

    /// Purge everything cached for the site
    #[arg(long, group = "scope")]
    all: bool,

    /// Purge paths matching a regular expression
    #[arg(long, group = "scope")]
    pattern: Option<String>,

    /// Purge a single path
    #[arg(long, group = "scope")]
    path: Option<String>,
}

impl PurgeArgs {
    fn mode(&self) -> anyhow::Result<PurgeMode> {
        match (self.all, &self.pattern, &self.path) {
            (true, None, None) => Ok(PurgeMode::All),
            (false, Some(pattern), None) => Ok(PurgeMode::Pattern(pattern.clone())),
            (false, None, Some(path)) => Ok(PurgeMode::Single(path.clone())),
            _ => bail!("exactly one of --all, --pattern or --path is required"),
        }
    }
}

/// Initializes tracing/logging subsystem
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

/// Cancels `token` on SIGINT so a running workflow rolls back.
fn cancel_on_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping before the next step");
            token.cancel();
        }
    });
}

fn build_manager(config: CacheMgrConfig) -> anyhow::Result<CacheMgr> {
    let hosts = HostRegistry::from_config(&config.hosts).context("building host channels")?;
    let store = Arc::new(JsonStateStore::new(config.state.dir.clone()));
    CacheMgr::new(config, hosts, store).context("loading site catalog")
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = CacheMgrConfig::load_or_default(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    config.validate().context("invalid configuration")?;

    if let Command::CheckConfig = cli.command {
        info!(
            hosts = config.hosts.len(),
            sites = config.sites.len(),
            "Configuration is valid"
        );
        return Ok(());
    }

    let mgr = build_manager(config)?;
    let cancel = CancellationToken::new();
    cancel_on_interrupt(cancel.clone());

    match cli.command {
        Command::Enable(args) => {
            let request = EnableRequest {
                ttl_seconds: args.ttl,
                memory_budget: args.memory,
                topology: args.topology,
                backend_port: args.backend_port,
            };
            let report = mgr.enable_with_cancel(&args.site, &request, cancel).await?;
            println!(
                "enabled {} (applied: {}, already in place: {})",
                report.site,
                report.workflow.applied.join(", "),
                report.workflow.satisfied.join(", ")
            );
        }
        Command::Disable { site } => {
            let report = mgr.disable_with_cancel(&site, cancel).await?;
            println!("disabled {} (daemon: {:?})", report.site, report.daemon);
        }
        Command::Purge(args) => {
            let outcome = mgr.purge(&args.site, &args.mode()?).await?;
            println!(
                "purged {} ({} via {}{})",
                args.site,
                outcome.mode,
                outcome.mechanism,
                if outcome.fallback_used { ", fallback" } else { "" }
            );
        }
        Command::Status { site } => {
            let status = mgr.status(&site).await?;
            println!("{}", serde_json::to_string_pretty(&status.state)?);
        }
        Command::CheckConfig => {}
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
