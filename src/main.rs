//! conduit: a protocol-agnostic proxy built from ordered stream filter chains
//!
//! Each listener decodes requests with its codec, runs them through the
//! configured decoder and encoder filters, and answers from routes.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::{Config, ReloadManager};
use proxy::{wait_for_connections_drain, DrainManager, FilterConfig};
use router::{ClusterManager, RouterStats};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::LocalSet;
use tracing::{error, info, warn};

mod server;
mod telemetry;

use server::Server;

#[derive(Parser)]
#[command(name = "conduit")]
#[command(author, version, about = "A protocol-agnostic proxy built from stream filter chains")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, default_value = "conduit.toml")]
    config: PathBuf,

    /// Log level, overrides `global.log_level`
    #[arg(short, long)]
    log_level: Option<String>,

    /// Watch config file and auto-reload on changes
    #[arg(short, long)]
    watch: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the proxy
    Run {
        #[arg(short, long, default_value = "conduit.toml")]
        config: PathBuf,
        /// Watch config file and auto-reload on changes
        #[arg(short, long)]
        watch: bool,
    },
    /// Validate configuration
    Validate {
        #[arg(short, long, default_value = "conduit.toml")]
        config: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let (config_path, watch, validate_only) = match cli.command {
        Some(Commands::Run { config, watch }) => (config, watch, false),
        Some(Commands::Validate { config }) => (config, false, true),
        None => (cli.config, cli.watch, false),
    };

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    let level = telemetry::parse_level(
        cli.log_level
            .as_deref()
            .unwrap_or(&config.global.log_level),
    );

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    let _guard = rt.enter();

    let telemetry_config = if validate_only {
        Default::default()
    } else {
        config.telemetry.clone()
    };
    let provider = telemetry::init_tracing(level, &telemetry_config)?;

    let result = if validate_only {
        validate_config(&config)
    } else {
        run_server(&rt, config, config_path, watch)
    };

    telemetry::shutdown_telemetry(provider);
    result
}

fn validate_config(config: &Config) -> Result<()> {
    let registry = server::filter_registry(&config.clusters, Arc::new(RouterStats::new()))?;
    for listener in &config.listeners {
        let listener = server::with_router(listener);
        FilterConfig::from_config_with(&listener, &registry)
            .with_context(|| format!("Invalid listener '{}'", listener.name))?;
        println!(
            "listener {} on {}: codec {}, {} filters, {} routes",
            listener.name,
            listener.address,
            listener.codec,
            listener.filters.len(),
            listener.routes.len()
        );
    }

    let clusters = ClusterManager::from_config(&config.clusters)?;
    for cluster in &config.clusters {
        println!(
            "cluster {}: {} hosts, {:?} transport, {:?} protocol",
            cluster.name,
            cluster.hosts.len(),
            cluster.transport,
            cluster.protocol
        );
    }

    println!(
        "Configuration is valid ({} listeners, {} clusters)",
        config.listeners.len(),
        clusters.len()
    );
    Ok(())
}

fn run_server(
    rt: &tokio::runtime::Runtime,
    config: Config,
    config_path: PathBuf,
    watch: bool,
) -> Result<()> {
    info!(config = ?config_path, watch, "Starting conduit");

    let clusters = ClusterManager::from_config(&config.clusters)?;
    info!(
        listeners = config.listeners.len(),
        clusters = clusters.len(),
        "Configuration loaded"
    );

    let drain = Arc::new(DrainManager::new());
    let server = Arc::new(Server::from_config(&config, drain.clone())?);

    let grace_period = Duration::from_secs(config.global.grace_period);
    let stats = server.stats();
    ctrlc::set_handler(move || {
        info!("Received shutdown signal, draining connections");
        drain.start_draining();

        info!(grace_period_secs = grace_period.as_secs(), "Waiting for connections to drain");
        if wait_for_connections_drain(stats.iter().map(|s| &**s), grace_period) {
            info!("All connections drained");
        } else {
            warn!("Grace period expired, closing remaining connections");
        }

        info!("Shutdown complete");
        std::process::exit(0);
    })
    .context("Failed to install signal handler")?;

    if watch {
        let manager = ReloadManager::new(&config_path, config.clone())
            .with_context(|| format!("Failed to watch {:?}", config_path))?;
        let server = server.clone();
        let _reload = manager.start(move |update| server.apply(&update));
        info!("Config file watcher enabled");
    }

    let local = LocalSet::new();
    if let Err(e) = local.block_on(rt, server.run()) {
        error!(error = %e, "Server stopped");
        return Err(e);
    }
    Ok(())
}
