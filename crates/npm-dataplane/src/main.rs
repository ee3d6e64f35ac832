//! NPM dataplane entry point.
//!
//! Builds the dataplane from a JSON configuration file or from command-line
//! flags, starts the background tasks and runs until interrupted. Without a
//! host backend the in-memory set and policy managers are used, which makes
//! the binary useful for dry runs of a configuration.

use clap::{Parser, ValueEnum};
use log::{debug, error, info};
use npm_common::BatchConfig;
use npm_dataplane::{
    DataPlane, DataPlaneConfig, DataPlaneMetrics, InMemoryIpSetManager, InMemoryPolicyManager,
    StaticEndpointProvider,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Platform {
    Linux,
    Windows,
}

/// Node-local network policy dataplane
#[derive(Parser, Debug)]
#[command(name = "npm-dataplane")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON configuration file; overrides the dataplane flags below
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Name of the local node
    #[arg(short = 'n', long, default_value = "localhost")]
    node_name: String,

    /// Packet filtering backend
    #[arg(short = 'p', long, value_enum, default_value = "linux")]
    platform: Platform,

    /// Windows container network name
    #[arg(long, default_value = "azure")]
    network_name: String,

    /// Deferred operations per batch (rule commits on Linux, set applies on
    /// Windows); 0 disables batching
    #[arg(short = 'b', long, default_value = "0")]
    max_batches: usize,

    /// Background batch flush interval in milliseconds
    #[arg(long, default_value = "500")]
    batch_interval: u64,

    /// Reconciliation interval in milliseconds
    #[arg(long, default_value = "300000")]
    reconcile_interval: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn dataplane_config(&self) -> Result<DataPlaneConfig, npm_dataplane::ConfigError> {
        if let Some(path) = &self.config {
            return DataPlaneConfig::from_json_file(path);
        }

        let batching = (self.max_batches > 0).then(|| {
            BatchConfig::new(self.max_batches, Duration::from_millis(self.batch_interval))
        });
        let config = match self.platform {
            Platform::Linux => DataPlaneConfig::linux(&self.node_name),
            Platform::Windows => DataPlaneConfig::windows(&self.node_name, &self.network_name),
        };
        let config = match batching {
            Some(batching) if self.platform == Platform::Linux => {
                config.with_rule_batching(batching)
            }
            Some(batching) => config.with_apply_batching(batching),
            None => config,
        };
        Ok(config.with_reconcile_interval(Duration::from_millis(self.reconcile_interval)))
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .init();

    let config = match args.dataplane_config() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    info!("====================================================================");
    info!("Starting NPM dataplane");
    info!("====================================================================");
    info!("Node: {}", config.node_name);
    info!("Platform: {}", config.platform.name());
    info!("Reconcile interval: {:?}", config.reconcile_interval());
    if let Some(batching) = config.platform.rule_batching() {
        info!(
            "Rule batching: {} per batch, every {:?}",
            batching.max_batches,
            batching.interval()
        );
    }
    if let Some(batching) = config.platform.apply_batching() {
        info!(
            "Apply batching: {} per batch, every {:?}",
            batching.max_batches,
            batching.interval()
        );
    }

    let metrics = match DataPlaneMetrics::new() {
        Ok(metrics) => Arc::new(metrics),
        Err(e) => {
            error!("Failed to register metrics: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let batch_commits = config.platform.rule_batching().is_some();
    let dataplane = match DataPlane::new(
        config,
        Arc::new(InMemoryIpSetManager::new()),
        Arc::new(InMemoryPolicyManager::new(batch_commits)),
        Arc::new(StaticEndpointProvider::new()),
        Arc::clone(&metrics),
    )
    .await
    {
        Ok(dataplane) => Arc::new(dataplane),
        Err(e) => {
            error!("Failed to start dataplane: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let shutdown = CancellationToken::new();
    let tasks = dataplane.run_periodic_tasks(shutdown.clone());
    info!("Started background tasks: {:?}", tasks.names());

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }

    info!("Shutting down NPM dataplane...");
    shutdown.cancel();
    tasks.join().await;

    match metrics.gather() {
        Ok(text) => debug!("Final metrics:\n{}", text),
        Err(e) => error!("Failed to gather metrics: {}", e),
    }

    info!("NPM dataplane shutdown complete");
    ExitCode::SUCCESS
}
