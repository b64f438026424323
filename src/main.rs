//! mgmt-broker entry point

use clap::{Parser, Subcommand};
use mgmt_broker::config::BrokerConfig;
use mgmt_broker::observability::init_default_logging;
use mgmt_broker::plugins::default_connectors;
use mgmt_broker::BrokerServer;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

/// Client-side broker for a device management server
#[derive(Parser)]
#[command(name = "mgmt-broker")]
#[command(about = "Queue plugin messages and exchange them with the management server")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "MGMT_BROKER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the broker until interrupted
    Run,
    /// Register this computer with the server, then exit
    Register,
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!("Starting mgmt-broker v{}", env!("CARGO_PKG_VERSION"));

    let (config, path) = match load_configuration(cli.config) {
        Ok(loaded) => loaded,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_broker(config, path).await,
        Commands::Register => register(config, path).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Shutdown complete");
}

fn load_configuration(
    config_path: Option<PathBuf>,
) -> Result<(BrokerConfig, PathBuf), Box<dyn std::error::Error>> {
    let path = match config_path {
        Some(path) => path,
        None => ["mgmt-broker.toml", "config/mgmt-broker.toml", "/etc/mgmt-broker.toml"]
            .into_iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
            .ok_or("No configuration file found. Provide one with -c/--config or create mgmt-broker.toml")?,
    };

    info!("Loading configuration from: {}", path.display());
    let config = BrokerConfig::load_from_file(&path)?;
    Ok((config, path))
}

/// Open the broker and connect every configured plugin
async fn start_broker(
    config: BrokerConfig,
    path: PathBuf,
) -> Result<Arc<BrokerServer>, Box<dyn std::error::Error>> {
    let connectors = config.client.connectors.clone();
    let broker = BrokerServer::open(config, Some(path))?;
    broker.set_connectors_registry(default_connectors());

    for name in &connectors {
        if let Err(e) = broker.register_client(name).await {
            warn!(client = %name, error = %e, "Plugin not started");
        }
    }
    Ok(broker)
}

async fn run_broker(config: BrokerConfig, path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    info!(computer = %config.client.computer_title, "Broker starting");

    let broker = start_broker(config, path).await?;
    broker.start_exchanger();

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    info!("Broker is running");

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
        }
        _ = broker.wait_stopped() => {
            info!("Broker stopped on its own");
        }
    }

    broker.exit().await?;
    Ok(())
}

async fn register(config: BrokerConfig, path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let broker = start_broker(config, path).await?;
    broker.start_exchanger();

    let outcome = tokio::select! {
        outcome = broker.register() => outcome,
        _ = signal::ctrl_c() => {
            info!("Registration interrupted");
            Ok(())
        }
    };

    broker.exit().await?;
    outcome?;
    info!("Computer registered");
    Ok(())
}

fn handle_config_command(config: &BrokerConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}
