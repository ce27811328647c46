//! MQTT bridge - main entry point

use clap::{Parser, Subcommand};
use mqtt_bridge::config::{BridgeConfig, ConfigError, LoggerConfig};
use mqtt_bridge::observability::init_from_config;
use mqtt_bridge::{AdapterStore, BridgeResult, CronCoreScheduler, Registry, Scheduler};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATHS: &[&str] = &["config.toml", "config/config.toml"];

/// Bridge serial, ethernet and HTTP sources to MQTT
#[derive(Parser)]
#[command(name = "mqtt-bridge")]
#[command(about = "Bridge serial, ethernet and HTTP sources to an MQTT broker")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "BRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start every enabled adapter and run until interrupted
    Run,
    /// Load and validate the configuration
    Config {
        /// Print the normalized configuration
        #[arg(long)]
        show: bool,
    },
    /// Print a sample configuration
    GenerateConfig,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Commands::GenerateConfig = cli.command {
        match BridgeConfig::sample().to_toml_string() {
            Ok(sample) => print!("{sample}"),
            Err(e) => {
                eprintln!("Failed to render sample configuration: {e}");
                process::exit(1);
            }
        }
        return;
    }

    let config = match load_configuration(cli.config.as_deref()) {
        Ok((path, config)) => {
            init_from_config(&config.logger, cli.verbose);
            info!(path = %path.display(), "Loaded configuration");
            config
        }
        Err(e) => {
            init_from_config(&LoggerConfig::default(), cli.verbose);
            error!(error = %e, "Failed to load configuration");
            process::exit(1);
        }
    };

    info!("Starting mqtt-bridge v{}", env!("CARGO_PKG_VERSION"));

    let result = match cli.command {
        Commands::Run => run_bridge(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
        Commands::GenerateConfig => Ok(()),
    };

    if let Err(e) = result {
        error!(error = %e, "Command failed");
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(path: Option<&Path>) -> Result<(PathBuf, BridgeConfig), ConfigError> {
    if let Some(path) = path {
        return Ok((path.to_path_buf(), BridgeConfig::load_from_file(path)?));
    }

    for candidate in DEFAULT_CONFIG_PATHS {
        let path = PathBuf::from(candidate);
        if path.exists() {
            let config = BridgeConfig::load_from_file(&path)?;
            return Ok((path, config));
        }
    }

    Err(ConfigError::InvalidConfig(format!(
        "no configuration file found; pass one with -c/--config or create one of {}",
        DEFAULT_CONFIG_PATHS.join(", ")
    )))
}

async fn run_bridge(config: BridgeConfig) -> BridgeResult<()> {
    let core = CronCoreScheduler::start().await?;
    let scheduler = Scheduler::new(Arc::new(core));
    let registry = Arc::new(Registry::with_builtins()?);
    info!(
        devices = ?registry.device_kinds(),
        providers = ?registry.providers(),
        "Plugin registry ready"
    );

    let store = AdapterStore::new(registry, scheduler.clone());
    let started = store.start(&config.adapters).await;
    if started == 0 {
        warn!("No adapter is running; check that at least one adapter is enabled");
    }

    let shutdown = wait_for_shutdown_signal().await;

    info!("Shutdown initiated");
    store.close_all().await;
    if let Err(e) = scheduler.close().await {
        error!(error = %e, "Failed to stop scheduler");
    }
    shutdown
}

/// Block until SIGINT or SIGTERM
async fn wait_for_shutdown_signal() -> BridgeResult<()> {
    #[cfg(unix)]
    {
        use signal::unix::{signal, SignalKind};
        let registered = signal(SignalKind::interrupt()).and_then(|sigint| {
            signal(SignalKind::terminate()).map(|sigterm| (sigint, sigterm))
        });
        match registered {
            Ok((mut sigint, mut sigterm)) => {
                tokio::select! {
                    _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
                }
                return Ok(());
            }
            Err(e) => warn!(error = %e, "Failed to register unix signal handlers, using ctrl-c"),
        }
    }

    signal::ctrl_c().await?;
    info!("Received ctrl-c, shutting down gracefully...");
    Ok(())
}

fn handle_config_command(config: &BridgeConfig, show: bool) -> BridgeResult<()> {
    if show {
        println!("{}", config.to_toml_string()?);
    }
    let enabled = config.adapters.iter().filter(|a| a.enabled).count();
    info!(
        adapters = config.adapters.len(),
        enabled, "Configuration validation complete"
    );
    Ok(())
}
