//! mqttlink - keep an MQTT session alive, optionally through an SSH tunnel

use clap::{Parser, Subcommand};
use mqttlink::config::{ConfigError, LinkConfig};
use mqttlink::link::{MessageHandler, MqttLink};
use mqttlink::{LinkResult, Message};
use mqttlink::observability::init_default_logging;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

/// Self-healing MQTT link
#[derive(Parser)]
#[command(name = "mqttlink")]
#[command(about = "Keep an MQTT session alive, optionally through an SSH tunnel")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "MQTTLINK_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the link and log every received message
    Run,
    /// Validate configuration
    Config {
        /// Show the parsed configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!("Starting mqttlink v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_link(config).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(config_path: &Option<PathBuf>) -> LinkResult<LinkConfig> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(LinkConfig::load_from_file(path)?);
    }

    for candidate in ["mqttlink.toml", "config/mqttlink.toml"] {
        let path = PathBuf::from(candidate);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(LinkConfig::load_from_file(&path)?);
        }
    }

    Err(ConfigError::InvalidConfig(
        "No configuration file found. Provide one with -c/--config or create mqttlink.toml"
            .to_string(),
    )
    .into())
}

async fn run_link(config: LinkConfig) -> Result<(), Box<dyn std::error::Error>> {
    let settings = config.resolve();
    info!(
        host = %settings.host,
        tunnel = settings.uses_tunnel(),
        subscriptions = settings.initial_subscriptions.len(),
        "Link starting"
    );

    let handler: MessageHandler = Arc::new(|message: &Message| {
        info!(
            topic = %message.topic,
            bytes = message.payload.len(),
            retain = message.retain,
            "Message received: {}",
            String::from_utf8_lossy(&message.payload)
        );
    });
    let link = MqttLink::start(settings, Some(handler));

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut states = link.state_receiver();

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down gracefully...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down gracefully...");
                break;
            }
            changed = states.changed() => {
                if changed.is_err() {
                    error!("Connection manager exited unexpectedly");
                    break;
                }
                let state = *states.borrow_and_update();
                info!(%state, tunnel_active = link.tunnel_active(), "Link state changed");
            }
        }
    }

    link.shutdown().await;
    info!("Application shutdown complete");
    Ok(())
}

fn handle_config_command(config: &LinkConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(config)?);
    }
    let settings = config.resolve();
    println!(
        "Configuration valid: broker {}:{}, {}",
        settings.host,
        settings.broker_port,
        if settings.uses_tunnel() {
            "via SSH tunnel"
        } else {
            "direct connection"
        }
    );
    Ok(())
}
