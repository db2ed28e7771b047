//! MeshCore Bridge Node - observer radio to MQTT daemon
//!
//! This binary runs a bridge between a MeshCore repeater connected over
//! serial and an MQTT broker:
//! - Configuration from `MCTOMQTT_*` variables (process env over
//!   `.env.local` over `.env`)
//! - Packet events and a retained status heartbeat published to MQTT
//! - Graceful shutdown on SIGINT / SIGTERM

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tracing::{debug, error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use meshcore_bridge::config::{collect_env, ENV_PREFIX};
use meshcore_bridge::BridgeConfig;

#[derive(Parser)]
#[command(name = "meshcore-bridge-node")]
#[command(about = "Bridge a MeshCore observer radio to an MQTT broker")]
#[command(version)]
struct Args {
    /// Enable debug logging (overrides MCTOMQTT_LOG_LEVEL) and publish
    /// firmware DEBUG lines to the debug topic
    #[arg(long, short)]
    debug: bool,

    /// Directory containing .env and .env.local
    #[arg(long, default_value = ".")]
    config_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let vars = collect_env(&args.config_dir)
        .with_context(|| format!("reading configuration from {}", args.config_dir.display()))?;

    // Initialize logging before validation so configuration errors are logged
    let level = if args.debug {
        "debug".to_string()
    } else {
        vars.get(&format!("{}LOG_LEVEL", ENV_PREFIX))
            .map(|level| level.to_lowercase())
            .unwrap_or_else(|| "info".to_string())
    };
    let filter = EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = match BridgeConfig::from_vars(vars) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, code = e.error_code(), "Invalid configuration");
            return Err(e.into());
        }
    };
    config.debug = args.debug;
    debug!(config = %config.redacted_json()?, "Effective configuration");

    info!(
        version = meshcore_bridge::VERSION,
        ports = ?config.serial.ports,
        broker = %format!("{}:{}", config.broker.host, config.broker.port),
        region = %config.observer.region,
        "Starting MeshCore bridge node"
    );

    run(config).await
}

#[cfg(feature = "serial")]
async fn run(config: BridgeConfig) -> anyhow::Result<()> {
    use meshcore_bridge::{MeshcoreBridge, MqttConnector, SerialInterface};

    let interface = SerialInterface::from_config(&config.serial);
    let connector = MqttConnector::new(config.broker.clone());
    let bridge = MeshcoreBridge::new(config, interface, connector);
    let handle = bridge.handle();

    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        handle.shutdown();
    });

    bridge.run().await?;
    Ok(())
}

#[cfg(not(feature = "serial"))]
async fn run(_config: BridgeConfig) -> anyhow::Result<()> {
    anyhow::bail!("built without the `serial` feature; no device interface available")
}

/// Resolves on SIGINT or SIGTERM
#[cfg(feature = "serial")]
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
