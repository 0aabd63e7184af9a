//! deviced - Sapphire device server daemon
//!
//! Bridges the device fleet into the object exchange: discovers devices on
//! the network, supervises each one, receives their notification streams,
//! and keeps their exchange objects live for every other Sapphire process.

mod config;
mod monitor;
mod notifications;

use clap::Parser;
use config::Config;
use monitor::MonitorManager;
use notifications::NotificationServer;
use sapphire_core::{Exchange, Store, Transport};
use sapphire_devices::{DeviceRegistry, NetworkScanner};
use sapphire_net::SocketPool;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("deviced=info".parse().unwrap()))
        .init();

    // Parse configuration
    let config = Config::parse();

    if let Err(e) = config.validate() {
        error!("invalid configuration: {}", e);
        return ExitCode::FAILURE;
    }

    info!(
        "deviced v{} - Sapphire Device Server Daemon",
        env!("CARGO_PKG_VERSION")
    );

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("deviced failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let exchange = Exchange::new();
    info!("origin id: {}", exchange.origin());

    let transport = Transport::start(&exchange, &config.broker_url)?;

    let store = Arc::new(Store::open(config.data_dir.join("kv_meta_cache"))?);
    let registry = DeviceRegistry::new();
    let pool = SocketPool::new();

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

    let notifications =
        NotificationServer::bind(registry.clone(), config.notification_port).await?;
    let notifications_handle = notifications.spawn(shutdown_tx.subscribe());

    let (found_tx, found_rx) = tokio::sync::mpsc::unbounded_channel();

    let scanner = Arc::new(
        NetworkScanner::new(
            exchange.clone(),
            registry.clone(),
            pool,
            store,
            found_tx,
        )
        .scan_interval(Duration::from_secs(config.scan_interval_secs)),
    );
    let scanner_handle = scanner.spawn(shutdown_tx.subscribe());

    let manager = MonitorManager::new(
        exchange.clone(),
        registry,
        config.notification_port,
        shutdown_tx.clone(),
    );
    let intake_handle = manager.spawn_intake(found_rx);

    tokio::signal::ctrl_c().await.ok();
    info!("received shutdown signal");

    let _ = shutdown_tx.send(());
    manager.stop();

    let _ = notifications_handle.await;
    let _ = scanner_handle.await;
    let _ = intake_handle.await;

    transport.stop(&exchange).await;

    Ok(())
}
