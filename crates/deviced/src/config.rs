//! Configuration for deviced

use clap::Parser;
use std::path::PathBuf;

/// deviced - Sapphire device server daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "deviced")]
#[command(about = "Sapphire device server daemon")]
pub struct Config {
    /// Broker URL for the object exchange
    #[arg(short, long, default_value = "redis://127.0.0.1/", env = "SAPPHIRE_BROKER_URL")]
    pub broker_url: String,

    /// Data directory for the KV metadata cache
    #[arg(short, long, default_value = "./data/deviced")]
    pub data_dir: PathBuf,

    /// Seconds between discovery sweeps
    #[arg(long, default_value = "8")]
    pub scan_interval_secs: u64,

    /// UDP port the notification server binds
    #[arg(long, default_value = "59999")]
    pub notification_port: u16,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.broker_url.is_empty() {
            anyhow::bail!("Broker URL cannot be empty");
        }
        if self.scan_interval_secs == 0 {
            anyhow::bail!("Scan interval must be at least one second");
        }
        Ok(())
    }
}
