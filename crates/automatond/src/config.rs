//! Configuration for automatond

use clap::Parser;

/// automatond - Sapphire automaton daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "automatond")]
#[command(about = "Sapphire automaton daemon")]
pub struct Config {
    /// Broker URL for the object exchange
    #[arg(short, long, default_value = "redis://127.0.0.1/", env = "SAPPHIRE_BROKER_URL")]
    pub broker_url: String,

    /// Name published on the script-control object
    #[arg(long, default_value = "automatond")]
    pub script_name: String,

    /// Seconds between heartbeat updates on the script-control object
    #[arg(long, default_value = "60")]
    pub heartbeat_secs: u64,

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
        if self.heartbeat_secs == 0 {
            anyhow::bail!("Heartbeat interval must be at least one second");
        }
        Ok(())
    }
}
