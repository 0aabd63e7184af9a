//! automatond - Sapphire automaton daemon
//!
//! Hosts the rule engine against the object exchange. The daemon publishes
//! a script-control object in the `automaton` collection; peers pause and
//! resume evaluation by flipping its `running` attribute. A built-in
//! heartbeat rule stamps the object on a fixed interval so the fleet can
//! see the engine is alive.

mod config;

use clap::Parser;
use config::Config;
use sapphire_automaton::{Automaton, FnAction, IntervalTrigger, Rule};
use sapphire_core::{Exchange, KvObject, Transport};
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("automatond=info".parse().unwrap()))
        .init();

    // Parse configuration
    let config = Config::parse();

    if let Err(e) = config.validate() {
        error!("invalid configuration: {}", e);
        return ExitCode::FAILURE;
    }

    info!(
        "automatond v{} - Sapphire Automaton Daemon",
        env!("CARGO_PKG_VERSION")
    );

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("automatond failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let exchange = Exchange::new();
    info!("origin id: {}", exchange.origin());
    info!("starting automaton script: {}", config.script_name);

    let transport = Transport::start(&exchange, &config.broker_url)?;

    let script_control = KvObject::new(exchange.origin(), Some("automaton"));
    script_control.set("running", true)?;
    script_control.set(
        "hostname",
        std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string()),
    )?;
    script_control.set("scriptname", config.script_name.clone())?;
    exchange.publish(&script_control);

    let mut automaton = Automaton::new(exchange.clone());

    // heartbeat: stamp the script-control object so peers see liveness
    let heartbeat_target = script_control.clone();
    let heartbeat_exchange = exchange.clone();
    automaton.add_rule(
        Rule::new()
            .trigger(
                IntervalTrigger::new()
                    .seconds(config.heartbeat_secs)
                    .run_now(),
            )
            .action(FnAction(move |_| {
                let now = chrono::Utc::now().to_rfc3339();
                if heartbeat_target.set("last_heartbeat", now).is_ok() {
                    heartbeat_exchange.publish(&heartbeat_target);
                }
            })),
    );

    automaton.start();

    // honor remote flips of the script-control running flag
    let mut engine_running = true;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
        }

        let wanted = script_control
            .get("running")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);

        if wanted != engine_running {
            engine_running = wanted;
            if wanted {
                info!("automaton started by script control");
                automaton.resume();
            } else {
                info!("automaton stopped by script control");
                automaton.pause();
            }
        }
    }

    info!("received shutdown signal");

    automaton.stop();
    transport.stop(&exchange).await;

    Ok(())
}
