//! Reference peer driver
//!
//! `peer` with no argument runs a listening node on the default port;
//! `peer URL` runs an unlistening node bootstrapped to the given URL.

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use legio::{Configuration, Node};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Tick cadence of the node loop.
const PERIOD: Duration = Duration::from_millis(200);

#[derive(Parser)]
#[command(name = "peer", version, about = "Legio overlay peer")]
struct Args {
    /// Bootstrap URL (ws://host:port) or base64url node identifier
    url: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config = Configuration {
        // A bootstrapping peer does not listen, like the reference client.
        port: if args.url.is_some() { None } else { Some(legio::DEFAULT_PORT) },
        ..Configuration::default()
    };

    let node = match Node::new(config) {
        Ok(node) => node,
        Err(e) => {
            error!("Node construction failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    info!("Local node is {}", node.id());
    if let Some(url) = node.url() {
        info!("Reachable at {}", url);
    }

    node.on_message(|remote_id, payload| {
        info!("Message from {}: {} bytes", remote_id, payload.len());
    });

    if let Some(url) = &args.url {
        info!("Connecting to {}", url);
        if let Err(e) = node.connect(url) {
            error!("Connection failed: {}", e);
            return ExitCode::FAILURE;
        }
    }

    let mut interval = tokio::time::interval(PERIOD);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => node.update(),
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    ExitCode::SUCCESS
}
