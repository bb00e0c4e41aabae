//! docrelay: operator CLI
//!
//! Tails channels or publishes a single message through the shared store.
//!
//! ## Usage
//! ```text
//! docrelay [--config <path>] tail <channel>...
//! docrelay [--config <path>] publish <channel> <payload>
//! ```
//!
//! ## Configuration
//! - DOCRELAY_CONFIG: Path to a YAML config file (optional)
//! - DOCRELAY__STORE__URI etc.: Override individual settings
//! - DOCRELAY_LOG: Tracing filter (default: info)

use std::sync::Arc;

use tracing::{error, info};

use docrelay::config::RelayConfig;
use docrelay::store::connect_store;
use docrelay::utils::bootstrap::{init_tracing, parse_config_path};
use docrelay::{Callback, Relay, SerialExecutor};

const USAGE: &str = "usage: docrelay [--config <path>] (tail <channel>... | publish <channel> <payload>)";

enum Command {
    Tail(Vec<String>),
    Publish { channel: String, payload: String },
}

fn parse_command(args: &[String]) -> Option<Command> {
    // Drop the program name and any --config/-c pair.
    let mut rest = Vec::new();
    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        if arg == "--config" || arg == "-c" {
            iter.next();
        } else {
            rest.push(arg.clone());
        }
    }

    match rest.split_first()? {
        (cmd, channels) if cmd == "tail" && !channels.is_empty() => {
            Some(Command::Tail(channels.to_vec()))
        }
        (cmd, [channel, payload]) if cmd == "publish" => Some(Command::Publish {
            channel: channel.clone(),
            payload: payload.clone(),
        }),
        _ => None,
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_tracing();

    let args: Vec<String> = std::env::args().collect();
    let Some(command) = parse_command(&args) else {
        eprintln!("{}", USAGE);
        std::process::exit(2);
    };

    let config = RelayConfig::load(parse_config_path(&args).as_deref())?;
    let store = connect_store(&config.store, config.message_ttl()).await?;

    let executor = Arc::new(SerialExecutor::spawn("docrelay-dispatch")?);
    let relay = Relay::new(store, executor.clone(), config).await?;

    let ok = match command {
        Command::Tail(channels) => {
            for channel in &channels {
                let name = channel.clone();
                relay.subscribe(
                    channel,
                    Callback::new(move |payload| println!("[{}] {}", name, payload)),
                    None,
                );
            }
            info!(channels = ?channels, "Tailing, press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            true
        }
        Command::Publish { channel, payload } => {
            let ok = relay.broadcast(&channel, &payload).await;
            if !ok {
                error!(channel = %channel, "Publish failed");
            }
            ok
        }
    };

    relay.shutdown().await;
    executor.close();

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}
