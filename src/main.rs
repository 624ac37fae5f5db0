//! SHARD - host announcement relay
//!
//! Follows a chain node, indexes host announcements and serves them over
//! HTTP. Also queries a remote relay from the command line.

use shard_core::{run_relay, Command, HostPublicKey, ShardClient};
use std::error::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Parse CLI arguments and build config
    let command = Command::from_cli()?;

    // Initialize logging
    init_logging(command.log_level());

    match command {
        Command::Start(config) => {
            tracing::info!("Starting SHARD relay...");
            run_relay(config).await?;
        }
        Command::Resolve(cmd) => {
            let client = ShardClient::new(&cmd.server);
            let address = client
                .resolve_host_key(&HostPublicKey::from(cmd.pubkey))
                .await?;
            println!("{}", address);
        }
        Command::Lookup(cmd) => {
            let client = ShardClient::new(&cmd.server);
            let key = client.lookup_host(&cmd.prefix).await?;
            println!("{}", key);
        }
    }

    Ok(())
}

fn init_logging(level: &str) {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(level))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
