use clap::Parser;
use tracing::{error, info, Level};

use proxmox_infra_provider::cli::{self, Cli};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose() { Level::DEBUG } else { Level::INFO })
        .with_target(false)
        .init();
    info!("Starting Proxmox infrastructure provider");

    if let Err(err) = cli::run(cli).await {
        error!("{err:#}");
        return Err(err);
    }

    Ok(())
}
