use anyhow::{Context, Result};
use log::info;

use rtu_link::cli::{handle_subcommands, parse_args};
use rtu_link::{Config, DataService};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let matches = parse_args();
    let config = Config::from_matches(&matches).context("invalid configuration")?;

    if handle_subcommands(&matches, &config).await? {
        return Ok(());
    }

    // no subcommand: behave like `run`
    info!("🚀 rtu_link {} starting", env!("CARGO_PKG_VERSION"));
    let mut service = DataService::new(config)?;
    service.run().await?;
    Ok(())
}
