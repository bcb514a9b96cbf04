//! Projector daemon
//!
//! Runs the single continuously-subscribed event projector: polls the
//! remittance contract's event log from the durable watermark and keeps
//! the local mirror converged. Restart-safe; replays are no-ops.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use log::info;

use remitsync::cache::{CacheStore, SledCacheStore};
use remitsync::configure::load_config;
use remitsync::ledger::EthLedgerClient;
use remitsync::logger;
use remitsync::projector::{EventProjector, ProjectorConfig};

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Override the stored watermark and resubscribe from this sequence
    #[clap(long, default_value = "-1")]
    from_sequence: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    let args = Args::parse();
    let config = load_config().context("Failed to load config")?;
    logger::setup_logger(&config).expect("Failed to set up logger");

    let private_key = env::var("PRIVATE_KEY").context("PRIVATE_KEY must be set")?;

    let ledger = Arc::new(EthLedgerClient::connect(
        &config.provider_url,
        &config.contract_address,
        &private_key,
        config.chain_id,
        Duration::from_millis(config.confirm_timeout_ms),
    )?);
    let cache = Arc::new(SledCacheStore::open(&config.cache_path)?);

    if args.from_sequence >= 0 {
        cache.set_watermark(args.from_sequence as u64).await?;
        info!("watermark overridden to {}", args.from_sequence);
    }

    info!(
        "remitsync projector connecting to {} (contract {})",
        config.provider_url, config.contract_address
    );

    let projector = EventProjector::new(
        ledger,
        cache,
        ProjectorConfig {
            poll_interval_ms: config.poll_interval_ms,
            batch_size: config.event_batch_size,
            ..Default::default()
        },
    );
    projector.run().await;
    Ok(())
}
