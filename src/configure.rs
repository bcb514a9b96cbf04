use config::{Config, ConfigError, File};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub provider_url: String,
    pub contract_address: String,
    pub chain_id: u64,
    pub cache_path: String,
    pub log_level: String,
    pub log_to_file: bool,
    pub log_file: String,
    /// Bounded wait for ledger write confirmation (ms); a timeout is
    /// reported as retryable, the transaction may still land.
    pub confirm_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub event_batch_size: usize,
}

pub fn load_config() -> Result<AppConfig, ConfigError> {
    let s = Config::builder()
        // Set defaults
        .set_default("provider_url", "http://localhost:8545")?
        .set_default("contract_address", "0x0000000000000000000000000000000000000000")?
        .set_default("chain_id", 31337)?
        .set_default("cache_path", "cache_db/remitsync")?
        .set_default("log_level", "info")?
        .set_default("log_to_file", false)?
        .set_default("log_file", "log/remitsync.log")?
        .set_default("confirm_timeout_ms", 60_000)?
        .set_default("poll_interval_ms", 3_000)?
        .set_default("event_batch_size", 256)?
        // Add configuration from a file
        .add_source(File::with_name("config/config.yaml").required(false))
        // Add configuration from environment variables
        .add_source(config::Environment::with_prefix("APP"))
        .build()?;

    s.try_deserialize()
}
