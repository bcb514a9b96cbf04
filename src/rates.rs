//! Currency rate lookup
//!
//! The contract can carry a display rate per currency; when it is unset
//! (or the ledger is unreachable) the public price feed answers instead.
//! Feed responses are cached for a minute to stay under its rate limits.

use cached::proc_macro::cached;
use log::warn;

use crate::ledger::LedgerClient;
use crate::models::ReconcileError;

const FEED_URL: &str = "https://api.coingecko.com/api/v3/simple/price";

/// A quote and where it came from. Ledger rates are scaled integers set
/// by the contract admin; feed rates are floats straight from the feed.
#[derive(Debug, Clone, PartialEq)]
pub enum RateQuote {
    Ledger(u128),
    Feed(f64),
}

#[cached(time = 60, result = true, sync_writes = true)]
async fn fetch_feed_rate(currency: String) -> Result<f64, ReconcileError> {
    let url = format!("{}?ids=ethereum&vs_currencies={}", FEED_URL, currency);
    let body: serde_json::Value = reqwest::get(&url)
        .await
        .map_err(|e| ReconcileError::Unknown(format!("price feed request: {}", e)))?
        .json()
        .await
        .map_err(|e| ReconcileError::Unknown(format!("price feed body: {}", e)))?;
    body["ethereum"][currency.as_str()]
        .as_f64()
        .ok_or_else(|| ReconcileError::Unknown(format!("no feed rate for {}", currency)))
}

pub async fn get_rate(
    ledger: &dyn LedgerClient,
    currency: &str,
) -> Result<RateQuote, ReconcileError> {
    let currency = currency.to_lowercase();
    match ledger.currency_rate(&currency).await {
        Ok(rate) if rate > 0 => return Ok(RateQuote::Ledger(rate)),
        Ok(_) => {}
        Err(err) => warn!(
            "on-chain rate lookup for {} failed ({}), falling back to feed",
            currency, err
        ),
    }
    Ok(RateQuote::Feed(fetch_feed_rate(currency).await?))
}
