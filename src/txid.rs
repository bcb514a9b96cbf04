//! Transfer-id generation
//!
//! Ids are the ledger's idempotency key, so they only need uniqueness
//! with high probability: millisecond timestamp plus a short random
//! suffix, in the same `TX_<ms>_<suffix>` shape wallets generate.

use rand::distr::Alphanumeric;
use rand::Rng;

const SUFFIX_LEN: usize = 9;

pub fn new_transfer_id() -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    let suffix: String = rand::rng()
        .sample_iter(Alphanumeric)
        .take(SUFFIX_LEN)
        .map(char::from)
        .collect();
    format!("TX_{}_{}", millis, suffix.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_shape_and_uniqueness() {
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            let id = new_transfer_id();
            assert!(id.starts_with("TX_"));
            assert_eq!(id.split('_').count(), 3);
            assert!(seen.insert(id), "generated a duplicate transfer id");
        }
    }
}
