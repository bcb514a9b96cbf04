//! Cache module - local mirror of ledger state
//!
//! Two keyed projections (users by address, transfers by id) plus the
//! projector's watermark bookkeeping, behind a per-key-atomic upsert trait.

pub mod sled_store;
pub mod store;

pub use sled_store::SledCacheStore;
pub use store::CacheStore;
