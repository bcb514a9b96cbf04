pub mod cache;
pub mod configure;
pub mod ledger;
pub mod logger;
pub mod models;
pub mod projector;
pub mod rates;
pub mod reconciler;
pub mod txid;
