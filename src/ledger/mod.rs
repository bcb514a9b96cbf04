//! Ledger module - typed access to the remittance contract
//!
//! The trait keeps signing, submission, and confirmation behind one seam
//! so the reconciler and projector are testable against the mock.

pub mod eth;
pub mod mock;
pub mod traits;

pub use eth::EthLedgerClient;
pub use mock::MockLedger;
pub use traits::{LedgerClient, LedgerReceipt, LedgerTransfer, LedgerUserInfo};
