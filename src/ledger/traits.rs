//! Ledger client contract
//!
//! All writes submit a transaction, wait for inclusion under a bounded
//! timeout, and fail with `LedgerRejected` (execution reverted) or
//! `LedgerUnavailable` (network or timeout; the transaction may still
//! land later, and the event projector reconciles it). The client holds
//! no durable state; the event watermark lives with the cache.

use async_trait::async_trait;

use crate::models::{ReconcileError, SequencedEvent};

/// Confirmation of an included ledger write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerReceipt {
    /// Position of the write in the ledger's total order.
    pub sequence: u64,
}

/// Ledger-side user record, as returned by the `getUserInfo` view.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerUserInfo {
    pub name: String,
    pub email: String,
    pub approved: bool,
}

/// Ledger-side remittance record, as returned by the `getTransaction` view.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerTransfer {
    pub sender: String,
    pub receiver: String,
    pub amount: u128,
    pub timestamp: u64,
    pub currency: String,
    pub disputed: bool,
}

#[async_trait]
pub trait LedgerClient: Send + Sync {
    // Writes

    async fn register_user(
        &self,
        address: &str,
        name: &str,
        email: &str,
    ) -> Result<LedgerReceipt, ReconcileError>;

    async fn approve_kyc(&self, address: &str) -> Result<LedgerReceipt, ReconcileError>;

    async fn revoke_kyc(&self, address: &str) -> Result<LedgerReceipt, ReconcileError>;

    /// Payable: moves `amount_wei` from the signing account to `receiver`
    /// and records `transfer_id` on the ledger. The ledger rejects a
    /// duplicate id, which is what makes the id an idempotency key.
    async fn send_remittance(
        &self,
        receiver: &str,
        transfer_id: &str,
        currency: &str,
        amount_wei: u128,
    ) -> Result<LedgerReceipt, ReconcileError>;

    async fn raise_dispute(&self, transfer_id: &str) -> Result<LedgerReceipt, ReconcileError>;

    // Views

    /// None when the address has never registered on the ledger.
    async fn user_info(&self, address: &str) -> Result<Option<LedgerUserInfo>, ReconcileError>;

    async fn is_kyc_approved(&self, address: &str) -> Result<bool, ReconcileError>;

    async fn is_kyc_requested(&self, address: &str) -> Result<bool, ReconcileError>;

    async fn pending_users(&self) -> Result<Vec<String>, ReconcileError>;

    async fn approved_users(&self) -> Result<Vec<String>, ReconcileError>;

    async fn transaction(
        &self,
        transfer_id: &str,
    ) -> Result<Option<LedgerTransfer>, ReconcileError>;

    /// On-chain display rate for `currency`, scaled integer; 0 means the
    /// contract has no rate set and callers should use a price feed.
    async fn currency_rate(&self, currency: &str) -> Result<u128, ReconcileError>;

    // Events

    /// Events with sequence strictly greater than `watermark`, ascending,
    /// at most `limit`. Restartable from any watermark.
    async fn events_from(
        &self,
        watermark: u64,
        limit: usize,
    ) -> Result<Vec<SequencedEvent>, ReconcileError>;
}
