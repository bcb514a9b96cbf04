//! Cache projections of ledger state
//!
//! A projection is a denormalized, queryable mirror of what the ledger
//! holds for one key. The ledger is always the source of truth; a
//! projection may lag it but never leads it on security-relevant flags.

use serde::{Deserialize, Serialize};

/// Lowercase-normalize an address so every code path keys the cache the
/// same way regardless of checksum casing in the input.
pub fn normalize_address(address: &str) -> String {
    address.trim().to_lowercase()
}

/// Mirror of one registered user, keyed by normalized address.
///
/// `name`/`email` are `Option` so a stub created from a bare ledger event
/// (approval seen before registration) is distinguishable from a user who
/// registered with empty strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProjection {
    pub address: String,
    pub name: Option<String>,
    pub email: Option<String>,
    #[serde(default)]
    pub kyc_approved: bool,
    /// Off-chain intent flag. May lead the ledger state.
    #[serde(default)]
    pub kyc_requested: bool,
}

impl UserProjection {
    /// Minimal stub for an address the ledger knows but the cache missed.
    pub fn stub(address: &str) -> Self {
        Self {
            address: normalize_address(address),
            name: None,
            email: None,
            kyc_approved: false,
            kyc_requested: false,
        }
    }
}

/// Partial update for a UserProjection. Merge is last-write-wins per
/// present field; absent fields keep the stored value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserPatch {
    pub name: Option<String>,
    pub email: Option<String>,
    pub kyc_approved: Option<bool>,
    pub kyc_requested: Option<bool>,
}

impl UserPatch {
    pub fn apply_to(&self, projection: &mut UserProjection) {
        if let Some(name) = &self.name {
            projection.name = Some(name.clone());
        }
        if let Some(email) = &self.email {
            projection.email = Some(email.clone());
        }
        if let Some(approved) = self.kyc_approved {
            projection.kyc_approved = approved;
        }
        if let Some(requested) = self.kyc_requested {
            projection.kyc_requested = requested;
        }
    }
}

/// Mirror of one on-ledger remittance, keyed by transfer id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferProjection {
    pub transfer_id: String,
    pub sender: String,
    pub receiver: String,
    /// Ledger native smallest unit (wei). Never floating point.
    pub amount: u128,
    /// Display currency. Non-native codes are advisory; the ledger still
    /// settles in its native unit.
    pub currency: String,
    /// Ledger block time at inclusion, not client wall-clock.
    pub timestamp: u64,
    /// Terminal once true; there is no un-dispute operation.
    #[serde(default)]
    pub is_disputed: bool,
}

/// Partial update for a TransferProjection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferPatch {
    pub sender: Option<String>,
    pub receiver: Option<String>,
    pub amount: Option<u128>,
    pub currency: Option<String>,
    pub timestamp: Option<u64>,
    pub is_disputed: Option<bool>,
}

impl TransferPatch {
    pub fn apply_to(&self, projection: &mut TransferProjection) {
        if let Some(sender) = &self.sender {
            projection.sender = sender.clone();
        }
        if let Some(receiver) = &self.receiver {
            projection.receiver = receiver.clone();
        }
        if let Some(amount) = self.amount {
            projection.amount = amount;
        }
        if let Some(currency) = &self.currency {
            projection.currency = currency.clone();
        }
        if let Some(timestamp) = self.timestamp {
            projection.timestamp = timestamp;
        }
        if let Some(disputed) = self.is_disputed {
            projection.is_disputed = disputed;
        }
    }

    pub fn from_projection(p: &TransferProjection) -> Self {
        Self {
            sender: Some(p.sender.clone()),
            receiver: Some(p.receiver.clone()),
            amount: Some(p.amount),
            currency: Some(p.currency.clone()),
            timestamp: Some(p.timestamp),
            is_disputed: Some(p.is_disputed),
        }
    }
}
