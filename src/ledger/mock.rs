//! In-memory ledger for tests
//!
//! Carries the contract's guard semantics (duplicate registration,
//! duplicate transfer id, double dispute all revert) and emits sequenced
//! events on every accepted write, so projector and reconciler tests run
//! against the same idempotency behavior a real ledger enforces.
//! Fault injection mirrors the mock-adapter pattern used elsewhere:
//! `fail_next_with` makes the next write fail without side effects.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::ledger::traits::{LedgerClient, LedgerReceipt, LedgerTransfer, LedgerUserInfo};
use crate::models::{normalize_address, LedgerEvent, ReconcileError, SequencedEvent};

#[derive(Debug, Clone)]
struct MockUser {
    name: String,
    email: String,
    approved: bool,
    requested: bool,
}

#[derive(Default)]
struct Inner {
    users: HashMap<String, MockUser>,
    transfers: HashMap<String, LedgerTransfer>,
    rates: HashMap<String, u128>,
    events: Vec<SequencedEvent>,
    next_sequence: u64,
    fail_next: Option<ReconcileError>,
}

pub struct MockLedger {
    signer: String,
    inner: Mutex<Inner>,
}

impl Default for MockLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLedger {
    pub fn new() -> Self {
        Self::with_signer("0x00000000000000000000000000000000000000aa")
    }

    /// The account every mock `send_remittance` debits from.
    pub fn with_signer(signer: &str) -> Self {
        Self {
            signer: normalize_address(signer),
            inner: Mutex::new(Inner {
                next_sequence: 0,
                ..Default::default()
            }),
        }
    }

    /// Make the next write fail with `err`, leaving no side effects.
    pub fn fail_next_with(&self, err: ReconcileError) {
        self.inner.lock().unwrap().fail_next = Some(err);
    }

    /// Append an event directly, as if the ledger emitted it outside this
    /// process (a wallet-signed write). Returns the assigned sequence.
    pub fn emit(&self, event: LedgerEvent) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        Self::push_event(&mut inner, event)
    }

    /// Flag an address as having requested KYC wallet-side, the analogue
    /// of an account calling `requestKYC()` itself. An address this
    /// ledger never saw gets an empty on-chain record, so `user_info`
    /// reads it back as absent.
    pub fn set_requested(&self, address: &str) {
        let mut inner = self.inner.lock().unwrap();
        let key = normalize_address(address);
        inner
            .users
            .entry(key)
            .or_insert(MockUser {
                name: String::new(),
                email: String::new(),
                approved: false,
                requested: false,
            })
            .requested = true;
    }

    pub fn set_rate(&self, currency: &str, rate: u128) {
        self.inner
            .lock()
            .unwrap()
            .rates
            .insert(currency.to_string(), rate);
    }

    pub fn event_count(&self) -> usize {
        self.inner.lock().unwrap().events.len()
    }

    fn push_event(inner: &mut Inner, event: LedgerEvent) -> u64 {
        inner.next_sequence += 1;
        let sequence = inner.next_sequence;
        inner.events.push(SequencedEvent { sequence, event });
        sequence
    }

    fn block_time(sequence: u64) -> u64 {
        1_700_000_000 + sequence
    }

    fn take_fault(inner: &mut Inner) -> Result<(), ReconcileError> {
        match inner.fail_next.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl LedgerClient for MockLedger {
    async fn register_user(
        &self,
        address: &str,
        name: &str,
        email: &str,
    ) -> Result<LedgerReceipt, ReconcileError> {
        let mut inner = self.inner.lock().unwrap();
        Self::take_fault(&mut inner)?;
        let key = normalize_address(address);
        if inner.users.contains_key(&key) {
            return Err(ReconcileError::LedgerRejected(
                "user already registered".to_string(),
            ));
        }
        inner.users.insert(
            key.clone(),
            MockUser {
                name: name.to_string(),
                email: email.to_string(),
                approved: false,
                requested: false,
            },
        );
        let sequence = Self::push_event(
            &mut inner,
            LedgerEvent::UserRegistered {
                user: key,
                name: name.to_string(),
                email: email.to_string(),
            },
        );
        Ok(LedgerReceipt { sequence })
    }

    async fn approve_kyc(&self, address: &str) -> Result<LedgerReceipt, ReconcileError> {
        let mut inner = self.inner.lock().unwrap();
        Self::take_fault(&mut inner)?;
        let key = normalize_address(address);
        let user = inner
            .users
            .get_mut(&key)
            .ok_or_else(|| ReconcileError::LedgerRejected("user not registered".to_string()))?;
        if user.approved {
            return Err(ReconcileError::LedgerRejected(
                "KYC already approved".to_string(),
            ));
        }
        user.approved = true;
        user.requested = false;
        let sequence = Self::push_event(&mut inner, LedgerEvent::KycApproved { user: key });
        Ok(LedgerReceipt { sequence })
    }

    async fn revoke_kyc(&self, address: &str) -> Result<LedgerReceipt, ReconcileError> {
        let mut inner = self.inner.lock().unwrap();
        Self::take_fault(&mut inner)?;
        let key = normalize_address(address);
        let user = inner
            .users
            .get_mut(&key)
            .ok_or_else(|| ReconcileError::LedgerRejected("user not registered".to_string()))?;
        user.approved = false;
        user.requested = false;
        let sequence = Self::push_event(&mut inner, LedgerEvent::KycRevoked { user: key });
        Ok(LedgerReceipt { sequence })
    }

    async fn send_remittance(
        &self,
        receiver: &str,
        transfer_id: &str,
        currency: &str,
        amount_wei: u128,
    ) -> Result<LedgerReceipt, ReconcileError> {
        let mut inner = self.inner.lock().unwrap();
        Self::take_fault(&mut inner)?;
        if inner.transfers.contains_key(transfer_id) {
            return Err(ReconcileError::LedgerRejected(
                "transaction ID already exists".to_string(),
            ));
        }
        let sender = self.signer.clone();
        let receiver = normalize_address(receiver);
        let timestamp = Self::block_time(inner.next_sequence + 1);
        inner.transfers.insert(
            transfer_id.to_string(),
            LedgerTransfer {
                sender: sender.clone(),
                receiver: receiver.clone(),
                amount: amount_wei,
                timestamp,
                currency: currency.to_string(),
                disputed: false,
            },
        );
        let sequence = Self::push_event(
            &mut inner,
            LedgerEvent::Sent {
                transfer_id: transfer_id.to_string(),
                sender,
                receiver,
                amount: amount_wei,
                currency: currency.to_string(),
                timestamp,
            },
        );
        Ok(LedgerReceipt { sequence })
    }

    async fn raise_dispute(&self, transfer_id: &str) -> Result<LedgerReceipt, ReconcileError> {
        let mut inner = self.inner.lock().unwrap();
        Self::take_fault(&mut inner)?;
        let transfer = inner
            .transfers
            .get_mut(transfer_id)
            .ok_or_else(|| ReconcileError::LedgerRejected("transaction not found".to_string()))?;
        if transfer.disputed {
            return Err(ReconcileError::LedgerRejected(
                "already disputed".to_string(),
            ));
        }
        transfer.disputed = true;
        inner.next_sequence += 1;
        // The contract emits no dispute event; state changes silently.
        Ok(LedgerReceipt {
            sequence: inner.next_sequence,
        })
    }

    async fn user_info(&self, address: &str) -> Result<Option<LedgerUserInfo>, ReconcileError> {
        let inner = self.inner.lock().unwrap();
        // Empty record reads as absent, the same sentinel the contract's
        // getUserInfo produces for an unregistered address.
        Ok(inner
            .users
            .get(&normalize_address(address))
            .filter(|u| !u.name.is_empty() || !u.email.is_empty() || u.approved)
            .map(|u| LedgerUserInfo {
                name: u.name.clone(),
                email: u.email.clone(),
                approved: u.approved,
            }))
    }

    async fn is_kyc_approved(&self, address: &str) -> Result<bool, ReconcileError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .users
            .get(&normalize_address(address))
            .map(|u| u.approved)
            .unwrap_or(false))
    }

    async fn is_kyc_requested(&self, address: &str) -> Result<bool, ReconcileError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .users
            .get(&normalize_address(address))
            .map(|u| u.requested)
            .unwrap_or(false))
    }

    async fn pending_users(&self) -> Result<Vec<String>, ReconcileError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .users
            .iter()
            .filter(|(_, u)| u.requested && !u.approved)
            .map(|(addr, _)| addr.clone())
            .collect())
    }

    async fn approved_users(&self) -> Result<Vec<String>, ReconcileError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .users
            .iter()
            .filter(|(_, u)| u.approved)
            .map(|(addr, _)| addr.clone())
            .collect())
    }

    async fn transaction(
        &self,
        transfer_id: &str,
    ) -> Result<Option<LedgerTransfer>, ReconcileError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.transfers.get(transfer_id).cloned())
    }

    async fn currency_rate(&self, currency: &str) -> Result<u128, ReconcileError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.rates.get(currency).copied().unwrap_or(0))
    }

    async fn events_from(
        &self,
        watermark: u64,
        limit: usize,
    ) -> Result<Vec<SequencedEvent>, ReconcileError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .events
            .iter()
            .filter(|e| e.sequence > watermark)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplicate_registration_reverts() {
        let ledger = MockLedger::new();
        ledger.register_user("0xAAA", "Alice", "alice@x.io").await.unwrap();
        let err = ledger
            .register_user("0xaaa", "Alice", "alice@x.io")
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::LedgerRejected(_)));
        assert_eq!(ledger.event_count(), 1);
    }

    #[tokio::test]
    async fn test_sequences_are_strictly_increasing() {
        let ledger = MockLedger::new();
        let r1 = ledger.register_user("0xAAA", "Alice", "a@x.io").await.unwrap();
        let r2 = ledger.approve_kyc("0xaaa").await.unwrap();
        assert!(r2.sequence > r1.sequence);

        let events = ledger.events_from(0, 100).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].sequence, r1.sequence);
        // Resume past the first event
        let tail = ledger.events_from(r1.sequence, 100).await.unwrap();
        assert_eq!(tail.len(), 1);
    }

    #[tokio::test]
    async fn test_requested_flag_feeds_pending_listing() {
        let ledger = MockLedger::new();
        ledger.register_user("0xAAA", "Alice", "a@x.io").await.unwrap();
        ledger.set_requested("0xAAA");
        assert!(ledger.is_kyc_requested("0xaaa").await.unwrap());
        assert_eq!(
            ledger.pending_users().await.unwrap(),
            vec!["0xaaa".to_string()]
        );

        // Approval clears the pending state
        ledger.approve_kyc("0xAAA").await.unwrap();
        assert!(ledger.pending_users().await.unwrap().is_empty());

        // A request from an address with no real record still lists as
        // pending, but its record reads back as absent
        ledger.set_requested("0xccc");
        assert!(ledger.user_info("0xccc").await.unwrap().is_none());
        assert_eq!(
            ledger.pending_users().await.unwrap(),
            vec!["0xccc".to_string()]
        );
    }

    #[tokio::test]
    async fn test_fault_injection_leaves_no_side_effects() {
        let ledger = MockLedger::new();
        ledger.fail_next_with(ReconcileError::LedgerUnavailable("timeout".to_string()));
        let err = ledger
            .register_user("0xAAA", "Alice", "a@x.io")
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(ledger.user_info("0xAAA").await.unwrap().is_none());
        assert_eq!(ledger.event_count(), 0);
    }
}
