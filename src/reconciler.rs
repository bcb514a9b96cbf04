//! Reconciliation Service
//!
//! Orchestrates every user-initiated state change as
//! validate -> ledger write -> confirm -> cache upsert -> return.
//! The ledger write is the economically meaningful action and its failure
//! always surfaces to the caller. The cache upsert is best-effort: it
//! cannot roll back an included ledger transaction, so its failure is
//! logged and left to the event projector to converge. Mirror writes
//! carry the confirmation sequence and are skipped whenever the
//! projector has already applied a newer event for the key, so they can
//! never roll the cache back behind the event stream.

use std::cmp;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};

use crate::cache::CacheStore;
use crate::ledger::{LedgerClient, LedgerTransfer};
use crate::models::{
    normalize_address, EventKind, ReconcileError, TransferPatch, TransferProjection, UserPatch,
    UserProjection,
};

/// Result of a mutating operation. `mirror_synced == false` means the
/// ledger write succeeded but the local mirror lags; detail views may be
/// briefly stale until the projector converges.
#[derive(Debug, Clone)]
pub struct OpOutcome<T> {
    pub value: T,
    pub mirror_synced: bool,
}

/// Reconciled KYC read. When cache and ledger disagree, both values are
/// returned and `mismatch` is set; disagreement is data, not a failure.
/// The ledger value is authoritative for access control; the cached value
/// only for display.
#[derive(Debug, Clone)]
pub struct KycStatus {
    pub address: String,
    pub cached: Option<bool>,
    pub ledger_confirmed: bool,
    pub mismatch: bool,
    pub user: Option<UserProjection>,
}

/// Where a listed user's detail fields came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetailSource {
    Cache,
    Ledger,
    /// Neither side holds detail for this address; `name`/`email` are
    /// unknown, not empty.
    Unknown,
}

/// One entry of a pending/approved listing: an authoritative ledger
/// address joined with whatever detail is available.
#[derive(Debug, Clone)]
pub struct UserDetail {
    pub address: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub kyc_approved: bool,
    pub source: DetailSource,
}

pub struct ReconciliationService {
    ledger: Arc<dyn LedgerClient>,
    cache: Arc<dyn CacheStore>,
    /// Advisory in-flight transfer ids. Purely an optimization to spare
    /// the ledger a redundant duplicate submission; the ledger's own
    /// duplicate-id guard is the serialization point.
    inflight: Mutex<HashSet<String>>,
}

impl ReconciliationService {
    pub fn new(ledger: Arc<dyn LedgerClient>, cache: Arc<dyn CacheStore>) -> Self {
        Self {
            ledger,
            cache,
            inflight: Mutex::new(HashSet::new()),
        }
    }

    // ---- mirror helpers -------------------------------------------------

    /// Highest event sequence the projector has applied for a user key.
    /// Spans every event kind that touches the user document, the same
    /// guard the projector itself uses.
    async fn user_guard(&self, key: &str) -> Result<u64, ReconcileError> {
        let mut guard = 0;
        for kind in [
            EventKind::UserRegistered,
            EventKind::KycApproved,
            EventKind::KycRevoked,
        ] {
            guard = cmp::max(guard, self.cache.applied_sequence(kind, key).await?);
        }
        Ok(guard)
    }

    /// Upsert the user mirror after a confirmed ledger write. Skipped
    /// when the projector has already applied a newer event for the key;
    /// an older confirmation must never overwrite it. On cache failure
    /// the operation still succeeds and the projector converges the
    /// mirror from the event stream.
    async fn mirror_user(
        &self,
        address: &str,
        patch: UserPatch,
        sequence: u64,
    ) -> (Option<UserProjection>, bool) {
        match self.user_guard(address).await {
            Ok(guard) if sequence <= guard => {
                debug!(
                    "mirror write for user {} at seq {} skipped, projection is at {}",
                    address, sequence, guard
                );
                return (self.cache.get_user(address).await.ok().flatten(), true);
            }
            Ok(_) => {}
            Err(err) => {
                warn!("mirror guard read for user {} failed: {}", address, err);
                return (None, false);
            }
        }
        match self.cache.upsert_user(address, patch).await {
            Ok(projection) => (Some(projection), true),
            Err(err) => {
                warn!(
                    "mirror update for user {} failed after confirmed ledger write: {}",
                    address, err
                );
                (None, false)
            }
        }
    }

    async fn mirror_transfer(
        &self,
        transfer_id: &str,
        patch: TransferPatch,
        sequence: u64,
    ) -> (Option<TransferProjection>, bool) {
        match self
            .cache
            .applied_sequence(EventKind::Sent, transfer_id)
            .await
        {
            Ok(guard) if sequence <= guard => {
                debug!(
                    "mirror write for transfer {} at seq {} skipped, projection is at {}",
                    transfer_id, sequence, guard
                );
                return (
                    self.cache.get_transfer(transfer_id).await.ok().flatten(),
                    true,
                );
            }
            Ok(_) => {}
            Err(err) => {
                warn!(
                    "mirror guard read for transfer {} failed: {}",
                    transfer_id, err
                );
                return (None, false);
            }
        }
        match self.cache.upsert_transfer(transfer_id, patch).await {
            Ok(projection) => (Some(projection), true),
            Err(err) => {
                warn!(
                    "mirror update for transfer {} failed after confirmed ledger write: {}",
                    transfer_id, err
                );
                (None, false)
            }
        }
    }

    // ---- registration ---------------------------------------------------

    pub async fn register(
        &self,
        address: &str,
        name: &str,
        email: &str,
    ) -> Result<OpOutcome<UserProjection>, ReconcileError> {
        let key = normalize_address(address);
        if key.is_empty() {
            return Err(ReconcileError::InvalidAddress(address.to_string()));
        }
        if name.trim().is_empty() || email.trim().is_empty() {
            return Err(ReconcileError::InvalidInput(
                "name and email are required".to_string(),
            ));
        }

        // Ledger is authoritative for existence; a cache-only projection
        // with no ledger record is a ghost and does not block.
        if self.ledger.user_info(&key).await?.is_some() {
            return Err(ReconcileError::AlreadyRegistered(key));
        }
        if self.cache.get_user(&key).await?.is_some() {
            warn!(
                "cache holds a projection for {} the ledger does not know; ledger wins, re-registering",
                key
            );
        }

        let receipt = self.ledger.register_user(&key, name, email).await?;
        info!("registered {} on ledger", key);

        let patch = UserPatch {
            name: Some(name.to_string()),
            email: Some(email.to_string()),
            kyc_approved: Some(false),
            kyc_requested: Some(false),
        };
        let (projection, mirror_synced) = self.mirror_user(&key, patch, receipt.sequence).await;
        Ok(OpOutcome {
            value: projection.unwrap_or(UserProjection {
                address: key,
                name: Some(name.to_string()),
                email: Some(email.to_string()),
                kyc_approved: false,
                kyc_requested: false,
            }),
            mirror_synced,
        })
    }

    /// True when the address is registered on both the ledger and the
    /// mirror; a half-registered state reads as false.
    pub async fn check_user(&self, address: &str) -> Result<bool, ReconcileError> {
        let key = normalize_address(address);
        let on_ledger = self.ledger.user_info(&key).await?.is_some();
        let in_cache = self.cache.get_user(&key).await?.is_some();
        Ok(on_ledger && in_cache)
    }

    // ---- KYC ------------------------------------------------------------

    /// Advisory bookkeeping only: records the off-chain intent flag. The
    /// caller's wallet submits the ledger's own request operation
    /// independently; this layer never does.
    pub async fn request_kyc(&self, address: &str) -> Result<UserProjection, ReconcileError> {
        let key = normalize_address(address);
        if self.cache.get_user(&key).await?.is_none() {
            return Err(ReconcileError::NotFound(key));
        }
        self.cache
            .upsert_user(
                &key,
                UserPatch {
                    kyc_requested: Some(true),
                    ..Default::default()
                },
            )
            .await
    }

    pub async fn approve_kyc(
        &self,
        address: &str,
    ) -> Result<OpOutcome<UserProjection>, ReconcileError> {
        let key = normalize_address(address);
        // Optimistic short-circuit on the cache; a stale false positive is
        // acceptable because the ledger guards the write itself.
        if let Some(user) = self.cache.get_user(&key).await? {
            if user.kyc_approved {
                return Err(ReconcileError::AlreadyApproved(key));
            }
        }

        let receipt = self.ledger.approve_kyc(&key).await?;
        info!("KYC approved on ledger for {}", key);

        let (projection, mirror_synced) = self
            .mirror_user(
                &key,
                UserPatch {
                    kyc_approved: Some(true),
                    kyc_requested: Some(false),
                    ..Default::default()
                },
                receipt.sequence,
            )
            .await;
        Ok(OpOutcome {
            value: projection.unwrap_or_else(|| {
                let mut stub = UserProjection::stub(&key);
                stub.kyc_approved = true;
                stub
            }),
            mirror_synced,
        })
    }

    pub async fn revoke_kyc(
        &self,
        address: &str,
    ) -> Result<OpOutcome<UserProjection>, ReconcileError> {
        let key = normalize_address(address);
        let receipt = self.ledger.revoke_kyc(&key).await?;
        info!("KYC revoked on ledger for {}", key);

        let (projection, mirror_synced) = self
            .mirror_user(
                &key,
                UserPatch {
                    kyc_approved: Some(false),
                    kyc_requested: Some(false),
                    ..Default::default()
                },
                receipt.sequence,
            )
            .await;
        Ok(OpOutcome {
            value: projection.unwrap_or_else(|| UserProjection::stub(&key)),
            mirror_synced,
        })
    }

    pub async fn get_kyc_status(&self, address: &str) -> Result<KycStatus, ReconcileError> {
        let key = normalize_address(address);
        let user = self.cache.get_user(&key).await?;
        let ledger_confirmed = self.ledger.is_kyc_approved(&key).await?;
        let cached = user.as_ref().map(|u| u.kyc_approved);
        // A missing projection only counts as disagreement when the
        // ledger says approved: the mirror then lags something material.
        let mismatch = match cached {
            Some(value) => value != ledger_confirmed,
            None => ledger_confirmed,
        };
        if mismatch {
            warn!(
                "KYC mismatch for {}: cache={:?} ledger={}",
                key, cached, ledger_confirmed
            );
        }
        Ok(KycStatus {
            address: key,
            cached,
            ledger_confirmed,
            mismatch,
            user,
        })
    }

    // ---- transfers ------------------------------------------------------

    pub async fn record_transfer(
        &self,
        transfer_id: &str,
        sender: &str,
        receiver: &str,
        amount: u128,
        currency: &str,
    ) -> Result<OpOutcome<TransferProjection>, ReconcileError> {
        if transfer_id.trim().is_empty() {
            return Err(ReconcileError::InvalidInput(
                "transfer id is required".to_string(),
            ));
        }
        if amount == 0 {
            return Err(ReconcileError::InvalidAmount(
                "amount must be greater than 0".to_string(),
            ));
        }
        let sender = normalize_address(sender);
        let receiver = normalize_address(receiver);
        if sender.is_empty() || receiver.is_empty() {
            return Err(ReconcileError::InvalidAddress(
                "sender and receiver are required".to_string(),
            ));
        }

        // Advisory guard: a concurrent submission of the same id would
        // only waste a ledger call the duplicate-id guard rejects anyway.
        let _guard = InflightGuard::acquire(&self.inflight, transfer_id)
            .ok_or_else(|| ReconcileError::DuplicateTransfer(transfer_id.to_string()))?;

        if let Some(existing) = self.ledger.transaction(transfer_id).await? {
            return self
                .settle_duplicate(transfer_id, &receiver, amount, currency, existing)
                .await;
        }

        let receipt = match self
            .ledger
            .send_remittance(&receiver, transfer_id, currency, amount)
            .await
        {
            Ok(receipt) => receipt,
            Err(ReconcileError::LedgerRejected(reason))
                if reason.contains("exists") || reason.contains("duplicate") =>
            {
                // Lost a race with another writer; re-read and resolve.
                match self.ledger.transaction(transfer_id).await? {
                    Some(existing) => {
                        return self
                            .settle_duplicate(transfer_id, &receiver, amount, currency, existing)
                            .await
                    }
                    None => return Err(ReconcileError::DuplicateTransfer(transfer_id.to_string())),
                }
            }
            Err(err) => return Err(err),
        };
        info!(
            "remittance {} confirmed on ledger: {} -> {} ({} {})",
            transfer_id, sender, receiver, amount, currency
        );

        // Block time is authoritative for the timestamp, so read the
        // record back rather than trusting the caller's clock.
        let ledger_record = self.ledger.transaction(transfer_id).await?;
        let projection = match ledger_record {
            Some(t) => projection_from_ledger(transfer_id, &t),
            None => {
                warn!(
                    "transfer {} confirmed but not yet readable; mirroring submitted values",
                    transfer_id
                );
                TransferProjection {
                    transfer_id: transfer_id.to_string(),
                    sender,
                    receiver,
                    amount,
                    currency: currency.to_string(),
                    timestamp: 0,
                    is_disputed: false,
                }
            }
        };

        let (mirrored, mirror_synced) = self
            .mirror_transfer(
                transfer_id,
                TransferPatch::from_projection(&projection),
                receipt.sequence,
            )
            .await;
        Ok(OpOutcome {
            value: mirrored.unwrap_or(projection),
            mirror_synced,
        })
    }

    /// A second write with an id the ledger already holds: identical
    /// payload is a no-op success, a differing payload is an error that
    /// must not mutate the existing record.
    async fn settle_duplicate(
        &self,
        transfer_id: &str,
        receiver: &str,
        amount: u128,
        currency: &str,
        existing: LedgerTransfer,
    ) -> Result<OpOutcome<TransferProjection>, ReconcileError> {
        if existing.receiver == receiver && existing.amount == amount && existing.currency == currency
        {
            let projection = projection_from_ledger(transfer_id, &existing);
            // No new confirmation to stamp the mirror with. A cached
            // record is left to the projector to keep current; only a
            // never-projected id is backfilled from the ledger read.
            if self.cache.get_transfer(transfer_id).await?.is_some() {
                return Ok(OpOutcome {
                    value: projection,
                    mirror_synced: true,
                });
            }
            let mirror_synced = match self
                .cache
                .upsert_transfer(transfer_id, TransferPatch::from_projection(&projection))
                .await
            {
                Ok(_) => true,
                Err(err) => {
                    warn!(
                        "mirror backfill for duplicate transfer {} failed: {}",
                        transfer_id, err
                    );
                    false
                }
            };
            return Ok(OpOutcome {
                value: projection,
                mirror_synced,
            });
        }
        Err(ReconcileError::DuplicateTransfer(transfer_id.to_string()))
    }

    pub async fn raise_dispute(
        &self,
        transfer_id: &str,
    ) -> Result<OpOutcome<TransferProjection>, ReconcileError> {
        let existing = self
            .ledger
            .transaction(transfer_id)
            .await?
            .ok_or_else(|| ReconcileError::NotFound(transfer_id.to_string()))?;
        if existing.disputed {
            return Err(ReconcileError::AlreadyDisputed(transfer_id.to_string()));
        }

        let receipt = self.ledger.raise_dispute(transfer_id).await?;
        info!("dispute raised on ledger for transfer {}", transfer_id);

        let mut projection = projection_from_ledger(transfer_id, &existing);
        projection.is_disputed = true;
        let (mirrored, mirror_synced) = self
            .mirror_transfer(
                transfer_id,
                TransferPatch::from_projection(&projection),
                receipt.sequence,
            )
            .await;
        Ok(OpOutcome {
            value: mirrored.unwrap_or(projection),
            mirror_synced,
        })
    }

    pub async fn get_transfer(
        &self,
        transfer_id: &str,
    ) -> Result<Option<TransferProjection>, ReconcileError> {
        self.cache.get_transfer(transfer_id).await
    }

    // ---- rates ----------------------------------------------------------

    pub async fn get_rate(
        &self,
        currency: &str,
    ) -> Result<crate::rates::RateQuote, ReconcileError> {
        crate::rates::get_rate(self.ledger.as_ref(), currency).await
    }

    // ---- listings -------------------------------------------------------

    pub async fn list_pending(&self) -> Result<Vec<UserDetail>, ReconcileError> {
        let addresses = self.ledger.pending_users().await?;
        self.join_details(addresses, false).await
    }

    pub async fn list_approved(&self) -> Result<Vec<UserDetail>, ReconcileError> {
        let addresses = self.ledger.approved_users().await?;
        self.join_details(addresses, true).await
    }

    /// Join the ledger's authoritative address list with cache detail,
    /// falling back to a direct ledger lookup. Detail that neither side
    /// holds stays `None`; unknown is never silently turned into "".
    async fn join_details(
        &self,
        addresses: Vec<String>,
        approved_default: bool,
    ) -> Result<Vec<UserDetail>, ReconcileError> {
        let mut details = Vec::with_capacity(addresses.len());
        for address in addresses {
            let key = normalize_address(&address);
            if let Some(user) = self.cache.get_user(&key).await? {
                details.push(UserDetail {
                    address: key,
                    name: user.name,
                    email: user.email,
                    kyc_approved: user.kyc_approved,
                    source: DetailSource::Cache,
                });
                continue;
            }
            match self.ledger.user_info(&key).await? {
                Some(info) => details.push(UserDetail {
                    address: key,
                    name: Some(info.name),
                    email: Some(info.email),
                    kyc_approved: info.approved,
                    source: DetailSource::Ledger,
                }),
                None => details.push(UserDetail {
                    address: key,
                    name: None,
                    email: None,
                    kyc_approved: approved_default,
                    source: DetailSource::Unknown,
                }),
            }
        }
        Ok(details)
    }
}

fn projection_from_ledger(transfer_id: &str, t: &LedgerTransfer) -> TransferProjection {
    TransferProjection {
        transfer_id: transfer_id.to_string(),
        sender: normalize_address(&t.sender),
        receiver: normalize_address(&t.receiver),
        amount: t.amount,
        currency: t.currency.clone(),
        timestamp: t.timestamp,
        is_disputed: t.disputed,
    }
}

/// Removes the id from the in-flight set when the operation finishes,
/// including on early error returns.
struct InflightGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    id: String,
}

impl<'a> InflightGuard<'a> {
    fn acquire(set: &'a Mutex<HashSet<String>>, id: &str) -> Option<Self> {
        let mut held = set.lock().unwrap();
        if !held.insert(id.to_string()) {
            return None;
        }
        Some(Self {
            set,
            id: id.to_string(),
        })
    }
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.set.lock().unwrap().remove(&self.id);
    }
}

#[cfg(test)]
#[path = "reconciler_tests.rs"]
mod reconciler_tests;
