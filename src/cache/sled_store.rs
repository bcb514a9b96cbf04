//! Sled-backed cache store
//!
//! Three trees: `users` and `transfers` hold JSON projection documents,
//! `meta` holds the projector watermark and per-(kind, key) applied
//! sequences as big-endian u64. Merges run through a compare-and-swap
//! loop so concurrent upserts to the same key never lose fields.

use std::convert::TryInto;

use async_trait::async_trait;
use sled::{Db, Tree};

use crate::cache::store::CacheStore;
use crate::models::{
    normalize_address, EventKind, ReconcileError, TransferPatch, TransferProjection, UserPatch,
    UserProjection,
};

const WATERMARK_KEY: &str = "projector::watermark";

pub struct SledCacheStore {
    db: Db,
    users: Tree,
    transfers: Tree,
    meta: Tree,
}

fn cache_err<E: std::fmt::Display>(err: E) -> ReconcileError {
    ReconcileError::CacheUnavailable(err.to_string())
}

impl SledCacheStore {
    pub fn open(path: &str) -> Result<Self, ReconcileError> {
        let db = sled::open(path).map_err(cache_err)?;
        Self::from_db(db)
    }

    /// In-memory store for tests; nothing touches the filesystem.
    pub fn temporary() -> Result<Self, ReconcileError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(cache_err)?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> Result<Self, ReconcileError> {
        let users = db.open_tree("users").map_err(cache_err)?;
        let transfers = db.open_tree("transfers").map_err(cache_err)?;
        let meta = db.open_tree("meta").map_err(cache_err)?;
        Ok(Self {
            db,
            users,
            transfers,
            meta,
        })
    }

    fn get_u64(&self, key: &str) -> Result<u64, ReconcileError> {
        match self.meta.get(key.as_bytes()).map_err(cache_err)? {
            Some(value) => Ok(u64::from_be_bytes(
                value.as_ref().try_into().unwrap_or([0; 8]),
            )),
            None => Ok(0),
        }
    }

    fn put_u64(&self, key: &str, value: u64) -> Result<(), ReconcileError> {
        self.meta
            .insert(key.as_bytes(), &value.to_be_bytes())
            .map_err(cache_err)?;
        Ok(())
    }

    fn seq_key(kind: EventKind, key: &str) -> String {
        format!("seq::{}::{}", kind.as_str(), key)
    }
}

#[async_trait]
impl CacheStore for SledCacheStore {
    async fn get_user(&self, address: &str) -> Result<Option<UserProjection>, ReconcileError> {
        let key = normalize_address(address);
        match self.users.get(key.as_bytes()).map_err(cache_err)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(cache_err)?)),
            None => Ok(None),
        }
    }

    async fn upsert_user(
        &self,
        address: &str,
        patch: UserPatch,
    ) -> Result<UserProjection, ReconcileError> {
        let key = normalize_address(address);
        loop {
            let current = self.users.get(key.as_bytes()).map_err(cache_err)?;
            let mut projection = match &current {
                Some(bytes) => serde_json::from_slice(bytes).map_err(cache_err)?,
                None => UserProjection::stub(&key),
            };
            patch.apply_to(&mut projection);
            let encoded = serde_json::to_vec(&projection).map_err(cache_err)?;
            let swap = self
                .users
                .compare_and_swap(key.as_bytes(), current, Some(encoded))
                .map_err(cache_err)?;
            if swap.is_ok() {
                self.db.flush_async().await.map_err(cache_err)?;
                return Ok(projection);
            }
            // Lost the race; merge against the winner's value.
        }
    }

    async fn list_users(&self) -> Result<Vec<UserProjection>, ReconcileError> {
        let mut users = Vec::new();
        for entry in self.users.iter() {
            let (_, bytes) = entry.map_err(cache_err)?;
            users.push(serde_json::from_slice(&bytes).map_err(cache_err)?);
        }
        Ok(users)
    }

    async fn get_transfer(
        &self,
        transfer_id: &str,
    ) -> Result<Option<TransferProjection>, ReconcileError> {
        match self.transfers.get(transfer_id.as_bytes()).map_err(cache_err)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(cache_err)?)),
            None => Ok(None),
        }
    }

    async fn upsert_transfer(
        &self,
        transfer_id: &str,
        patch: TransferPatch,
    ) -> Result<TransferProjection, ReconcileError> {
        loop {
            let current = self.transfers.get(transfer_id.as_bytes()).map_err(cache_err)?;
            let mut projection = match &current {
                Some(bytes) => serde_json::from_slice(bytes).map_err(cache_err)?,
                None => TransferProjection {
                    transfer_id: transfer_id.to_string(),
                    sender: String::new(),
                    receiver: String::new(),
                    amount: 0,
                    currency: String::new(),
                    timestamp: 0,
                    is_disputed: false,
                },
            };
            patch.apply_to(&mut projection);
            let encoded = serde_json::to_vec(&projection).map_err(cache_err)?;
            let swap = self
                .transfers
                .compare_and_swap(transfer_id.as_bytes(), current, Some(encoded))
                .map_err(cache_err)?;
            if swap.is_ok() {
                self.db.flush_async().await.map_err(cache_err)?;
                return Ok(projection);
            }
        }
    }

    async fn watermark(&self) -> Result<u64, ReconcileError> {
        self.get_u64(WATERMARK_KEY)
    }

    async fn set_watermark(&self, sequence: u64) -> Result<(), ReconcileError> {
        self.put_u64(WATERMARK_KEY, sequence)?;
        self.db.flush_async().await.map_err(cache_err)?;
        Ok(())
    }

    async fn applied_sequence(&self, kind: EventKind, key: &str) -> Result<u64, ReconcileError> {
        self.get_u64(&Self::seq_key(kind, key))
    }

    async fn set_applied_sequence(
        &self,
        kind: EventKind,
        key: &str,
        sequence: u64,
    ) -> Result<(), ReconcileError> {
        self.put_u64(&Self::seq_key(kind, key), sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upsert_creates_then_merges() {
        let store = SledCacheStore::temporary().unwrap();

        let created = store
            .upsert_user(
                "0xAAA",
                UserPatch {
                    name: Some("Alice".to_string()),
                    email: Some("alice@x.io".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(created.address, "0xaaa");
        assert!(!created.kyc_approved);

        // A later patch touching only the KYC flags keeps name/email.
        let merged = store
            .upsert_user(
                "0xaaa",
                UserPatch {
                    kyc_approved: Some(true),
                    kyc_requested: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(merged.name.as_deref(), Some("Alice"));
        assert!(merged.kyc_approved);

        let fetched = store.get_user("0xAaA").await.unwrap().unwrap();
        assert_eq!(fetched, merged);
    }

    #[tokio::test]
    async fn test_watermark_and_applied_sequences() {
        let store = SledCacheStore::temporary().unwrap();
        assert_eq!(store.watermark().await.unwrap(), 0);

        store.set_watermark(42).await.unwrap();
        assert_eq!(store.watermark().await.unwrap(), 42);

        assert_eq!(
            store
                .applied_sequence(EventKind::KycApproved, "0xaaa")
                .await
                .unwrap(),
            0
        );
        store
            .set_applied_sequence(EventKind::KycApproved, "0xaaa", 7)
            .await
            .unwrap();
        assert_eq!(
            store
                .applied_sequence(EventKind::KycApproved, "0xaaa")
                .await
                .unwrap(),
            7
        );
        // Kinds are tracked independently for the same key.
        assert_eq!(
            store
                .applied_sequence(EventKind::KycRevoked, "0xaaa")
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_concurrent_upserts_same_key_lose_nothing() {
        use std::sync::Arc;

        let store = Arc::new(SledCacheStore::temporary().unwrap());
        let a = store.clone();
        let b = store.clone();

        let t1 = tokio::spawn(async move {
            a.upsert_user(
                "0xccc",
                UserPatch {
                    name: Some("Carol".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        });
        let t2 = tokio::spawn(async move {
            b.upsert_user(
                "0xccc",
                UserPatch {
                    kyc_requested: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        });
        t1.await.unwrap();
        t2.await.unwrap();

        let user = store.get_user("0xccc").await.unwrap().unwrap();
        assert_eq!(user.name.as_deref(), Some("Carol"));
        assert!(user.kyc_requested);
    }

    #[tokio::test]
    async fn test_transfer_upsert_roundtrip() {
        let store = SledCacheStore::temporary().unwrap();
        let patch = TransferPatch {
            sender: Some("0xaaa".to_string()),
            receiver: Some("0xbbb".to_string()),
            amount: Some(1000),
            currency: Some("ETH".to_string()),
            timestamp: Some(1_700_000_000),
            is_disputed: Some(false),
        };
        store.upsert_transfer("TX_1", patch).await.unwrap();

        let transfer = store.get_transfer("TX_1").await.unwrap().unwrap();
        assert_eq!(transfer.amount, 1000);
        assert_eq!(transfer.sender, "0xaaa");
        assert!(store.get_transfer("TX_2").await.unwrap().is_none());
    }
}
