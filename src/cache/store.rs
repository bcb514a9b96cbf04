//! Cache store contract
//!
//! The cache is the only mutable shared resource in the layer; both the
//! reconciliation service and the event projector write through this
//! trait. The sole concurrency requirement is that upserts are atomic per
//! key (no lost updates under concurrent upserts to the same key).

use async_trait::async_trait;

use crate::models::{
    EventKind, ReconcileError, TransferPatch, TransferProjection, UserPatch, UserProjection,
};

#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get_user(&self, address: &str) -> Result<Option<UserProjection>, ReconcileError>;

    /// Merge `patch` into the projection for `address`, creating it (with
    /// untouched fields defaulted) when absent. Returns the merged result.
    async fn upsert_user(
        &self,
        address: &str,
        patch: UserPatch,
    ) -> Result<UserProjection, ReconcileError>;

    async fn list_users(&self) -> Result<Vec<UserProjection>, ReconcileError>;

    async fn get_transfer(
        &self,
        transfer_id: &str,
    ) -> Result<Option<TransferProjection>, ReconcileError>;

    async fn upsert_transfer(
        &self,
        transfer_id: &str,
        patch: TransferPatch,
    ) -> Result<TransferProjection, ReconcileError>;

    /// Highest ledger sequence whose events have been durably applied.
    async fn watermark(&self) -> Result<u64, ReconcileError>;

    async fn set_watermark(&self, sequence: u64) -> Result<(), ReconcileError>;

    /// Highest sequence applied for one (event kind, primary key) pair;
    /// 0 when nothing has been applied yet.
    async fn applied_sequence(&self, kind: EventKind, key: &str) -> Result<u64, ReconcileError>;

    async fn set_applied_sequence(
        &self,
        kind: EventKind,
        key: &str,
        sequence: u64,
    ) -> Result<(), ReconcileError>;
}
