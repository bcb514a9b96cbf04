//! Event Projector
//!
//! Converts each ledger event into exactly one idempotent cache mutation.
//! The watermark advances only after a mutation durably commits, so a
//! restart that resubscribes from an earlier watermark replays events
//! into no-ops instead of regressions.

use std::cmp;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::time::sleep;

use crate::cache::CacheStore;
use crate::ledger::LedgerClient;
use crate::models::{
    EventKind, LedgerEvent, ReconcileError, SequencedEvent, TransferPatch, UserPatch,
};

#[derive(Debug, Clone)]
pub struct ProjectorConfig {
    /// Idle sleep between polls when no events arrive (ms)
    pub poll_interval_ms: u64,
    /// Max events fetched per poll
    pub batch_size: usize,
    /// First cache-write retry delay (ms); doubles up to the cap
    pub retry_backoff_ms: u64,
    pub max_retry_backoff_ms: u64,
}

impl Default for ProjectorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 3000,
            batch_size: 256,
            retry_backoff_ms: 200,
            max_retry_backoff_ms: 10_000,
        }
    }
}

/// Result of applying one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// Mutation committed
    Fresh,
    /// Already applied at this or a higher sequence; no-op
    Stale,
}

pub struct EventProjector {
    ledger: Arc<dyn LedgerClient>,
    cache: Arc<dyn CacheStore>,
    config: ProjectorConfig,
}

impl EventProjector {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        cache: Arc<dyn CacheStore>,
        config: ProjectorConfig,
    ) -> Self {
        Self {
            ledger,
            cache,
            config,
        }
    }

    /// The KYC flag is toggled by two event kinds, so the staleness guard
    /// for user events spans all of them: an old approval replayed after a
    /// newer revocation must not win.
    async fn guard_sequence(&self, event: &LedgerEvent, key: &str) -> Result<u64, ReconcileError> {
        let kinds: &[EventKind] = match event.kind() {
            EventKind::Sent => &[EventKind::Sent],
            _ => &[
                EventKind::UserRegistered,
                EventKind::KycApproved,
                EventKind::KycRevoked,
            ],
        };
        let mut guard = 0;
        for kind in kinds {
            guard = cmp::max(guard, self.cache.applied_sequence(*kind, key).await?);
        }
        Ok(guard)
    }

    /// Apply one event if it is newer than anything already applied for
    /// its key. Idempotent: replays and lower sequences are no-ops.
    pub async fn apply(&self, sequenced: &SequencedEvent) -> Result<Applied, ReconcileError> {
        let event = &sequenced.event;
        let key = event.primary_key();
        let guard = self.guard_sequence(event, &key).await?;
        if sequenced.sequence <= guard {
            debug!(
                "skip {} seq={} for {} (applied up to {})",
                event.kind().as_str(),
                sequenced.sequence,
                key,
                guard
            );
            return Ok(Applied::Stale);
        }

        match event {
            LedgerEvent::UserRegistered { name, email, .. } => {
                self.cache
                    .upsert_user(
                        &key,
                        UserPatch {
                            name: Some(name.clone()),
                            email: Some(email.clone()),
                            kyc_approved: Some(false),
                            kyc_requested: None,
                        },
                    )
                    .await?;
            }
            LedgerEvent::KycApproved { .. } => {
                // Creates a minimal stub when the mirror missed the
                // registration; the ledger is authoritative regardless.
                self.cache
                    .upsert_user(
                        &key,
                        UserPatch {
                            kyc_approved: Some(true),
                            kyc_requested: Some(false),
                            ..Default::default()
                        },
                    )
                    .await?;
            }
            LedgerEvent::KycRevoked { .. } => {
                self.cache
                    .upsert_user(
                        &key,
                        UserPatch {
                            kyc_approved: Some(false),
                            kyc_requested: Some(false),
                            ..Default::default()
                        },
                    )
                    .await?;
            }
            LedgerEvent::Sent {
                transfer_id,
                sender,
                receiver,
                amount,
                currency,
                timestamp,
            } => {
                if let Some(existing) = self.cache.get_transfer(transfer_id).await? {
                    if existing.sender != *sender
                        || existing.receiver != *receiver
                        || existing.amount != *amount
                        || existing.currency != *currency
                    {
                        warn!(
                            "reconciliation anomaly for transfer {}: cache {:?} disagrees with ledger event, ledger values win",
                            transfer_id, existing
                        );
                    }
                }
                self.cache
                    .upsert_transfer(
                        transfer_id,
                        TransferPatch {
                            sender: Some(sender.clone()),
                            receiver: Some(receiver.clone()),
                            amount: Some(*amount),
                            currency: Some(currency.clone()),
                            timestamp: Some(*timestamp),
                            is_disputed: None,
                        },
                    )
                    .await?;
            }
        }

        self.cache
            .set_applied_sequence(event.kind(), &key, sequenced.sequence)
            .await?;
        Ok(Applied::Fresh)
    }

    /// Apply with backoff on cache failures. Never gives up: the event is
    /// already ordered and the watermark must not advance past it.
    async fn apply_with_retry(&self, sequenced: &SequencedEvent) -> Result<Applied, ReconcileError> {
        let mut backoff = self.config.retry_backoff_ms;
        loop {
            match self.apply(sequenced).await {
                Ok(applied) => return Ok(applied),
                Err(ReconcileError::CacheUnavailable(reason)) => {
                    warn!(
                        "cache write failed for seq={} ({}), retrying in {}ms",
                        sequenced.sequence, reason, backoff
                    );
                    sleep(Duration::from_millis(backoff)).await;
                    backoff = cmp::min(backoff * 2, self.config.max_retry_backoff_ms);
                }
                Err(other) => return Err(other),
            }
        }
    }

    /// One poll-and-apply pass. Returns the number of events consumed.
    pub async fn drain(&self) -> Result<usize, ReconcileError> {
        let watermark = self.cache.watermark().await?;
        let events = self
            .ledger
            .events_from(watermark, self.config.batch_size)
            .await?;
        for sequenced in &events {
            self.apply_with_retry(sequenced).await?;
            // Durably applied; safe to never see this event again.
            self.cache.set_watermark(sequenced.sequence).await?;
        }
        if !events.is_empty() {
            debug!(
                "projected {} events, watermark now {}",
                events.len(),
                events.last().map(|e| e.sequence).unwrap_or(watermark)
            );
        }
        Ok(events.len())
    }

    /// Continuous subscription loop. Run as a single background task.
    pub async fn run(&self) {
        info!(
            "event projector starting from watermark {}",
            self.cache.watermark().await.unwrap_or(0)
        );
        loop {
            match self.drain().await {
                Ok(0) => sleep(Duration::from_millis(self.config.poll_interval_ms)).await,
                Ok(_) => {}
                Err(err) => {
                    warn!("projector pass failed: {}, backing off", err);
                    sleep(Duration::from_millis(self.config.max_retry_backoff_ms)).await;
                }
            }
        }
    }
}
