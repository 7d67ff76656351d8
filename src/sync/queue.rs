//! Pending Mutation Queues - per-kind upsert snapshots and tombstones
//!
//! Each entity kind keeps two maps per signed-in user:
//! - pending upserts: id -> latest record snapshot (memory only)
//! - pending deletes: id -> deletedAt (persisted through the tombstone ledger)
//!
//! An id lives in at most one of the two maps; enqueueing one clears the other.
//! The ledger is loaded lazily the first time any queue operation needs it.

use super::ledger::{ledger_key, TombstoneLedger, Tombstones};
use super::models::{now_timestamp, SyncRecord};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

// ============================================================================
// Retry Backoff
// ============================================================================

/// Exponential retry delay: base, 2x base, 4x base, ... capped at `max`.
/// A success resets it to `base`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBackoff {
    base: Duration,
    max: Duration,
    failures: u32,
}

impl RetryBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            failures: 0,
        }
    }

    /// Delay the next retry will wait
    pub fn current(&self) -> Duration {
        let factor = 2u32.saturating_pow(self.failures.min(31));
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Record a failure; returns the delay to wait before retrying
    pub fn on_failure(&mut self) -> Duration {
        let delay = self.current();
        self.failures = self.failures.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

// ============================================================================
// Data Types
// ============================================================================

/// Queue statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending_upserts: usize,
    pub pending_deletes: usize,
}

impl QueueStats {
    pub fn total(&self) -> usize {
        self.pending_upserts + self.pending_deletes
    }
}

// ============================================================================
// Pending Queue
// ============================================================================

/// Pending work for one (kind, user)
pub struct PendingQueue<R: SyncRecord> {
    ledger: TombstoneLedger,
    user_id: String,
    loaded_for_user_id: Option<String>,
    upserts: HashMap<String, R>,
    deletes: Tombstones,
}

impl<R: SyncRecord> PendingQueue<R> {
    pub fn new(ledger: TombstoneLedger, user_id: impl Into<String>) -> Self {
        Self {
            ledger,
            user_id: user_id.into(),
            loaded_for_user_id: None,
            upserts: HashMap::new(),
            deletes: Tombstones::new(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    fn storage_key(&self) -> String {
        ledger_key(R::KIND, &self.user_id)
    }

    /// Load persisted tombstones once per user. Upserts queued before the
    /// load are newer intents and win over a persisted tombstone.
    fn ensure_loaded(&mut self) {
        if self.loaded_for_user_id.as_deref() == Some(self.user_id.as_str()) {
            return;
        }

        let persisted = self.ledger.load(&self.storage_key());
        if !persisted.is_empty() {
            log::info!(
                "Loaded {} pending {} deletes for user {}",
                persisted.len(),
                R::KIND,
                self.user_id
            );
        }
        for (id, deleted_at) in persisted {
            if !self.upserts.contains_key(&id) {
                self.deletes.entry(id).or_insert(deleted_at);
            }
        }
        self.loaded_for_user_id = Some(self.user_id.clone());
    }

    /// Write the tombstones back. A failed write keeps the in-memory intent;
    /// local edits are never blocked on the ledger.
    fn persist(&self) {
        if let Err(e) = self.ledger.save(&self.storage_key(), &self.deletes) {
            log::error!("Failed to persist pending {} deletes: {}", R::KIND, e);
        }
    }

    /// Queue the latest snapshot of a record, replacing any tombstone for it
    pub fn enqueue_upsert(&mut self, record: R) {
        self.ensure_loaded();

        let id = record.id().to_string();
        if self.deletes.remove(&id).is_some() {
            self.persist();
        }
        log::debug!("Queued {} upsert {}", R::KIND, id);
        self.upserts.insert(id, record);
    }

    /// Record a delete intent. The ledger is persisted before returning.
    pub fn enqueue_delete(&mut self, id: &str, deleted_at: Option<String>) {
        self.ensure_loaded();

        let deleted_at = deleted_at.unwrap_or_else(now_timestamp);
        self.upserts.remove(id);
        log::debug!("Queued {} delete {} at {}", R::KIND, id, deleted_at);
        self.deletes.insert(id.to_string(), deleted_at);
        self.persist();
    }

    /// Snapshot of queued upserts, ordered by id
    pub fn pending_upserts(&mut self) -> Vec<R> {
        self.ensure_loaded();

        let mut records: Vec<R> = self.upserts.values().cloned().collect();
        records.sort_by(|a, b| a.id().cmp(b.id()));
        records
    }

    /// Snapshot of tombstones as (id, deletedAt), ordered by id
    pub fn pending_deletes(&mut self) -> Vec<(String, String)> {
        self.ensure_loaded();

        self.deletes
            .iter()
            .map(|(id, deleted_at)| (id.clone(), deleted_at.clone()))
            .collect()
    }

    pub fn pending_upsert(&mut self, id: &str) -> Option<&R> {
        self.ensure_loaded();
        self.upserts.get(id)
    }

    pub fn has_pending_upsert(&mut self, id: &str) -> bool {
        self.pending_upsert(id).is_some()
    }

    pub fn tombstone(&mut self, id: &str) -> Option<String> {
        self.ensure_loaded();
        self.deletes.get(id).cloned()
    }

    /// Clear tombstones the flush resolved. Entries whose tombstone changed
    /// (re-deleted or replaced by an upsert) while the flush ran are kept.
    pub fn clear_deletes(&mut self, resolved: &[(String, String)]) -> usize {
        self.ensure_loaded();

        let mut cleared = 0;
        for (id, deleted_at) in resolved {
            if self.deletes.get(id) == Some(deleted_at) {
                self.deletes.remove(id);
                cleared += 1;
            }
        }
        if cleared > 0 {
            self.persist();
        }
        cleared
    }

    /// Drop a tombstone because a newer remote edit won. Returns the dropped
    /// deletedAt.
    pub fn drop_tombstone(&mut self, id: &str) -> Option<String> {
        self.ensure_loaded();

        let dropped = self.deletes.remove(id);
        if dropped.is_some() {
            self.persist();
        }
        dropped
    }

    /// Clear upserts that were sent, unless a newer snapshot was queued while
    /// the request was in flight. Returns how many were retained.
    pub fn clear_upserts_if_not_superseded(&mut self, sent: &[R]) -> usize {
        self.ensure_loaded();

        let mut retained = 0;
        for record in sent {
            let superseded = match self.upserts.get(record.id()) {
                Some(queued) => queued.updated_at() > record.updated_at(),
                None => continue,
            };
            if superseded {
                retained += 1;
            } else {
                self.upserts.remove(record.id());
            }
        }
        retained
    }

    /// Drop a queued upsert made obsolete by an adopted remote row stamped
    /// `remote_updated_at`. Newer local snapshots stay queued.
    pub fn discard_upsert_if_not_newer(&mut self, id: &str, remote_updated_at: &str) -> bool {
        self.ensure_loaded();

        let obsolete = self
            .upserts
            .get(id)
            .map_or(false, |queued| queued.updated_at() <= remote_updated_at);
        if obsolete {
            self.upserts.remove(id);
        }
        obsolete
    }

    pub fn stats(&mut self) -> QueueStats {
        self.ensure_loaded();
        QueueStats {
            pending_upserts: self.upserts.len(),
            pending_deletes: self.deletes.len(),
        }
    }

    pub fn is_empty(&mut self) -> bool {
        self.stats().total() == 0
    }
}

// ============================================================================
// Tests
// ============================================================================
