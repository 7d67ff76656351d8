//! Reconciler - last-write-wins merge of remote rows
//!
//! One rule for delta pulls and realtime pushes alike: adopt the remote value
//! iff its `updated_at` is strictly newer than the local record's, or there is
//! no local record. Ties keep local. A strictly newer local record is queued so
//! the remote catches up on the next flush.
//!
//! A pending tombstone is an edit whose payload is "absent" and is compared on
//! the same timeline.

use super::models::SyncRecord;
use super::queue::PendingQueue;
use super::store::{LocalStore, StoreError};

/// What the timestamp comparison says to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeDecision {
    AdoptRemote,
    /// Equal timestamps, nothing to do
    KeepLocal,
    /// Local is strictly newer; the remote must catch up
    PushLocal,
}

/// Compare a local stamp (if any) against a remote one
pub fn decide(local: Option<&str>, remote: &str) -> MergeDecision {
    match local {
        None => MergeDecision::AdoptRemote,
        Some(local) if remote > local => MergeDecision::AdoptRemote,
        Some(local) if local > remote => MergeDecision::PushLocal,
        Some(_) => MergeDecision::KeepLocal,
    }
}

/// A tombstone at `deleted_at` may delete the remote row iff the remote is
/// absent or not newer than the tombstone
pub fn tombstone_allows_delete(deleted_at: &str, remote_updated_at: Option<&str>) -> bool {
    remote_updated_at.map_or(true, |remote| remote <= deleted_at)
}

/// What a merge did to local state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Remote row written to the local store
    Adopted,
    /// Local record unchanged
    KeptLocal,
    /// Local record queued for upsert
    PushedLocal,
    /// Tombstone dropped, remote row restored locally
    Undeleted,
    /// Pending delete still wins; the flush deletes the remote row
    TombstoneKept,
    /// Local record removed after a remote delete
    Removed,
}

impl MergeOutcome {
    /// Whether the merge left new pending work in the queue
    pub fn needs_flush(&self) -> bool {
        matches!(self, Self::PushedLocal)
    }

    /// Whether the local store was written
    pub fn changed_local(&self) -> bool {
        matches!(self, Self::Adopted | Self::Undeleted | Self::Removed)
    }
}

/// Per-outcome counters for a batch of merges
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub adopted: usize,
    pub kept: usize,
    pub pushed: usize,
    pub undeleted: usize,
    pub removed: usize,
    /// Rows that could not be mapped to a record
    pub skipped: usize,
}

impl MergeStats {
    pub fn record(&mut self, outcome: MergeOutcome) {
        match outcome {
            MergeOutcome::Adopted => self.adopted += 1,
            MergeOutcome::KeptLocal | MergeOutcome::TombstoneKept => self.kept += 1,
            MergeOutcome::PushedLocal => self.pushed += 1,
            MergeOutcome::Undeleted => self.undeleted += 1,
            MergeOutcome::Removed => self.removed += 1,
        }
    }

    /// Local records written by the batch
    pub fn changed(&self) -> usize {
        self.adopted + self.undeleted + self.removed
    }

    pub fn merge(&mut self, other: MergeStats) {
        self.adopted += other.adopted;
        self.kept += other.kept;
        self.pushed += other.pushed;
        self.undeleted += other.undeleted;
        self.removed += other.removed;
        self.skipped += other.skipped;
    }
}

/// Merge one remote record into local state
pub fn merge_remote<R, S>(
    store: &S,
    queue: &mut PendingQueue<R>,
    remote: R,
) -> Result<MergeOutcome, StoreError>
where
    R: SyncRecord,
    S: LocalStore<R> + ?Sized,
{
    let id = remote.id().to_string();

    if let Some(deleted_at) = queue.tombstone(&id) {
        if tombstone_allows_delete(&deleted_at, Some(remote.updated_at())) {
            return Ok(MergeOutcome::TombstoneKept);
        }

        log::info!(
            "Remote {} {} edited at {} after local delete at {}, restoring",
            R::KIND,
            id,
            remote.updated_at(),
            deleted_at
        );
        queue.drop_tombstone(&id);
        store.put(remote)?;
        return Ok(MergeOutcome::Undeleted);
    }

    let local = store.get(&id)?;
    match decide(local.as_ref().map(|r| r.updated_at()), remote.updated_at()) {
        MergeDecision::AdoptRemote => {
            let remote_updated_at = remote.updated_at().to_string();
            store.put(remote)?;
            queue.discard_upsert_if_not_newer(&id, &remote_updated_at);
            Ok(MergeOutcome::Adopted)
        }
        MergeDecision::KeepLocal => Ok(MergeOutcome::KeptLocal),
        MergeDecision::PushLocal => match local {
            Some(local) => {
                log::debug!("Local {} {} is newer than remote, queueing push", R::KIND, id);
                queue.enqueue_upsert(local);
                Ok(MergeOutcome::PushedLocal)
            }
            None => Ok(MergeOutcome::KeptLocal),
        },
    }
}

/// Apply a remote delete. A pending local upsert means a newer local edit
/// exists and will recreate the remote row, so it wins.
pub fn apply_remote_delete<R, S>(
    store: &S,
    queue: &mut PendingQueue<R>,
    id: &str,
) -> Result<MergeOutcome, StoreError>
where
    R: SyncRecord,
    S: LocalStore<R> + ?Sized,
{
    if queue.has_pending_upsert(id) {
        log::debug!("Ignoring remote delete of {} {}: local edit pending", R::KIND, id);
        return Ok(MergeOutcome::KeptLocal);
    }

    // Remote is already absent; nothing left for the flush to do
    queue.drop_tombstone(id);

    if store.delete(id)? {
        Ok(MergeOutcome::Removed)
    } else {
        Ok(MergeOutcome::KeptLocal)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::sync::ledger::TombstoneLedger;
    use crate::sync::records::GlobalVocabularyEntry;
    use crate::sync::store::SqliteStore;
    use std::sync::Arc;

    const T1: &str = "2024-01-01T00:00:00.000Z";
    const T2: &str = "2024-01-02T00:00:00.000Z";

    fn setup() -> (SqliteStore, PendingQueue<GlobalVocabularyEntry>) {
        let db = Arc::new(Database::in_memory().unwrap());
        let queue = PendingQueue::new(TombstoneLedger::new(db.clone()), "u1");
        (SqliteStore::new(db), queue)
    }

    fn card(updated_at: &str, meaning: Option<&str>) -> GlobalVocabularyEntry {
        let mut entry = GlobalVocabularyEntry::new("en", "cat");
        entry.updated_at = updated_at.to_string();
        entry.created_at = T1.to_string();
        entry.meaning = meaning.map(str::to_string);
        entry
    }

    fn local(store: &SqliteStore) -> Option<GlobalVocabularyEntry> {
        store.get("en:cat").unwrap()
    }

    #[test]
    fn test_decide_is_strict_last_write_wins() {
        assert_eq!(decide(None, T1), MergeDecision::AdoptRemote);
        assert_eq!(decide(Some(T1), T2), MergeDecision::AdoptRemote);
        assert_eq!(decide(Some(T2), T1), MergeDecision::PushLocal);
        assert_eq!(decide(Some(T1), T1), MergeDecision::KeepLocal);
    }

    #[test]
    fn test_tombstone_against_remote() {
        assert!(tombstone_allows_delete(T2, None));
        assert!(tombstone_allows_delete(T2, Some(T1)));
        assert!(tombstone_allows_delete(T2, Some(T2)));
        assert!(!tombstone_allows_delete(T1, Some(T2)));
    }

    #[test]
    fn test_newer_remote_is_adopted() {
        let (store, mut queue) = setup();
        store.put(card(T1, None)).unwrap();

        let outcome = merge_remote(&store, &mut queue, card(T2, Some("猫"))).unwrap();
        assert_eq!(outcome, MergeOutcome::Adopted);

        let merged = local(&store).unwrap();
        assert_eq!(merged.meaning.as_deref(), Some("猫"));
        assert_eq!(merged.updated_at, T2);
    }

    #[test]
    fn test_older_or_equal_remote_keeps_local() {
        let (store, mut queue) = setup();
        store.put(card(T2, Some("local"))).unwrap();

        let outcome = merge_remote(&store, &mut queue, card(T2, Some("remote"))).unwrap();
        assert_eq!(outcome, MergeOutcome::KeptLocal);
        assert!(queue.is_empty());

        let outcome = merge_remote(&store, &mut queue, card(T1, Some("remote"))).unwrap();
        assert_eq!(outcome, MergeOutcome::PushedLocal);
        assert!(outcome.needs_flush());
        assert_eq!(local(&store).unwrap().meaning.as_deref(), Some("local"));
        assert_eq!(queue.pending_upserts()[0].updated_at, T2);
    }

    #[test]
    fn test_adopting_discards_older_pending_upsert() {
        let (store, mut queue) = setup();
        store.put(card(T1, None)).unwrap();
        queue.enqueue_upsert(card(T1, None));

        merge_remote(&store, &mut queue, card(T2, Some("remote"))).unwrap();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_newer_remote_undeletes() {
        let (store, mut queue) = setup();
        queue.enqueue_delete("en:cat", Some("2024-01-01T10:00:00.000Z".to_string()));

        let pushed = card("2024-01-01T10:05:00.000Z", Some("猫"));
        let outcome = merge_remote(&store, &mut queue, pushed.clone()).unwrap();

        assert_eq!(outcome, MergeOutcome::Undeleted);
        assert!(queue.tombstone("en:cat").is_none());
        assert_eq!(local(&store), Some(pushed));
    }

    #[test]
    fn test_older_remote_keeps_tombstone() {
        let (store, mut queue) = setup();
        queue.enqueue_delete("en:cat", Some("2024-01-01T10:00:00.000Z".to_string()));

        let outcome =
            merge_remote(&store, &mut queue, card("2024-01-01T09:00:00.000Z", None)).unwrap();
        assert_eq!(outcome, MergeOutcome::TombstoneKept);
        assert!(local(&store).is_none());
        assert!(queue.tombstone("en:cat").is_some());
    }

    #[test]
    fn test_merge_is_idempotent() {
        let (store, mut queue) = setup();
        let remote = card(T2, Some("猫"));

        assert!(merge_remote(&store, &mut queue, remote.clone()).unwrap().changed_local());
        let first = local(&store);

        let outcome = merge_remote(&store, &mut queue, remote).unwrap();
        assert!(!outcome.changed_local());
        assert_eq!(local(&store), first);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_remote_delete() {
        let (store, mut queue) = setup();
        store.put(card(T1, None)).unwrap();
        assert_eq!(
            apply_remote_delete(&store, &mut queue, "en:cat").unwrap(),
            MergeOutcome::Removed
        );
        assert!(local(&store).is_none());

        store.put(card(T2, None)).unwrap();
        queue.enqueue_upsert(card(T2, None));
        assert_eq!(
            apply_remote_delete(&store, &mut queue, "en:cat").unwrap(),
            MergeOutcome::KeptLocal
        );
        assert!(local(&store).is_some());
    }
}
