//! Synced repositories - write-through facade over the local store
//!
//! Every write lands in the local store (read-your-writes) and is queued on
//! the kind's flush scheduler in the same step. Without a scheduler (signed
//! out) the repository is purely local.
//!
//! The scheduler is looked up on every write, so a repository handle kept
//! across logout and login follows whichever session is current.

use super::flush::FlushScheduler;
use super::models::{next_write_timestamp, normalize_timestamp, SyncRecord};
use super::records::{make_vocab_id, BookVocabularyEntry};
use super::store::{LocalStore, StoreError};
use std::sync::Arc;

/// Supplies the flush scheduler a write should go to, if any
pub trait SchedulerSource<R: SyncRecord>: Send + Sync {
    fn current(&self) -> Option<FlushScheduler<R>>;
}

impl<R: SyncRecord> SchedulerSource<R> for FlushScheduler<R> {
    fn current(&self) -> Option<FlushScheduler<R>> {
        Some(self.clone())
    }
}

pub struct SyncedRepo<R: SyncRecord> {
    store: Arc<dyn LocalStore<R>>,
    sync: Option<Arc<dyn SchedulerSource<R>>>,
}

impl<R: SyncRecord> Clone for SyncedRepo<R> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            sync: self.sync.clone(),
        }
    }
}

impl<R: SyncRecord> SyncedRepo<R> {
    /// Repository bound to one fixed scheduler
    pub fn new(store: Arc<dyn LocalStore<R>>, sync: FlushScheduler<R>) -> Self {
        Self::with_source(store, Arc::new(sync))
    }

    /// Repository that resolves its scheduler from `source` on each write
    pub fn with_source(store: Arc<dyn LocalStore<R>>, source: Arc<dyn SchedulerSource<R>>) -> Self {
        Self {
            store,
            sync: Some(source),
        }
    }

    pub fn local_only(store: Arc<dyn LocalStore<R>>) -> Self {
        Self { store, sync: None }
    }

    /// Scheduler that a write made now would be queued on
    pub fn scheduler(&self) -> Option<FlushScheduler<R>> {
        self.sync.as_ref().and_then(|source| source.current())
    }

    pub fn get(&self, id: &str) -> Result<Option<R>, StoreError> {
        self.store.get(id)
    }

    pub fn list(&self, scope: &str) -> Result<Vec<R>, StoreError> {
        self.store.list_by_owner(scope)
    }

    pub fn list_all(&self) -> Result<Vec<R>, StoreError> {
        self.store.list_all()
    }

    /// Write a record stamped now (never earlier than its previous stamp)
    pub fn upsert(&self, record: R) -> Result<R, StoreError> {
        self.write(record, None)
    }

    /// Write a record with an explicit `updated_at`
    pub fn upsert_with_timestamp(&self, record: R, updated_at: &str) -> Result<R, StoreError> {
        self.write(record, Some(updated_at))
    }

    pub fn upsert_many(&self, records: Vec<R>) -> Result<Vec<R>, StoreError> {
        records.into_iter().map(|record| self.upsert(record)).collect()
    }

    /// Remove locally and record a delete intent. Returns whether a local
    /// record existed.
    pub fn delete(&self, id: &str) -> Result<bool, StoreError> {
        match self.scheduler() {
            Some(sync) => sync.remove_and_enqueue(id),
            None => self.store.delete(id),
        }
    }

    fn write(&self, mut record: R, explicit: Option<&str>) -> Result<R, StoreError> {
        let previous = self.store.get(record.id())?;

        let stamp = match explicit {
            Some(raw) => normalize_timestamp(raw).unwrap_or_else(|| raw.to_string()),
            None => next_write_timestamp(previous.as_ref().map(|p| p.updated_at())),
        };
        let created_at = previous
            .as_ref()
            .map(|p| p.created_at().to_string())
            .filter(|c| !c.is_empty())
            .or_else(|| Some(record.created_at().to_string()).filter(|c| !c.is_empty()))
            .unwrap_or_else(|| stamp.clone());

        record.set_updated_at(stamp);
        record.set_created_at(created_at);

        match self.scheduler() {
            Some(sync) => sync.put_and_enqueue(record),
            None => self.store.put(record),
        }
    }
}

impl SyncedRepo<BookVocabularyEntry> {
    pub fn get_word(&self, book_id: &str, word: &str) -> Result<Option<BookVocabularyEntry>, StoreError> {
        self.get(&make_vocab_id(book_id, word))
    }

    pub fn delete_word(&self, book_id: &str, word: &str) -> Result<bool, StoreError> {
        self.delete(&make_vocab_id(book_id, word))
    }
}

// ============================================================================
// Tests
// ============================================================================
