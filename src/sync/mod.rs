//! Sync Module - Local-First Synchronization
//!
//! Keeps three record kinds in sync with a row-oriented backend:
//! - Book vocabulary (per-book word notes)
//! - Global vocabulary (cross-book spaced-repetition cards)
//! - Reading progress (per book)
//!
//! Architecture:
//! - Read-your-writes: every edit lands in the local store first
//! - Per-kind pending queues with persisted tombstones for deletes
//! - Debounced, single-flight flushes with exponential backoff
//! - Last-write-wins on `updated_at`, for delta pulls and realtime pushes alike

pub mod api;
pub mod context;
pub mod flush;
pub mod ledger;
pub mod manager;
pub mod models;
pub mod network;
pub mod queue;
pub mod realtime;
pub mod reconcile;
pub mod records;
pub mod repo;
pub mod scheduler;
pub mod srs;
pub mod status;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;


use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a std mutex, recovering the data if a previous holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// Re-export commonly used types
pub use api::{ChangeEvent, ChangeStream, RemoteChange, RemoteClient, RestRemoteClient, SyncApiError};
pub use context::{CloudContext, CloudContextResolver, Unavailable};
pub use flush::{FlushError, FlushOptions, FlushOutcome, FlushPhase, FlushReport, FlushScheduler, FlushTrigger};
pub use ledger::{ledger_key, TombstoneLedger, Tombstones};
pub use manager::{
    last_sync_key, ErasureReport, ErasureStep, SyncManager, SyncManagerError, SyncOutcome, SyncReport,
};
pub use models::{
    format_timestamp, normalize_timestamp, normalize_word, now_timestamp, EntityKind, RemoteConfig,
    RowError, SyncConfig, SyncRecord,
};
pub use network::NetworkMonitor;
pub use queue::{PendingQueue, QueueStats, RetryBackoff};
pub use reconcile::{MergeDecision, MergeOutcome, MergeStats};
pub use records::{
    make_global_id, make_vocab_id, BookMetadata, BookVocabularyEntry, GlobalVocabularyEntry,
    ReadingProgress,
};
pub use repo::{SchedulerSource, SyncedRepo};
pub use scheduler::{BackgroundScheduler, SchedulerConfig, SchedulerError};
pub use srs::{CardScheduler, CardState, GlobalVocabService, IntervalPreview, Rating};
pub use status::{StatusReporter, SyncState, SyncStatus};
pub use store::{LocalStore, SqliteStore, StoreError};
