//! Flush Scheduler - drains one kind's pending queue to the remote
//!
//! States: `Idle -> Flushing -> {Idle, BackoffWait -> Idle}`.
//!
//! - Upserts are debounced; deletes flush at delay 0
//! - Single-flight: requests during `Flushing` share the running flush
//! - Deletes run before upserts, both in batches of at most `batch_size` ids
//! - Failures leave the queues intact and retry with exponential backoff
//! - Offline flushes wait for the online-restored signal as well
//!
//! The flush itself runs in a spawned task so that aborting a timer or
//! dropping a caller never interrupts a request in flight.

use super::api::{ChangeEvent, RemoteChange, RemoteClient};
use super::context::{CloudContext, CloudContextResolver, Unavailable};
use super::models::{row_str, row_timestamp, SyncConfig, SyncRecord};
use super::queue::{PendingQueue, QueueStats, RetryBackoff};
use super::reconcile::{self, tombstone_allows_delete, MergeStats};
use super::store::{LocalStore, StoreError};
use super::lock;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

// ============================================================================
// Data Types
// ============================================================================

/// Timing and batching knobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushOptions {
    pub debounce: Duration,
    pub follow_up: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub batch_size: usize,
}

impl From<&SyncConfig> for FlushOptions {
    fn from(config: &SyncConfig) -> Self {
        Self {
            debounce: config.debounce(),
            follow_up: config.follow_up(),
            backoff_base: config.backoff_base(),
            backoff_max: config.backoff_max(),
            batch_size: config.batch_size.max(1),
        }
    }
}

impl Default for FlushOptions {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushPhase {
    Idle,
    Flushing,
    BackoffWait,
}

/// What asked for a flush
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    /// Ordinary upsert; each one restarts a pending debounce timer
    Debounce,
    /// Explicit delete or other user-initiated action
    Immediate,
    /// Backoff retry after a failure
    Retry,
    /// Items remained after a successful pass
    FollowUp,
}

/// Counts for one successful flush
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Tombstones resolved against the remote
    pub deleted: usize,
    /// Tombstones dropped because the remote row was newer
    pub undeleted: usize,
    pub upserted: usize,
    /// Upserts kept queued because they were superseded mid-request
    pub retained: usize,
    /// Queue size after the pass
    pub remaining: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlushError {
    #[error("Remote request failed: {0}")]
    Remote(String),

    #[error("Local store error: {0}")]
    Store(String),

    #[error("Flush task aborted: {0}")]
    Aborted(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    Flushed(FlushReport),
    Skipped(Unavailable),
    Failed(FlushError),
}

impl FlushOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Flushed(_))
    }
}

type SharedFlush = Shared<BoxFuture<'static, FlushOutcome>>;

struct PendingTimer {
    seq: u64,
    trigger: FlushTrigger,
    deadline: Instant,
    handle: JoinHandle<()>,
}

struct SchedulerState {
    phase: FlushPhase,
    in_flight: Option<SharedFlush>,
    timer: Option<PendingTimer>,
    next_seq: u64,
    backoff: RetryBackoff,
    online_listener: Option<JoinHandle<()>>,
    shut_down: bool,
}

struct Inner<R: SyncRecord> {
    user_id: String,
    /// Also serializes reconciler decisions with local writes to the same
    /// ids. Held across local store calls, never across an await.
    queue: Mutex<PendingQueue<R>>,
    store: Arc<dyn LocalStore<R>>,
    remote: Arc<dyn RemoteClient>,
    context: CloudContextResolver,
    options: FlushOptions,
    state: Mutex<SchedulerState>,
}

// ============================================================================
// Flush Scheduler
// ============================================================================

/// Pending-work scheduler for one (kind, user)
pub struct FlushScheduler<R: SyncRecord> {
    inner: Arc<Inner<R>>,
}

impl<R: SyncRecord> Clone for FlushScheduler<R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<R: SyncRecord> FlushScheduler<R> {
    pub fn new(
        queue: PendingQueue<R>,
        store: Arc<dyn LocalStore<R>>,
        remote: Arc<dyn RemoteClient>,
        context: CloudContextResolver,
        options: FlushOptions,
    ) -> Self {
        let state = SchedulerState {
            phase: FlushPhase::Idle,
            in_flight: None,
            timer: None,
            next_seq: 0,
            backoff: RetryBackoff::new(options.backoff_base, options.backoff_max),
            online_listener: None,
            shut_down: false,
        };

        Self {
            inner: Arc::new(Inner {
                user_id: queue.user_id().to_string(),
                queue: Mutex::new(queue),
                store,
                remote,
                context,
                options,
                state: Mutex::new(state),
            }),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.inner.user_id
    }

    pub fn store(&self) -> &Arc<dyn LocalStore<R>> {
        &self.inner.store
    }

    /// Queue a snapshot and schedule a debounced flush
    pub fn enqueue_upsert(&self, record: R) {
        lock(&self.inner.queue).enqueue_upsert(record);
        Inner::schedule(&self.inner, self.inner.options.debounce, FlushTrigger::Debounce);
    }

    /// Record a delete intent (persisted before returning) and flush now
    pub fn enqueue_delete(&self, id: &str, deleted_at: Option<String>) {
        lock(&self.inner.queue).enqueue_delete(id, deleted_at);
        Inner::schedule(&self.inner, Duration::ZERO, FlushTrigger::Immediate);
    }

    /// Write `record` to the local store and queue it in one step, so a
    /// remote merge of the same id sees both or neither
    pub fn put_and_enqueue(&self, record: R) -> Result<R, StoreError> {
        let stored = {
            let mut queue = lock(&self.inner.queue);
            let stored = self.inner.store.put(record)?;
            queue.enqueue_upsert(stored.clone());
            stored
        };
        Inner::schedule(&self.inner, self.inner.options.debounce, FlushTrigger::Debounce);
        Ok(stored)
    }

    /// Remove `id` locally and record its delete intent in one step.
    /// Returns whether a local record existed.
    pub fn remove_and_enqueue(&self, id: &str) -> Result<bool, StoreError> {
        let removed = {
            let mut queue = lock(&self.inner.queue);
            let removed = self.inner.store.delete(id)?;
            queue.enqueue_delete(id, None);
            removed
        };
        Inner::schedule(&self.inner, Duration::ZERO, FlushTrigger::Immediate);
        Ok(removed)
    }

    pub fn schedule_flush(&self, delay: Duration, trigger: FlushTrigger) {
        Inner::schedule(&self.inner, delay, trigger);
    }

    /// Flush immediately, cutting short any debounce or backoff wait. Joins
    /// the running flush when one is in flight.
    pub async fn flush_now(&self) -> FlushOutcome {
        Inner::cancel_wait(&self.inner);
        Inner::start_flush(&self.inner).await
    }

    pub fn phase(&self) -> FlushPhase {
        lock(&self.inner.state).phase
    }

    /// Delay the next failure would wait
    pub fn current_backoff(&self) -> Duration {
        lock(&self.inner.state).backoff.current()
    }

    pub fn stats(&self) -> QueueStats {
        lock(&self.inner.queue).stats()
    }

    pub fn has_pending_upsert(&self, id: &str) -> bool {
        lock(&self.inner.queue).has_pending_upsert(id)
    }

    pub fn tombstone(&self, id: &str) -> Option<String> {
        lock(&self.inner.queue).tombstone(id)
    }

    /// Merge remote rows through the reconciler. Rows that do not map to a
    /// record are skipped with a warning.
    pub fn merge_remote_rows(&self, rows: &[Value]) -> Result<MergeStats, StoreError> {
        let mut stats = MergeStats::default();
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            match R::from_row(row) {
                Ok(record) => records.push(record),
                Err(e) => {
                    log::warn!("Skipping malformed remote {} row: {}", R::KIND, e);
                    stats.skipped += 1;
                }
            }
        }

        // The read-compare-write of each record must not interleave with a
        // local enqueue of the same id
        {
            let mut queue = lock(&self.inner.queue);
            for record in records {
                let outcome = reconcile::merge_remote(&*self.inner.store, &mut queue, record)?;
                stats.record(outcome);
            }
        }

        if stats.pushed > 0 {
            Inner::schedule(&self.inner, self.inner.options.debounce, FlushTrigger::Debounce);
        }
        Ok(stats)
    }

    /// Apply a remote delete of the row keyed in `row`
    pub fn apply_remote_delete(&self, row: &Value) -> Result<MergeStats, StoreError> {
        let mut stats = MergeStats::default();
        let Some(id) = row_str(row, R::KIND.id_column()) else {
            log::warn!("Remote {} delete without a key, ignoring", R::KIND);
            stats.skipped += 1;
            return Ok(stats);
        };

        let mut queue = lock(&self.inner.queue);
        stats.record(reconcile::apply_remote_delete(&*self.inner.store, &mut queue, &id)?);
        Ok(stats)
    }

    /// Apply one realtime change of this kind
    pub fn apply_change(&self, change: &RemoteChange) -> Result<MergeStats, StoreError> {
        match change.event {
            ChangeEvent::Delete => self.apply_remote_delete(&change.row),
            ChangeEvent::Insert | ChangeEvent::Update => {
                self.merge_remote_rows(std::slice::from_ref(&change.row))
            }
        }
    }

    /// Wait for the flush in flight, if any, without starting a new one
    pub async fn settle(&self) {
        let in_flight = lock(&self.inner.state).in_flight.clone();
        if let Some(flush) = in_flight {
            flush.await;
        }
    }

    /// Stop timers and the online listener. A flush already in flight runs
    /// to completion; nothing new is scheduled afterwards.
    pub fn shutdown(&self) {
        let mut state = lock(&self.inner.state);
        state.shut_down = true;
        if let Some(timer) = state.timer.take() {
            timer.handle.abort();
        }
        if let Some(listener) = state.online_listener.take() {
            listener.abort();
        }
        if state.in_flight.is_none() {
            state.phase = FlushPhase::Idle;
        }
    }
}

impl<R: SyncRecord> Inner<R> {
    fn schedule(this: &Arc<Self>, delay: Duration, trigger: FlushTrigger) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            log::warn!("No async runtime, {} flush not scheduled", R::KIND);
            return;
        };

        let mut state = lock(&this.state);
        if state.shut_down {
            return;
        }

        let deadline = Instant::now() + delay;
        match trigger {
            // A backoff wait is only cut short by explicit triggers
            FlushTrigger::Debounce | FlushTrigger::FollowUp
                if state.phase == FlushPhase::BackoffWait && state.timer.is_some() =>
            {
                return;
            }
            FlushTrigger::Retry => {}
            // Trailing edge: a burst of edits flushes once, after the last one
            FlushTrigger::Debounce
                if state.timer.as_ref().map_or(false, |t| t.trigger == FlushTrigger::Debounce) => {}
            _ => {
                if state.timer.as_ref().map_or(false, |t| t.deadline <= deadline) {
                    return;
                }
            }
        }

        if let Some(timer) = state.timer.take() {
            timer.handle.abort();
        }

        state.next_seq += 1;
        let seq = state.next_seq;
        let weak = Arc::downgrade(this);
        let handle = runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(inner) = weak.upgrade() {
                Inner::fire(&inner, seq);
            }
        });

        log::debug!("Scheduled {} flush in {:?} ({:?})", R::KIND, delay, trigger);
        state.timer = Some(PendingTimer {
            seq,
            trigger,
            deadline,
            handle,
        });
    }

    fn fire(this: &Arc<Self>, seq: u64) {
        {
            let mut state = lock(&this.state);
            match &state.timer {
                Some(timer) if timer.seq == seq => state.timer = None,
                _ => return,
            }
        }
        // Work runs in its own task; nobody needs to await the result here
        drop(Inner::start_flush(this));
    }

    /// Abort any pending timer and leave the backoff wait
    fn cancel_wait(this: &Arc<Self>) {
        let mut state = lock(&this.state);
        if let Some(timer) = state.timer.take() {
            timer.handle.abort();
        }
        if state.phase == FlushPhase::BackoffWait {
            state.phase = FlushPhase::Idle;
        }
    }

    /// Start a flush, or join the one in flight
    fn start_flush(this: &Arc<Self>) -> SharedFlush {
        let mut state = lock(&this.state);
        if let Some(in_flight) = &state.in_flight {
            return in_flight.clone();
        }

        state.phase = FlushPhase::Flushing;
        let inner = this.clone();
        let task = tokio::spawn(async move {
            let outcome = inner.run_flush().await;
            Inner::finish(&inner, &outcome);
            outcome
        });

        let shared = async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(e) => FlushOutcome::Failed(FlushError::Aborted(e.to_string())),
            }
        }
        .boxed()
        .shared();

        state.in_flight = Some(shared.clone());
        shared
    }

    async fn run_flush(&self) -> FlushOutcome {
        let ctx = match self.context.resolve().await {
            Ok(ctx) if ctx.user_id == self.user_id => ctx,
            Ok(_) => return FlushOutcome::Skipped(Unavailable::SignedOut),
            Err(reason) => return FlushOutcome::Skipped(reason),
        };

        match self.flush_pass(&ctx).await {
            Ok(report) => {
                if report.deleted + report.upserted + report.undeleted > 0 {
                    log::info!(
                        "Flushed {}: {} deleted, {} undeleted, {} upserted, {} remaining",
                        R::KIND,
                        report.deleted,
                        report.undeleted,
                        report.upserted,
                        report.remaining
                    );
                }
                FlushOutcome::Flushed(report)
            }
            Err(e) => FlushOutcome::Failed(e),
        }
    }

    /// Deletes first, then upserts. Each confirmed chunk is cleared from the
    /// queue as soon as it lands.
    async fn flush_pass(&self, ctx: &CloudContext) -> Result<FlushReport, FlushError> {
        let kind = R::KIND;
        let batch_size = self.options.batch_size.max(1);
        let mut report = FlushReport::default();

        let deletes = lock(&self.queue).pending_deletes();
        for chunk in deletes.chunks(batch_size) {
            let ids: Vec<String> = chunk.iter().map(|(id, _)| id.clone()).collect();
            let rows = self
                .remote
                .select_by_ids(kind, &ctx.user_id, &ids)
                .await
                .map_err(|e| FlushError::Remote(e.to_string()))?;

            let mut remote_rows: HashMap<String, Value> = rows
                .into_iter()
                .filter_map(|row| row_str(&row, kind.id_column()).map(|id| (id, row)))
                .collect();

            let mut deletable = Vec::new();
            let mut newer = Vec::new();
            for (id, deleted_at) in chunk {
                let row = remote_rows.remove(id);
                let remote_updated_at = row.as_ref().and_then(|r| row_timestamp(r, "updated_at"));
                if tombstone_allows_delete(deleted_at, remote_updated_at.as_deref()) {
                    deletable.push((id.clone(), deleted_at.clone()));
                } else if let Some(row) = row {
                    newer.push((id.clone(), deleted_at.clone(), row));
                }
            }

            if !deletable.is_empty() {
                let delete_ids: Vec<String> = deletable.iter().map(|(id, _)| id.clone()).collect();
                self.remote
                    .delete_by_ids(kind, &ctx.user_id, &delete_ids)
                    .await
                    .map_err(|e| FlushError::Remote(e.to_string()))?;
            }

            let mut queue = lock(&self.queue);
            report.deleted += queue.clear_deletes(&deletable);
            for (id, deleted_at, row) in newer {
                // Tombstone changed during the lookup; the next pass decides
                if queue.tombstone(&id).as_deref() != Some(deleted_at.as_str()) {
                    continue;
                }
                log::info!(
                    "Remote {} {} is newer than local delete at {}, keeping it",
                    kind,
                    id,
                    deleted_at
                );
                queue.drop_tombstone(&id);
                report.undeleted += 1;
                match R::from_row(&row) {
                    Ok(record) => {
                        self.store
                            .put(record)
                            .map_err(|e| FlushError::Store(e.to_string()))?;
                    }
                    Err(e) => log::warn!("Could not restore remote {} {}: {}", kind, id, e),
                }
            }
        }

        let upserts = lock(&self.queue).pending_upserts();
        for chunk in upserts.chunks(batch_size) {
            let rows: Vec<Value> = chunk.iter().map(|r| r.to_row(&ctx.user_id)).collect();
            self.remote
                .upsert_rows(kind, &rows)
                .await
                .map_err(|e| FlushError::Remote(e.to_string()))?;

            report.upserted += chunk.len();
            report.retained += lock(&self.queue).clear_upserts_if_not_superseded(chunk);
        }

        report.remaining = lock(&self.queue).stats().total();
        Ok(report)
    }

    /// Settle state after a flush and schedule whatever comes next
    fn finish(this: &Arc<Self>, outcome: &FlushOutcome) {
        let next = {
            let mut state = lock(&this.state);
            state.in_flight = None;

            if state.shut_down {
                state.phase = FlushPhase::Idle;
                return;
            }

            match outcome {
                FlushOutcome::Flushed(report) => {
                    state.backoff.reset();
                    state.phase = FlushPhase::Idle;
                    (report.remaining > 0).then_some((this.options.follow_up, FlushTrigger::FollowUp))
                }
                FlushOutcome::Skipped(Unavailable::Offline) => {
                    Inner::listen_for_online(this, &mut state);
                    let delay = state.backoff.on_failure();
                    state.phase = FlushPhase::BackoffWait;
                    log::info!("Offline, {} flush retries in {:?} or when online", R::KIND, delay);
                    Some((delay, FlushTrigger::Retry))
                }
                FlushOutcome::Skipped(reason) => {
                    log::debug!("{} flush skipped: {}", R::KIND, reason);
                    state.phase = FlushPhase::Idle;
                    None
                }
                FlushOutcome::Failed(e) => {
                    let delay = state.backoff.on_failure();
                    state.phase = FlushPhase::BackoffWait;
                    log::warn!("{} flush failed: {}. Retrying in {:?}", R::KIND, e, delay);
                    Some((delay, FlushTrigger::Retry))
                }
            }
        };

        if let Some((delay, trigger)) = next {
            Inner::schedule(this, delay, trigger);
        }
    }

    /// One-shot listener: an online-restored event retries immediately
    fn listen_for_online(this: &Arc<Self>, state: &mut SchedulerState) {
        if state.online_listener.as_ref().map_or(false, |h| !h.is_finished()) {
            return;
        }

        let network = this.context.network().clone();
        let weak: Weak<Self> = Arc::downgrade(this);
        state.online_listener = Some(tokio::spawn(async move {
            network.wait_until_online().await;
            if let Some(inner) = weak.upgrade() {
                log::info!("Back online, retrying {} flush", R::KIND);
                Inner::cancel_wait(&inner);
                drop(Inner::start_flush(&inner));
            }
        }));
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
    use crate::sync::models::EntityKind;
    use crate::sync::network::NetworkMonitor;
    use crate::sync::records::BookVocabularyEntry;
    use crate::sync::store::SqliteStore;
    use crate::sync::testing::{Call, FakeRemote};
    use serde_json::json;
    use tokio::sync::RwLock;

    struct Harness {
        db: Arc<Database>,
        store: Arc<SqliteStore>,
        remote: Arc<FakeRemote>,
        network: NetworkMonitor,
        scheduler: FlushScheduler<BookVocabularyEntry>,
    }

    fn harness() -> Harness {
        let db = Arc::new(Database::in_memory().unwrap());
        let store = Arc::new(SqliteStore::new(db.clone()));
        let remote = FakeRemote::new();
        let network = NetworkMonitor::new(true);
        let config = SyncConfig {
            enabled: true,
            user_id: Some("u1".to_string()),
            ..SyncConfig::default()
        };
        let context = CloudContextResolver::new(Arc::new(RwLock::new(config)), network.clone(), true);
        let local: Arc<dyn LocalStore<BookVocabularyEntry>> = store.clone();
        let scheduler = FlushScheduler::new(
            PendingQueue::new(TombstoneLedger::new(db.clone()), "u1"),
            local,
            remote.clone(),
            context,
            FlushOptions::default(),
        );
        Harness {
            db,
            store,
            remote,
            network,
            scheduler,
        }
    }

    fn entry(word: &str, updated_at: &str) -> BookVocabularyEntry {
        let mut entry = BookVocabularyEntry::new("b1", word);
        entry.updated_at = updated_at.to_string();
        entry.created_at = updated_at.to_string();
        entry
    }

    #[tokio::test]
    async fn test_empty_flush_makes_no_remote_calls() {
        let h = harness();
        let outcome = h.scheduler.flush_now().await;
        assert_eq!(outcome, FlushOutcome::Flushed(FlushReport::default()));
        assert!(h.remote.calls().is_empty());
        assert_eq!(h.scheduler.phase(), FlushPhase::Idle);
    }

    #[tokio::test]
    async fn test_deletes_run_before_upserts() {
        let h = harness();
        h.remote.insert_row(EntityKind::BookVocabulary, json!({
            "id": "b1:dog", "book_id": "b1", "word": "dog", "updated_at": "2024-01-01T00:00:00.000Z"
        }));

        h.scheduler.enqueue_upsert(entry("cat", "2024-01-02T00:00:00.000Z"));
        h.scheduler.enqueue_delete("b1:dog", Some("2024-01-02T00:00:00.000Z".to_string()));

        let outcome = h.scheduler.flush_now().await;
        let FlushOutcome::Flushed(report) = outcome else {
            panic!("flush failed: {:?}", outcome);
        };
        assert_eq!(report.deleted, 1);
        assert_eq!(report.upserted, 1);
        assert_eq!(report.remaining, 0);

        let kinds: Vec<&'static str> = h.remote.calls().iter().map(Call::name).collect();
        assert_eq!(kinds, vec!["select_by_ids", "delete_by_ids", "upsert_rows"]);
        assert!(h.remote.row(EntityKind::BookVocabulary, "b1:dog").is_none());
        assert!(h.remote.row(EntityKind::BookVocabulary, "b1:cat").is_some());
    }

    #[tokio::test]
    async fn test_newer_remote_row_survives_tombstone() {
        let h = harness();
        h.remote.insert_row(EntityKind::BookVocabulary, json!({
            "id": "b1:cat", "book_id": "b1", "word": "cat", "status": "known",
            "updated_at": "2024-01-01T10:05:00.000Z"
        }));
        h.scheduler.enqueue_delete("b1:cat", Some("2024-01-01T10:00:00.000Z".to_string()));

        let outcome = h.scheduler.flush_now().await;
        let FlushOutcome::Flushed(report) = outcome else {
            panic!("flush failed: {:?}", outcome);
        };
        assert_eq!(report.undeleted, 1);
        assert_eq!(report.deleted, 0);

        assert!(!h.remote.calls().iter().any(|c| c.name() == "delete_by_ids"));
        assert!(h.scheduler.tombstone("b1:cat").is_none());
        let restored: BookVocabularyEntry = h.store.get("b1:cat").unwrap().unwrap();
        assert_eq!(restored.status.as_deref(), Some("known"));
    }

    #[tokio::test]
    async fn test_batches_are_chunked() {
        let h = harness();
        for i in 0..250 {
            h.scheduler.enqueue_upsert(entry(&format!("w{}", i), "2024-01-01T00:00:00.000Z"));
        }
        for i in 0..101 {
            h.scheduler.enqueue_delete(&format!("b1:gone{}", i), None);
        }

        assert!(h.scheduler.flush_now().await.is_success());

        let calls = h.remote.calls();
        let count = |name: &str| calls.iter().filter(|c| c.name() == name).count();
        assert_eq!(count("upsert_rows"), 3);
        assert_eq!(count("select_by_ids"), 2);
        assert_eq!(count("delete_by_ids"), 2);
        assert_eq!(h.remote.rows(EntityKind::BookVocabulary).len(), 250);
    }

    #[tokio::test]
    async fn test_failure_leaves_queues_and_backs_off() {
        let h = harness();
        h.remote.set_failing(true);
        h.scheduler.enqueue_delete("b1:cat", None);
        h.scheduler.enqueue_upsert(entry("dog", "2024-01-01T00:00:00.000Z"));

        let outcome = h.scheduler.flush_now().await;
        assert!(matches!(outcome, FlushOutcome::Failed(FlushError::Remote(_))));
        assert_eq!(h.scheduler.stats(), QueueStats { pending_upserts: 1, pending_deletes: 1 });
        assert_eq!(h.scheduler.phase(), FlushPhase::BackoffWait);
        assert_eq!(h.scheduler.current_backoff(), Duration::from_millis(3000));

        h.remote.set_failing(false);
        assert!(h.scheduler.flush_now().await.is_success());
        assert_eq!(h.scheduler.current_backoff(), Duration::from_millis(1500));
        assert_eq!(h.scheduler.stats().total(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_delays_follow_backoff_schedule() {
        let h = harness();
        h.remote.set_failing(true);
        let start = Instant::now();
        h.scheduler.enqueue_upsert(entry("cat", "2024-01-01T00:00:00.000Z"));

        while h.remote.call_times("upsert_rows").len() < 5 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let times = h.remote.call_times("upsert_rows");
        assert_eq!(times[0] - start, Duration::from_millis(1200));
        let gaps: Vec<u64> = times
            .windows(2)
            .map(|w| (w[1] - w[0]).as_millis() as u64)
            .collect();
        assert_eq!(gaps, vec![1500, 3000, 6000, 12_000]);
        assert_eq!(h.scheduler.current_backoff(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_coalesces_upserts() {
        let h = harness();
        h.scheduler.enqueue_upsert(entry("cat", "2024-01-01T00:00:00.000Z"));
        tokio::time::sleep(Duration::from_millis(500)).await;
        h.scheduler.enqueue_upsert(entry("dog", "2024-01-01T00:00:00.000Z"));

        // The second edit restarted the window: 1.2s after it, not after the first
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(h.remote.calls().is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        let upserts: Vec<Call> = h.remote.calls();
        assert_eq!(upserts, vec![Call::UpsertRows(EntityKind::BookVocabulary, 2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_steady_edits_flush_after_the_last_one() {
        let h = harness();
        let start = Instant::now();
        for i in 0..5 {
            h.scheduler.enqueue_upsert(entry(&format!("w{}", i), "2024-01-01T00:00:00.000Z"));
            tokio::time::sleep(Duration::from_millis(800)).await;
        }
        assert!(h.remote.calls().is_empty());

        while h.remote.call_times("upsert_rows").is_empty() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let times = h.remote.call_times("upsert_rows");
        assert_eq!(times.len(), 1);
        assert_eq!(times[0] - start, Duration::from_millis(4 * 800 + 1200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_upsert_does_not_postpone_pending_delete() {
        let h = harness();
        let start = Instant::now();
        h.scheduler.enqueue_delete("b1:dog", None);
        h.scheduler.enqueue_upsert(entry("cat", "2024-01-01T00:00:00.000Z"));

        while h.remote.call_times("upsert_rows").is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // Both went out in the immediate pass, well before the debounce
        assert!(h.remote.call_times("delete_by_ids")[0] - start < Duration::from_millis(100));
        assert!(h.remote.call_times("upsert_rows")[0] - start < Duration::from_millis(100));
        assert!(h.remote.row(EntityKind::BookVocabulary, "b1:cat").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_flush_waits_for_online() {
        let h = harness();
        h.network.set_online(false);
        h.scheduler.enqueue_delete("b1:cat", None);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.scheduler.phase(), FlushPhase::BackoffWait);
        assert!(h.remote.calls().is_empty());

        h.network.set_online(true);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!h.remote.calls().is_empty());
        assert_eq!(h.scheduler.stats().total(), 0);
        assert_eq!(h.scheduler.phase(), FlushPhase::Idle);
    }

    #[tokio::test]
    async fn test_merge_never_overwrites_newer_local_write() {
        let h = harness();
        h.network.set_online(false);
        let local = h
            .scheduler
            .put_and_enqueue(entry("cat", "2024-01-02T00:00:00.000Z"))
            .unwrap();

        let stale = json!({
            "id": "b1:cat", "book_id": "b1", "word": "cat", "status": "known",
            "updated_at": "2024-01-01T00:00:00.000Z"
        });
        let stats = h.scheduler.merge_remote_rows(&[stale]).unwrap();
        assert_eq!(stats.adopted, 0);

        let stored: BookVocabularyEntry = h.store.get("b1:cat").unwrap().unwrap();
        assert_eq!(stored, local);
        assert!(h.scheduler.has_pending_upsert("b1:cat"));

        assert!(h.scheduler.remove_and_enqueue("b1:cat").unwrap());
        assert!(h.scheduler.tombstone("b1:cat").is_some());
        let gone: Option<BookVocabularyEntry> = h.store.get("b1:cat").unwrap();
        assert!(gone.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_flushes_share_one_pass() {
        let h = harness();
        h.scheduler.enqueue_upsert(entry("cat", "2024-01-01T00:00:00.000Z"));
        let gate = h.remote.hold_upserts();

        let first = tokio::spawn({
            let scheduler = h.scheduler.clone();
            async move { scheduler.flush_now().await }
        });
        gate.entered().await;
        assert_eq!(h.scheduler.phase(), FlushPhase::Flushing);

        let second = tokio::spawn({
            let scheduler = h.scheduler.clone();
            async move { scheduler.flush_now().await }
        });
        tokio::task::yield_now().await;
        gate.release();

        let (a, b) = (first.await.unwrap(), second.await.unwrap());
        assert_eq!(a, b);
        let upserts = h.remote.calls().iter().filter(|c| c.name() == "upsert_rows").count();
        assert_eq!(upserts, 1);
    }

    #[tokio::test]
    async fn test_edit_during_request_is_not_lost() {
        let h = harness();
        h.scheduler.enqueue_upsert(entry("cat", "2024-01-01T00:00:00.000Z"));
        let gate = h.remote.hold_upserts();

        let flush = tokio::spawn({
            let scheduler = h.scheduler.clone();
            async move { scheduler.flush_now().await }
        });
        gate.entered().await;
        h.scheduler.enqueue_upsert(entry("cat", "2024-01-01T00:00:09.000Z"));
        gate.release();

        let FlushOutcome::Flushed(report) = flush.await.unwrap() else {
            panic!("flush failed");
        };
        assert_eq!(report.retained, 1);
        assert_eq!(report.remaining, 1);
        assert!(h.scheduler.has_pending_upsert("b1:cat"));
    }

    #[tokio::test]
    async fn test_skipped_when_signed_out_user_differs() {
        let h = harness();
        let other = FlushScheduler::<BookVocabularyEntry>::new(
            PendingQueue::new(TombstoneLedger::new(h.db.clone()), "someone-else"),
            h.scheduler.store().clone(),
            h.remote.clone(),
            CloudContextResolver::new(
                Arc::new(RwLock::new(SyncConfig {
                    enabled: true,
                    user_id: Some("u1".to_string()),
                    ..SyncConfig::default()
                })),
                h.network.clone(),
                true,
            ),
            FlushOptions::default(),
        );
        assert_eq!(
            other.flush_now().await,
            FlushOutcome::Skipped(Unavailable::SignedOut)
        );
    }

    #[tokio::test]
    async fn test_realtime_changes_merge_and_delete() {
        let h = harness();
        let row = json!({
            "id": "b1:cat", "book_id": "b1", "word": "cat",
            "updated_at": "2024-01-02T00:00:00.000Z"
        });
        let change = RemoteChange {
            kind: EntityKind::BookVocabulary,
            event: ChangeEvent::Insert,
            row: row.clone(),
        };
        assert_eq!(h.scheduler.apply_change(&change).unwrap().adopted, 1);

        let delete = RemoteChange {
            event: ChangeEvent::Delete,
            row: json!({"id": "b1:cat"}),
            ..change
        };
        assert_eq!(h.scheduler.apply_change(&delete).unwrap().removed, 1);
        let gone: Option<BookVocabularyEntry> = h.store.get("b1:cat").unwrap();
        assert!(gone.is_none());
    }

    #[tokio::test]
    async fn test_malformed_rows_are_skipped() {
        let h = harness();
        let stats = h
            .scheduler
            .merge_remote_rows(&[json!({"id": "b1:cat"}), json!({"updated_at": "2024-01-01T00:00:00Z"})])
            .unwrap();
        assert_eq!(stats.skipped, 2);
        assert_eq!(stats.changed(), 0);
    }
}
