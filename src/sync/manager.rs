//! Sync Manager - orchestrates per-user sync sessions
//!
//! Handles:
//! - Session lifecycle (login builds queues and flush schedulers, logout tears them down)
//! - Full sync passes: flush, delta pull, book metadata push
//! - Realtime subscription and dispatch of pushed changes
//! - Status reporting for the UI
//! - Erasure of a user's synced data, remote and on device

use super::api::{ChangeEvent, RemoteChange, RemoteClient, SyncApiError};
use super::context::{CloudContext, CloudContextResolver, Unavailable};
use super::flush::{FlushError, FlushOptions, FlushOutcome, FlushReport, FlushScheduler};
use super::ledger::{ledger_key, TombstoneLedger};
use super::models::{now_timestamp, row_str, row_timestamp, EntityKind, SyncConfig, SyncRecord};
use super::network::NetworkMonitor;
use super::queue::PendingQueue;
use super::reconcile::{decide, MergeDecision, MergeStats};
use super::records::{BookMetadata, BookVocabularyEntry, GlobalVocabularyEntry, ReadingProgress};
use super::repo::{SchedulerSource, SyncedRepo};
use super::srs::{CardScheduler, GlobalVocabService};
use super::status::StatusReporter;
use super::store::{LocalStore, SqliteStore, StoreError};
use super::lock;
use crate::db::{Database, DbError, DeviceStorage};
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::StreamExt;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

const CONFIG_KEY: &str = "sync_config";

/// Storage key for the per-user "last successful sync" timestamp
pub fn last_sync_key(user_id: &str) -> String {
    format!("last-sync:{}", user_id)
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Error, Debug)]
pub enum SyncManagerError {
    #[error("API error: {0}")]
    Api(#[from] SyncApiError),

    #[error("Local store error: {0}")]
    Store(#[from] StoreError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Flush failed: {0}")]
    Flush(#[from] FlushError),

    #[error("Sync unavailable: {0}")]
    Unavailable(Unavailable),

    #[error("Invalid user id")]
    InvalidUserId,

    #[error("No active sync session")]
    NoSession,
}

// ============================================================================
// Outcomes
// ============================================================================

/// Counts for one completed sync pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub flushed: FlushReport,
    pub pulled: MergeStats,
    /// Books whose vocabulary and progress were pulled
    pub books_synced: usize,
    /// Book metadata rows pushed because the local copy was newer
    pub books_pushed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed(SyncReport),
    Skipped(Unavailable),
    Failed(String),
}

impl SyncOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

type SharedSync = Shared<BoxFuture<'static, SyncOutcome>>;

/// One step of [`SyncManager::erase_all_user_data`], in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErasureStep {
    /// Remote vocabulary rows of both kinds
    Vocabulary,
    Progress,
    Books,
    /// Every record in the local store
    LocalRecords,
    /// Tombstone ledgers and the last-sync timestamp
    DeviceState,
}

/// Per-step result of a data erasure. A failed step does not stop the rest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErasureReport {
    pub succeeded: Vec<ErasureStep>,
    pub failed: Vec<(ErasureStep, String)>,
}

impl ErasureReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    fn record<E: std::fmt::Display>(&mut self, step: ErasureStep, result: Result<(), E>) {
        match result {
            Ok(()) => self.succeeded.push(step),
            Err(e) => {
                log::warn!("Data erasure failed for {:?}: {}", step, e);
                self.failed.push((step, e.to_string()));
            }
        }
    }
}

// ============================================================================
// Session
// ============================================================================

/// Everything that exists only while a user is signed in
struct SyncSession {
    user_id: String,
    book_vocab: FlushScheduler<BookVocabularyEntry>,
    global_vocab: FlushScheduler<GlobalVocabularyEntry>,
    progress: FlushScheduler<ReadingProgress>,
    books: Arc<dyn LocalStore<BookMetadata>>,
    realtime: StdMutex<Option<JoinHandle<()>>>,
}

impl SyncSession {
    fn shutdown(&self) {
        self.book_vocab.shutdown();
        self.global_vocab.shutdown();
        self.progress.shutdown();
        if let Some(handle) = lock(&self.realtime).take() {
            handle.abort();
        }
    }

    /// Wait for flushes already in flight to land
    async fn settle(&self) {
        tokio::join!(
            self.book_vocab.settle(),
            self.global_vocab.settle(),
            self.progress.settle()
        );
    }

    fn realtime_active(&self) -> bool {
        lock(&self.realtime)
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }

    /// Flush every kind; the first outcome that is not a success wins
    async fn flush_all(&self) -> Result<FlushReport, SyncManagerError> {
        let (book, global, progress) = tokio::join!(
            self.book_vocab.flush_now(),
            self.global_vocab.flush_now(),
            self.progress.flush_now()
        );

        let mut total = FlushReport::default();
        for outcome in [book, global, progress] {
            match outcome {
                FlushOutcome::Flushed(report) => {
                    total.deleted += report.deleted;
                    total.undeleted += report.undeleted;
                    total.upserted += report.upserted;
                    total.retained += report.retained;
                    total.remaining += report.remaining;
                }
                FlushOutcome::Skipped(reason) => return Err(SyncManagerError::Unavailable(reason)),
                FlushOutcome::Failed(e) => return Err(e.into()),
            }
        }
        Ok(total)
    }

    fn apply_change(&self, change: &RemoteChange) -> Result<MergeStats, StoreError> {
        match change.kind {
            EntityKind::BookVocabulary => self.book_vocab.apply_change(change),
            EntityKind::GlobalVocabulary => self.global_vocab.apply_change(change),
            EntityKind::ReadingProgress => self.progress.apply_change(change),
            EntityKind::Book => apply_book_change(&*self.books, change),
        }
    }
}

/// The signed-in session, shared by the manager and every repository it
/// hands out
#[derive(Clone, Default)]
struct SessionSlot(Arc<StdMutex<Option<Arc<SyncSession>>>>);

impl SessionSlot {
    fn get(&self) -> Option<Arc<SyncSession>> {
        lock(&self.0).clone()
    }
}

impl SchedulerSource<BookVocabularyEntry> for SessionSlot {
    fn current(&self) -> Option<FlushScheduler<BookVocabularyEntry>> {
        self.get().map(|session| session.book_vocab.clone())
    }
}

impl SchedulerSource<GlobalVocabularyEntry> for SessionSlot {
    fn current(&self) -> Option<FlushScheduler<GlobalVocabularyEntry>> {
        self.get().map(|session| session.global_vocab.clone())
    }
}

impl SchedulerSource<ReadingProgress> for SessionSlot {
    fn current(&self) -> Option<FlushScheduler<ReadingProgress>> {
        self.get().map(|session| session.progress.clone())
    }
}

// ============================================================================
// Sync Manager
// ============================================================================

#[derive(Clone)]
pub struct SyncManager {
    db: Arc<Database>,
    store: Arc<SqliteStore>,
    remote: Arc<dyn RemoteClient>,
    remote_configured: bool,
    config: Arc<RwLock<SyncConfig>>,
    network: NetworkMonitor,
    status: StatusReporter,
    session: SessionSlot,
    in_flight: Arc<StdMutex<Option<SharedSync>>>,
}

impl SyncManager {
    /// Create a manager. A saved signed-in config restores its session.
    pub fn new(db: Arc<Database>, remote: Arc<dyn RemoteClient>) -> Result<Self, SyncManagerError> {
        Self::with_remote_configured(db, remote, true)
    }

    /// Create a manager whose remote may be a placeholder. With
    /// `remote_configured == false` every sync attempt is skipped.
    pub fn with_remote_configured(
        db: Arc<Database>,
        remote: Arc<dyn RemoteClient>,
        remote_configured: bool,
    ) -> Result<Self, SyncManagerError> {
        let config = Self::load_config(&db)?;
        let status = StatusReporter::new(Duration::from_secs(config.status_throttle_secs));

        let manager = Self {
            store: Arc::new(SqliteStore::new(db.clone())),
            db,
            remote,
            remote_configured,
            config: Arc::new(RwLock::new(config.clone())),
            network: NetworkMonitor::default(),
            status,
            session: SessionSlot::default(),
            in_flight: Arc::new(StdMutex::new(None)),
        };

        if let (true, Some(user_id)) = (config.enabled, config.user_id.as_deref()) {
            log::info!("Restoring sync session for {}", user_id);
            manager.start_session(user_id, &config);
        }

        Ok(manager)
    }

    /// Load sync config from database, creating a default one on first run
    fn load_config(db: &Database) -> Result<SyncConfig, DbError> {
        match db.get_setting::<SyncConfig>(CONFIG_KEY)? {
            Some(config) => Ok(config),
            None => {
                let config = SyncConfig::default();
                db.set_setting(CONFIG_KEY, &config)?;
                Ok(config)
            }
        }
    }

    async fn save_config(&self) -> Result<(), SyncManagerError> {
        let config = self.config.read().await;
        self.db.set_setting(CONFIG_KEY, &*config)?;
        Ok(())
    }

    pub async fn get_config(&self) -> SyncConfig {
        self.config.read().await.clone()
    }

    /// Replace the config. Timing changes apply from the next session.
    pub async fn update_config(&self, config: SyncConfig) -> Result<(), SyncManagerError> {
        *self.config.write().await = config;
        self.save_config().await
    }

    pub fn network(&self) -> &NetworkMonitor {
        &self.network
    }

    pub fn set_online(&self, online: bool) {
        self.network.set_online(online);
    }

    pub fn status(&self) -> &StatusReporter {
        &self.status
    }

    pub fn user_id(&self) -> Option<String> {
        self.current_session().map(|s| s.user_id.clone())
    }

    fn current_session(&self) -> Option<Arc<SyncSession>> {
        self.session.get()
    }

    // ------------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------------

    /// Sign in: enable sync for `user_id` and build its session
    pub async fn login(&self, user_id: &str) -> Result<(), SyncManagerError> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(SyncManagerError::InvalidUserId);
        }

        log::info!("Starting sync session for {}", user_id);

        let config = {
            let mut config = self.config.write().await;
            config.enabled = true;
            config.user_id = Some(user_id.to_string());
            config.clone()
        };
        self.save_config().await?;

        self.start_session(user_id, &config);

        if config.sync_on_startup {
            let manager = self.clone();
            tokio::spawn(async move {
                if let SyncOutcome::Failed(e) = manager.sync_now(None).await {
                    log::warn!("Initial sync failed: {}", e);
                }
            });
        }

        Ok(())
    }

    /// Sign out: stop timers and realtime, disable sync. Local data and the
    /// persisted tombstone ledger stay on the device.
    pub async fn logout(&self) -> Result<(), SyncManagerError> {
        log::info!("Ending sync session");

        if let Some(session) = lock(&self.session.0).take() {
            session.shutdown();
        }

        {
            let mut config = self.config.write().await;
            config.enabled = false;
            config.user_id = None;
        }
        self.save_config().await?;
        self.status.set_offline();
        Ok(())
    }

    fn start_session(&self, user_id: &str, config: &SyncConfig) {
        let context = CloudContextResolver::new(
            self.config.clone(),
            self.network.clone(),
            self.remote_configured,
        );
        let options = FlushOptions::from(config);

        let session = Arc::new(SyncSession {
            user_id: user_id.to_string(),
            book_vocab: self.scheduler(user_id, context.clone(), options),
            global_vocab: self.scheduler(user_id, context.clone(), options),
            progress: self.scheduler(user_id, context, options),
            books: self.local(),
            realtime: StdMutex::new(None),
        });

        if let Some(previous) = lock(&self.session.0).replace(session) {
            previous.shutdown();
        }
    }

    fn scheduler<R: SyncRecord>(
        &self,
        user_id: &str,
        context: CloudContextResolver,
        options: FlushOptions,
    ) -> FlushScheduler<R>
    where
        SqliteStore: LocalStore<R>,
    {
        let ledger = TombstoneLedger::new(self.db.clone());
        FlushScheduler::new(
            PendingQueue::new(ledger, user_id),
            self.local(),
            self.remote.clone(),
            context,
            options,
        )
    }

    fn local<R: SyncRecord>(&self) -> Arc<dyn LocalStore<R>>
    where
        SqliteStore: LocalStore<R>,
    {
        self.store.clone()
    }

    // ------------------------------------------------------------------------
    // Repositories
    // ------------------------------------------------------------------------

    // Writes through these queue on whichever session is signed in at the
    // time of the write, and stay local while signed out.

    pub fn book_vocabulary(&self) -> SyncedRepo<BookVocabularyEntry> {
        SyncedRepo::with_source(self.local(), Arc::new(self.session.clone()))
    }

    pub fn global_vocabulary(&self) -> SyncedRepo<GlobalVocabularyEntry> {
        SyncedRepo::with_source(self.local(), Arc::new(self.session.clone()))
    }

    pub fn reading_progress(&self) -> SyncedRepo<ReadingProgress> {
        SyncedRepo::with_source(self.local(), Arc::new(self.session.clone()))
    }

    /// Book metadata is not queued; it is pushed during full sync passes
    pub fn books(&self) -> SyncedRepo<BookMetadata> {
        SyncedRepo::local_only(self.local())
    }

    pub fn global_vocab_service(&self, scheduler: Arc<dyn CardScheduler>) -> GlobalVocabService {
        GlobalVocabService::new(self.global_vocabulary(), scheduler)
    }

    // ------------------------------------------------------------------------
    // Sync
    // ------------------------------------------------------------------------

    /// Drain every queue now without pulling
    pub async fn flush_all(&self) -> Result<FlushReport, SyncManagerError> {
        let session = self.current_session().ok_or(SyncManagerError::NoSession)?;
        session.flush_all().await
    }

    /// Run a full sync pass for one book (or every known book). Concurrent
    /// callers share the pass already running.
    pub async fn sync_now(&self, book_id: Option<String>) -> SyncOutcome {
        let shared = {
            let mut in_flight = lock(&self.in_flight);
            match in_flight.as_ref() {
                Some(running) => running.clone(),
                None => {
                    let manager = self.clone();
                    let task = tokio::spawn(async move {
                        let outcome = manager.run_sync(book_id.as_deref()).await;
                        *lock(&manager.in_flight) = None;
                        outcome
                    });
                    let shared = async move {
                        task.await
                            .unwrap_or_else(|e| SyncOutcome::Failed(format!("sync task failed: {}", e)))
                    }
                    .boxed()
                    .shared();
                    *in_flight = Some(shared.clone());
                    shared
                }
            }
        };
        shared.await
    }

    /// App returned to the foreground
    pub async fn on_foreground(&self) -> SyncOutcome {
        log::debug!("Foreground sync requested");
        self.sync_now(None).await
    }

    /// Last successful sync for the signed-in user
    pub fn last_sync_at(&self) -> Result<Option<String>, SyncManagerError> {
        match self.user_id() {
            Some(user_id) => Ok(self.db.get_item(&last_sync_key(&user_id))?),
            None => Ok(None),
        }
    }

    // ------------------------------------------------------------------------
    // Data erasure
    // ------------------------------------------------------------------------

    /// Delete the user's synced rows on the backend and everything sync keeps
    /// on this device. Remote steps fail with the unavailability reason when
    /// offline or signed out; local steps still run. A signed-in user stays
    /// signed in with a fresh, empty session.
    pub async fn erase_all_user_data(&self) -> ErasureReport {
        let mut report = ErasureReport::default();

        // A running pass could pull rows back in after the local clear
        let running = lock(&self.in_flight).clone();
        if let Some(running) = running {
            running.await;
        }

        let session = lock(&self.session.0).take();
        if let Some(session) = &session {
            session.shutdown();
            session.settle().await;
        }
        let user_id = session.map(|s| s.user_id.clone());
        log::info!("Erasing sync data for {}", user_id.as_deref().unwrap_or("signed-out device"));

        let context = CloudContextResolver::new(
            self.config.clone(),
            self.network.clone(),
            self.remote_configured,
        );
        let ctx = context.resolve().await;
        let remote_steps = [
            (ErasureStep::Vocabulary, EntityKind::GlobalVocabulary),
            (ErasureStep::Progress, EntityKind::ReadingProgress),
            (ErasureStep::Books, EntityKind::Book),
        ];
        for (step, kind) in remote_steps {
            let result = match &ctx {
                Ok(ctx) => self
                    .remote
                    .delete_owned(kind, &ctx.user_id)
                    .await
                    .map_err(|e| e.to_string()),
                Err(reason) => Err(reason.to_string()),
            };
            report.record(step, result);
        }

        let cleared = self
            .store
            .clear_all()
            .map(|removed| log::info!("Erased {} local records", removed));
        report.record(ErasureStep::LocalRecords, cleared);

        let device = match &user_id {
            Some(user_id) => self.clear_device_state(user_id),
            None => Ok(()),
        };
        report.record(ErasureStep::DeviceState, device);

        if let Some(user_id) = &user_id {
            let config = self.config.read().await.clone();
            self.start_session(user_id, &config);
        }
        report
    }

    fn clear_device_state(&self, user_id: &str) -> Result<(), DbError> {
        for kind in [
            EntityKind::BookVocabulary,
            EntityKind::GlobalVocabulary,
            EntityKind::ReadingProgress,
        ] {
            self.db.remove_item(&ledger_key(kind, user_id))?;
        }
        self.db.remove_item(&last_sync_key(user_id))
    }

    async fn run_sync(&self, book_id: Option<&str>) -> SyncOutcome {
        let Some(session) = self.current_session() else {
            self.status.set_offline();
            return SyncOutcome::Skipped(Unavailable::SignedOut);
        };

        let context = CloudContextResolver::new(
            self.config.clone(),
            self.network.clone(),
            self.remote_configured,
        );
        let ctx = match context.resolve().await {
            Ok(ctx) if ctx.user_id == session.user_id => ctx,
            Ok(_) => {
                self.status.set_offline();
                return SyncOutcome::Skipped(Unavailable::SignedOut);
            }
            Err(reason) => {
                log::debug!("Skipping sync: {}", reason);
                self.status.set_offline();
                return SyncOutcome::Skipped(reason);
            }
        };

        self.status.set_syncing();
        match self.sync_pass(&session, &ctx, book_id).await {
            Ok((report, synced_at)) => {
                log::info!(
                    "Sync complete: {} upserted, {} deleted, {} pulled, {} books",
                    report.flushed.upserted,
                    report.flushed.deleted,
                    report.pulled.changed(),
                    report.books_synced
                );
                self.status.set_synced(Some(synced_at));
                SyncOutcome::Completed(report)
            }
            Err(SyncManagerError::Unavailable(reason)) => {
                log::debug!("Sync stopped: {}", reason);
                self.status.set_offline();
                SyncOutcome::Skipped(reason)
            }
            Err(e) => {
                log::error!("Sync failed: {}", e);
                let message = e.to_string();
                self.status.set_error(message.clone()).await;
                SyncOutcome::Failed(message)
            }
        }
    }

    async fn sync_pass(
        &self,
        session: &Arc<SyncSession>,
        ctx: &CloudContext,
        book_id: Option<&str>,
    ) -> Result<(SyncReport, String), SyncManagerError> {
        let started_at = now_timestamp();
        let mut report = SyncReport::default();

        // Push local edits first so a stale pull cannot overwrite them
        report.flushed = session.flush_all().await?;

        let key = last_sync_key(&ctx.user_id);
        let since = self.db.get_item(&key)?;
        log::info!(
            "Pulling changes for {} since {}",
            ctx.user_id,
            since.as_deref().unwrap_or("the beginning")
        );

        let rows = self
            .remote
            .select_since(EntityKind::GlobalVocabulary, &ctx.user_id, None, since.as_deref())
            .await?;
        report.pulled.merge(session.global_vocab.merge_remote_rows(&rows)?);

        let rows = self
            .remote
            .select_since(EntityKind::Book, &ctx.user_id, None, since.as_deref())
            .await?;
        report.pulled.merge(merge_book_rows(&*session.books, &rows)?);

        let books = match book_id {
            Some(book_id) => vec![book_id.to_string()],
            None => self.known_books()?,
        };

        for book in &books {
            let rows = self
                .remote
                .select_since(EntityKind::BookVocabulary, &ctx.user_id, Some(book), since.as_deref())
                .await?;
            report.pulled.merge(session.book_vocab.merge_remote_rows(&rows)?);

            let rows = self
                .remote
                .select_since(EntityKind::ReadingProgress, &ctx.user_id, Some(book), since.as_deref())
                .await?;
            report.pulled.merge(session.progress.merge_remote_rows(&rows)?);

            if self.push_book_metadata(session, ctx, book).await? {
                report.books_pushed += 1;
            }
            report.books_synced += 1;
        }

        self.db.set_item(&key, &started_at)?;
        self.ensure_realtime(session, ctx).await;

        Ok((report, started_at))
    }

    /// Books with any local vocabulary, progress or metadata
    fn known_books(&self) -> Result<Vec<String>, StoreError> {
        let mut books = BTreeSet::new();
        books.extend(LocalStore::<BookVocabularyEntry>::scopes(&*self.store)?);
        books.extend(LocalStore::<ReadingProgress>::scopes(&*self.store)?);
        books.extend(
            LocalStore::<BookMetadata>::list_all(&*self.store)?
                .into_iter()
                .map(|book| book.id),
        );
        Ok(books.into_iter().collect())
    }

    /// Push local book metadata when it is newer than the remote copy, or
    /// adopt the remote copy when that is newer. Returns whether it pushed.
    async fn push_book_metadata(
        &self,
        session: &SyncSession,
        ctx: &CloudContext,
        book_id: &str,
    ) -> Result<bool, SyncManagerError> {
        let Some(local) = session.books.get(book_id)? else {
            return Ok(false);
        };

        let rows = self
            .remote
            .select_by_ids(EntityKind::Book, &ctx.user_id, &[book_id.to_string()])
            .await?;
        let remote = rows.into_iter().next();
        let remote_stamp = remote.as_ref().and_then(|row| row_timestamp(row, "updated_at"));

        let decision = match remote_stamp.as_deref() {
            Some(stamp) => decide(Some(local.updated_at()), stamp),
            None => MergeDecision::PushLocal,
        };

        match decision {
            MergeDecision::PushLocal => {
                log::debug!("Pushing book metadata {}", book_id);
                self.remote
                    .upsert_rows(EntityKind::Book, &[local.to_row(&ctx.user_id)])
                    .await?;
                Ok(true)
            }
            MergeDecision::AdoptRemote => {
                if let Some(row) = remote {
                    merge_book_rows(&*session.books, std::slice::from_ref(&row))?;
                }
                Ok(false)
            }
            MergeDecision::KeepLocal => Ok(false),
        }
    }

    /// Subscribe to realtime changes unless a subscription is already live.
    /// Subscription failures are logged; the next pass retries.
    async fn ensure_realtime(&self, session: &Arc<SyncSession>, ctx: &CloudContext) {
        if session.realtime_active() {
            return;
        }

        let mut stream = match self.remote.subscribe(&ctx.user_id).await {
            Ok(stream) => stream,
            Err(e) => {
                log::warn!("Realtime subscription failed: {}", e);
                return;
            }
        };
        log::info!("Realtime subscription active for {}", ctx.user_id);

        let weak: Weak<SyncSession> = Arc::downgrade(session);
        let handle = tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                let Some(session) = weak.upgrade() else {
                    break;
                };
                match item {
                    Ok(change) => {
                        if let Err(e) = session.apply_change(&change) {
                            log::warn!("Failed to apply realtime {} change: {}", change.kind, e);
                        }
                    }
                    Err(e) => {
                        log::warn!("Realtime stream error: {}", e);
                        break;
                    }
                }
            }
            log::info!("Realtime subscription closed");
        });

        if let Some(previous) = lock(&session.realtime).replace(handle) {
            previous.abort();
        }
    }
}

// ============================================================================
// Book metadata merging
// ============================================================================

/// Last-write-wins merge for book metadata. Not queued, so a newer local
/// copy is simply kept until the next pass pushes it.
fn merge_book_rows(store: &dyn LocalStore<BookMetadata>, rows: &[Value]) -> Result<MergeStats, StoreError> {
    let mut stats = MergeStats::default();
    for row in rows {
        let remote = match BookMetadata::from_row(row) {
            Ok(remote) => remote,
            Err(e) => {
                log::warn!("Skipping malformed book row: {}", e);
                stats.skipped += 1;
                continue;
            }
        };

        let local = store.get(&remote.id)?;
        match decide(local.as_ref().map(|b| b.updated_at()), remote.updated_at()) {
            MergeDecision::AdoptRemote => {
                store.put(remote)?;
                stats.adopted += 1;
            }
            MergeDecision::KeepLocal | MergeDecision::PushLocal => stats.kept += 1,
        }
    }
    Ok(stats)
}

fn apply_book_change(
    store: &dyn LocalStore<BookMetadata>,
    change: &RemoteChange,
) -> Result<MergeStats, StoreError> {
    match change.event {
        ChangeEvent::Insert | ChangeEvent::Update => {
            merge_book_rows(store, std::slice::from_ref(&change.row))
        }
        ChangeEvent::Delete => {
            let mut stats = MergeStats::default();
            match row_str(&change.row, EntityKind::Book.id_column()) {
                Some(id) if store.delete(&id)? => stats.removed += 1,
                Some(_) => stats.kept += 1,
                None => stats.skipped += 1,
            }
            Ok(stats)
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
