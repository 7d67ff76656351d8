//! # Lingosync
//!
//! Local-first sync engine for a language-learning reader: book vocabulary,
//! spaced-repetition cards and reading progress are edited offline and
//! reconciled with a shared backend.

pub mod db;
pub mod sync;

use db::{Database, DbError};
use std::path::PathBuf;
use std::sync::Arc;
use sync::{RemoteConfig, RestRemoteClient, SyncApiError, SyncManager, SyncManagerError};
use thiserror::Error;

pub use db::DeviceStorage;
pub use sync::{
    BackgroundScheduler, BookMetadata, BookVocabularyEntry, GlobalVocabularyEntry, ReadingProgress,
    SyncConfig, SyncOutcome, SyncState, SyncStatus,
};

#[derive(Error, Debug)]
pub enum StartupError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Remote endpoint not configured (set LINGOSYNC_API_URL and LINGOSYNC_API_KEY)")]
    NotConfigured,

    #[error("API error: {0}")]
    Api(#[from] SyncApiError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncManagerError),
}

/// Handles returned by [`start`]
pub struct Lingosync {
    pub db: Arc<Database>,
    /// Kept by the host to set the access token after sign-in
    pub remote: Arc<RestRemoteClient>,
    pub manager: SyncManager,
    pub scheduler: BackgroundScheduler,
}

/// Load `.env` and install the logger. Safe to call more than once.
pub fn init() {
    dotenvy::dotenv().ok();

    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).try_init();
}

/// Open the device database and wire up the sync engine from environment
/// configuration. `db_path` defaults to the platform data directory.
pub async fn start(db_path: Option<PathBuf>) -> Result<Lingosync, StartupError> {
    init();

    let db = Arc::new(match db_path {
        Some(path) => Database::new(path)?,
        None => Database::open_default()?,
    });
    log::info!("Database initialized");

    let remote_config = RemoteConfig::from_env().ok_or(StartupError::NotConfigured)?;
    let remote = Arc::new(RestRemoteClient::new(remote_config)?);

    let manager = SyncManager::new(db.clone(), remote.clone())?;
    let scheduler = BackgroundScheduler::new(db.clone(), manager.clone()).await;
    if let Err(e) = scheduler.load_config().await {
        log::warn!("Failed to load scheduler config: {}", e);
    }
    if scheduler.get_config().await.enabled {
        if let Err(e) = scheduler.start().await {
            log::warn!("Failed to start background scheduler: {}", e);
        }
    }

    Ok(Lingosync {
        db,
        remote,
        manager,
        scheduler,
    })
}
