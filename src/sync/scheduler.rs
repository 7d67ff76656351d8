//! Background Sync Scheduler
//!
//! Runs a full sync pass at a configurable interval. Uses a Tokio task for
//! non-blocking background execution.

use super::manager::{SyncManager, SyncOutcome};
use super::models::now_timestamp;
use super::lock;
use crate::db::Database;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

const CONFIG_KEY: &str = "scheduler_config";

/// Scheduler configuration stored in settings table
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub interval_minutes: u64,
    pub last_run: Option<String>, // ISO 8601 timestamp
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_minutes: 5,
            last_run: None,
        }
    }
}

/// Background scheduler for periodic sync passes
#[derive(Clone)]
pub struct BackgroundScheduler {
    db: Arc<Database>,
    manager: SyncManager,
    config: Arc<RwLock<SchedulerConfig>>,
    running: Arc<AtomicBool>,
    task_handle: Arc<StdMutex<Option<JoinHandle<()>>>>,
}

/// Scheduler errors
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Scheduler is already running")]
    AlreadyRunning,

    #[error("Scheduler is not running")]
    NotRunning,

    #[error("Invalid interval: {0}")]
    InvalidInterval(String),
}

fn validate_interval(interval_minutes: u64) -> Result<(), SchedulerError> {
    if !(1..=1440).contains(&interval_minutes) {
        return Err(SchedulerError::InvalidInterval(format!(
            "Interval must be 1-1440 minutes, got {}",
            interval_minutes
        )));
    }
    Ok(())
}

impl BackgroundScheduler {
    /// Create new scheduler instance. The interval defaults to the sync
    /// config's `sync_interval_minutes` until a saved config is loaded.
    pub async fn new(db: Arc<Database>, manager: SyncManager) -> Self {
        let config = SchedulerConfig {
            interval_minutes: manager.get_config().await.sync_interval_minutes,
            ..SchedulerConfig::default()
        };

        Self {
            db,
            manager,
            config: Arc::new(RwLock::new(config)),
            running: Arc::new(AtomicBool::new(false)),
            task_handle: Arc::new(StdMutex::new(None)),
        }
    }

    /// Load configuration from database settings table
    pub async fn load_config(&self) -> Result<(), SchedulerError> {
        let saved: Option<SchedulerConfig> = self
            .db
            .get_setting(CONFIG_KEY)
            .map_err(|e| SchedulerError::Database(e.to_string()))?;

        if let Some(config) = saved {
            *self.config.write().await = config;
        }
        Ok(())
    }

    /// Save configuration to database settings table
    pub async fn save_config(&self) -> Result<(), SchedulerError> {
        let config = self.config.read().await.clone();
        self.db
            .set_setting(CONFIG_KEY, &config)
            .map_err(|e| SchedulerError::Database(e.to_string()))?;
        Ok(())
    }

    /// Start background scheduler task
    pub async fn start(&self) -> Result<(), SchedulerError> {
        if self.running.load(Ordering::Relaxed) {
            return Err(SchedulerError::AlreadyRunning);
        }

        let interval_minutes = self.config.read().await.interval_minutes;
        validate_interval(interval_minutes)?;

        self.running.store(true, Ordering::Relaxed);

        let running = self.running.clone();
        let db = self.db.clone();
        let config = self.config.clone();
        let manager = self.manager.clone();

        let handle = tokio::spawn(async move {
            Self::scheduler_loop(running, db, config, manager).await;
        });

        *lock(&self.task_handle) = Some(handle);

        log::info!("Background scheduler started (interval: {} minutes)", interval_minutes);
        Ok(())
    }

    /// Stop background scheduler task
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        if !self.running.load(Ordering::Relaxed) {
            return Err(SchedulerError::NotRunning);
        }

        // Signals the loop to exit
        self.running.store(false, Ordering::Relaxed);

        if let Some(handle) = lock(&self.task_handle).take() {
            handle.abort();
        }

        log::info!("Background scheduler stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub async fn get_config(&self) -> SchedulerConfig {
        self.config.read().await.clone()
    }

    /// Update configuration and restart scheduler if needed
    pub async fn update_config(&self, enabled: bool, interval_minutes: u64) -> Result<(), SchedulerError> {
        validate_interval(interval_minutes)?;

        {
            let mut config = self.config.write().await;
            config.enabled = enabled;
            config.interval_minutes = interval_minutes;
        }

        self.save_config().await?;

        if self.is_running() {
            // Ignore error if not running (race condition)
            let _ = self.stop().await;
        }

        if enabled {
            self.start().await?;
        }

        log::info!(
            "Scheduler config updated: enabled={}, interval={} minutes",
            enabled,
            interval_minutes
        );
        Ok(())
    }

    /// Background scheduler loop (runs in spawned task)
    async fn scheduler_loop(
        running: Arc<AtomicBool>,
        db: Arc<Database>,
        config: Arc<RwLock<SchedulerConfig>>,
        manager: SyncManager,
    ) {
        let interval_minutes = config.read().await.interval_minutes;
        let period = Duration::from_secs(60 * interval_minutes);
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        log::info!("Scheduler loop started (interval: {} minutes)", interval_minutes);

        loop {
            interval.tick().await;

            if !running.load(Ordering::Relaxed) {
                log::info!("Scheduler loop: stopping (running flag is false)");
                break;
            }

            log::info!("Background sync triggered by scheduler");

            match manager.sync_now(None).await {
                SyncOutcome::Completed(report) => {
                    log::info!(
                        "Background sync completed: upserted={}, deleted={}, pulled={}, books={}",
                        report.flushed.upserted,
                        report.flushed.deleted,
                        report.pulled.changed(),
                        report.books_synced
                    );

                    let mut cfg = config.write().await;
                    cfg.last_run = Some(now_timestamp());
                    if let Err(e) = db.set_setting(CONFIG_KEY, &*cfg) {
                        log::error!("Failed to save last_run timestamp: {}", e);
                    }
                }
                SyncOutcome::Skipped(reason) => {
                    log::debug!("Background sync skipped: {}", reason);
                }
                SyncOutcome::Failed(e) => {
                    // Queues stay intact; the next tick re-covers the same window
                    log::error!("Background sync failed: {}", e);
                }
            }
        }

        log::info!("Scheduler loop exited");
    }
}

// ============================================================================
// Tests
// ============================================================================
