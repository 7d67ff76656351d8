//! Sync status reporting
//!
//! Coarse status for the UI (`offline` / `syncing` / `synced` / `error`),
//! published on a watch channel. The same error message is not re-published
//! within the throttle window.

use moka::future::Cache;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const MAX_TRACKED_ERRORS: u64 = 64;

/// Current sync state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Offline,
    Syncing,
    Synced,
    Error,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Offline => "offline",
            SyncState::Syncing => "syncing",
            SyncState::Synced => "synced",
            SyncState::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub state: SyncState,
    pub last_sync_at: Option<String>,
    pub error: Option<String>,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            state: SyncState::Offline,
            last_sync_at: None,
            error: None,
        }
    }
}

#[derive(Clone)]
pub struct StatusReporter {
    tx: Arc<watch::Sender<SyncStatus>>,
    recent_errors: Cache<String, ()>,
}

impl StatusReporter {
    pub fn new(throttle: Duration) -> Self {
        let (tx, _rx) = watch::channel(SyncStatus::default());
        let recent_errors = Cache::builder()
            .max_capacity(MAX_TRACKED_ERRORS)
            .time_to_live(throttle.max(Duration::from_millis(1)))
            .build();

        Self {
            tx: Arc::new(tx),
            recent_errors,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> SyncStatus {
        self.tx.borrow().clone()
    }

    fn set_state(&self, state: SyncState, last_sync_at: Option<String>) {
        self.tx.send_if_modified(|status| {
            let next_last_sync = last_sync_at.clone().or_else(|| status.last_sync_at.clone());
            if status.state == state && status.error.is_none() && status.last_sync_at == next_last_sync {
                return false;
            }
            log::debug!("Sync status: {} -> {}", status.state.as_str(), state.as_str());
            status.state = state;
            status.error = None;
            status.last_sync_at = next_last_sync;
            true
        });
    }

    pub fn set_offline(&self) {
        self.set_state(SyncState::Offline, None);
    }

    pub fn set_syncing(&self) {
        self.set_state(SyncState::Syncing, None);
    }

    pub fn set_synced(&self, last_sync_at: Option<String>) {
        self.set_state(SyncState::Synced, last_sync_at);
    }

    /// Publish an error. Returns false when the same message was published
    /// within the throttle window; the status still records it, but
    /// subscribers are not woken again.
    pub async fn set_error(&self, message: impl Into<String>) -> bool {
        let message = message.into();
        let throttled = self.recent_errors.contains_key(&message);
        if !throttled {
            self.recent_errors.insert(message.clone(), ()).await;
        }

        self.tx.send_if_modified(|status| {
            status.state = SyncState::Error;
            status.error = Some(message);
            !throttled
        });
        !throttled
    }
}
