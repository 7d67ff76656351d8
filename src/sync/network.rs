//! Connectivity signal
//!
//! Binary online/offline indicator fed by the host application. Flush
//! schedulers wait on it for the "online restored" event.

use std::sync::Arc;
use tokio::sync::watch;

#[derive(Clone)]
pub struct NetworkMonitor {
    tx: Arc<watch::Sender<bool>>,
}

impl NetworkMonitor {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Update the signal. Subscribers are only woken on an actual change.
    pub fn set_online(&self, online: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            log::info!("Network is now {}", if online { "online" } else { "offline" });
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Resolves once the device is online (immediately if it already is)
    pub async fn wait_until_online(&self) {
        let mut rx = self.subscribe();
        // The sender lives as long as `self`, so this cannot fail while we wait
        let _ = rx.wait_for(|online| *online).await;
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}
