//! Cloud Context Resolver
//!
//! Decides whether sync is currently possible: enabled, backend configured,
//! a user signed in, and the device online.

use super::models::SyncConfig;
use super::network::NetworkMonitor;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Who sync runs as, when it can run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudContext {
    pub user_id: String,
}

/// Why sync cannot run right now. None of these is an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unavailable {
    Disabled,
    NotConfigured,
    SignedOut,
    Offline,
}

impl fmt::Display for Unavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disabled => "sync is disabled",
            Self::NotConfigured => "no sync backend configured",
            Self::SignedOut => "not signed in",
            Self::Offline => "offline",
        })
    }
}

#[derive(Clone)]
pub struct CloudContextResolver {
    config: Arc<RwLock<SyncConfig>>,
    network: NetworkMonitor,
    remote_configured: bool,
}

impl CloudContextResolver {
    pub fn new(config: Arc<RwLock<SyncConfig>>, network: NetworkMonitor, remote_configured: bool) -> Self {
        Self {
            config,
            network,
            remote_configured,
        }
    }

    pub fn network(&self) -> &NetworkMonitor {
        &self.network
    }

    /// Resolve the current context. Offline is checked last so a signed-out
    /// or disabled device never waits for connectivity.
    pub async fn resolve(&self) -> Result<CloudContext, Unavailable> {
        let config = self.config.read().await;

        if !config.enabled {
            return Err(Unavailable::Disabled);
        }
        if !self.remote_configured {
            return Err(Unavailable::NotConfigured);
        }
        let user_id = config
            .user_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or(Unavailable::SignedOut)?;
        if !self.network.is_online() {
            return Err(Unavailable::Offline);
        }

        Ok(CloudContext {
            user_id: user_id.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver(config: SyncConfig, online: bool, configured: bool) -> CloudContextResolver {
        CloudContextResolver::new(
            Arc::new(RwLock::new(config)),
            NetworkMonitor::new(online),
            configured,
        )
    }

    fn signed_in() -> SyncConfig {
        SyncConfig {
            enabled: true,
            user_id: Some("u1".to_string()),
            ..SyncConfig::default()
        }
    }

    #[tokio::test]
    async fn test_resolves_when_everything_is_available() {
        let ctx = resolver(signed_in(), true, true).resolve().await.unwrap();
        assert_eq!(ctx.user_id, "u1");
    }

    #[tokio::test]
    async fn test_unavailable_reasons() {
        let disabled = SyncConfig {
            enabled: false,
            ..signed_in()
        };
        assert_eq!(resolver(disabled, true, true).resolve().await, Err(Unavailable::Disabled));

        assert_eq!(
            resolver(signed_in(), true, false).resolve().await,
            Err(Unavailable::NotConfigured)
        );

        let signed_out = SyncConfig {
            user_id: Some("  ".to_string()),
            ..signed_in()
        };
        assert_eq!(resolver(signed_out, false, true).resolve().await, Err(Unavailable::SignedOut));

        assert_eq!(
            resolver(signed_in(), false, true).resolve().await,
            Err(Unavailable::Offline)
        );
    }

    #[tokio::test]
    async fn test_follows_network_changes() {
        let resolver = resolver(signed_in(), false, true);
        assert!(resolver.resolve().await.is_err());
        resolver.network().set_online(true);
        assert!(resolver.resolve().await.is_ok());
    }
}
