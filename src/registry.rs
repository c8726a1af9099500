//! Named bridge registry
//!
//! Hosts keep one `BridgeRegistry` for their lifetime and attach to bridges by
//! name, so code that reloads can reuse the tool server it started before
//! instead of spawning a duplicate.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::bridge::{Launcher, ProcessBridge};
use crate::config::BridgeConfig;
use crate::Result;

/// Bridges keyed by `BridgeConfig::name`
#[derive(Default)]
pub struct BridgeRegistry {
    bridges: RwLock<HashMap<String, ProcessBridge>>,
}

impl BridgeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the bridge registered under `config.name`, creating it if needed.
    ///
    /// An existing bridge is reconfigured when `config` differs from its own,
    /// which restarts its tool server if the identity changed.
    pub async fn attach(&self, config: BridgeConfig) -> Result<ProcessBridge> {
        self.attach_with(config, ProcessBridge::new).await
    }

    /// Like [`attach`](Self::attach), launching through `launcher`
    pub async fn attach_with_launcher(
        &self,
        config: BridgeConfig,
        launcher: Arc<dyn Launcher>,
    ) -> Result<ProcessBridge> {
        self.attach_with(config, move |config| {
            ProcessBridge::builder(config).launcher(launcher).build()
        })
        .await
    }

    async fn attach_with<F>(&self, config: BridgeConfig, build: F) -> Result<ProcessBridge>
    where
        F: FnOnce(BridgeConfig) -> Result<ProcessBridge>,
    {
        let mut bridges = self.bridges.write().await;

        if let Some(existing) = bridges.get(&config.name) {
            if !existing.is_terminated() {
                if existing.config() != config {
                    tracing::info!(
                        bridge = %config.name,
                        identity = %config.identity,
                        "Reconfiguring registered bridge"
                    );
                    existing.reconfigure(config).await?;
                }
                return Ok(existing.clone());
            }
            tracing::debug!(bridge = %config.name, "Replacing terminated bridge");
        }

        let name = config.name.clone();
        let bridge = build(config)?;
        tracing::info!(bridge = %name, instance_id = %bridge.instance_id(), "Bridge registered");
        bridges.insert(name, bridge.clone());
        Ok(bridge)
    }

    pub async fn get(&self, name: &str) -> Option<ProcessBridge> {
        self.bridges.read().await.get(name).cloned()
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.bridges.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Remove a bridge from the registry and shut it down
    pub async fn detach(&self, name: &str) -> bool {
        let removed = self.bridges.write().await.remove(name);
        match removed {
            Some(bridge) => {
                bridge.shutdown().await;
                tracing::info!(bridge = %name, "Bridge detached");
                true
            }
            None => false,
        }
    }

    /// Shut down every registered bridge
    pub async fn shutdown_all(&self) {
        let bridges: Vec<ProcessBridge> = {
            let mut map = self.bridges.write().await;
            map.drain().map(|(_, bridge)| bridge).collect()
        };

        futures::future::join_all(bridges.iter().map(|bridge| bridge.shutdown())).await;
        tracing::info!(count = bridges.len(), "All bridges shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::Phase;
    use crate::testing::{test_config, FakeLauncher};
    use crate::Error;
    use serde_json::json;

    #[tokio::test]
    async fn test_attach_same_name_returns_same_bridge() {
        let registry = BridgeRegistry::new();
        let (launcher, _children) = FakeLauncher::new();

        let first = registry
            .attach_with_launcher(test_config(), launcher.clone())
            .await
            .unwrap();
        let second = registry
            .attach_with_launcher(test_config(), launcher.clone())
            .await
            .unwrap();

        assert_eq!(first.instance_id(), second.instance_id());
        assert_eq!(registry.names().await, vec!["test-tools"]);
    }

    #[tokio::test]
    async fn test_attach_with_new_identity_restarts_child() {
        let registry = BridgeRegistry::new();
        let (launcher, mut children) = FakeLauncher::new();

        let bridge = registry
            .attach_with_launcher(test_config(), launcher.clone())
            .await
            .unwrap();
        let outstanding = {
            let bridge = bridge.clone();
            tokio::spawn(async move { bridge.call("tools/call", None).await })
        };
        let mut fake = children.recv().await.unwrap();
        fake.handshake().await;
        fake.recv_request().await;

        let mut reloaded = test_config();
        reloaded.identity = "v2".to_string();
        let attached = registry
            .attach_with_launcher(reloaded, launcher.clone())
            .await
            .unwrap();

        assert_eq!(attached.instance_id(), bridge.instance_id());
        assert!(matches!(outstanding.await.unwrap(), Err(Error::Restarted(_))));
        assert_eq!(attached.status().phase, Phase::NotStarted);
        assert_eq!(attached.status().expected_identity, "v2");

        let call = {
            let attached = attached.clone();
            tokio::spawn(async move { attached.call("tools/list", None).await })
        };
        let mut fresh = children.recv().await.unwrap();
        fresh.handshake().await;
        let request = fresh.recv_request().await;
        fresh.respond(&request, json!([])).await;
        call.await.unwrap().unwrap();

        assert_eq!(launcher.identities(), vec!["v1", "v2"]);
    }

    #[tokio::test]
    async fn test_terminated_bridge_is_replaced() {
        let registry = BridgeRegistry::new();
        let (launcher, _children) = FakeLauncher::new();

        let first = registry
            .attach_with_launcher(test_config(), launcher.clone())
            .await
            .unwrap();
        first.shutdown().await;

        let second = registry
            .attach_with_launcher(test_config(), launcher.clone())
            .await
            .unwrap();
        assert_ne!(first.instance_id(), second.instance_id());
        assert!(!second.is_terminated());
    }

    #[tokio::test]
    async fn test_detach_and_shutdown_all() {
        let registry = BridgeRegistry::new();
        let (launcher, _children) = FakeLauncher::new();

        let mut other = test_config();
        other.name = "other-tools".to_string();

        let a = registry
            .attach_with_launcher(test_config(), launcher.clone())
            .await
            .unwrap();
        let b = registry
            .attach_with_launcher(other, launcher.clone())
            .await
            .unwrap();

        assert!(registry.detach("test-tools").await);
        assert!(!registry.detach("test-tools").await);
        assert!(a.is_terminated());
        assert!(registry.get("test-tools").await.is_none());

        registry.shutdown_all().await;
        assert!(b.is_terminated());
        assert!(registry.names().await.is_empty());
    }
}
