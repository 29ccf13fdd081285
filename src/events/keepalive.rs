//! Keep-alive monitor
//!
//! Broadcast-connected plugins on a new enough SDK answer liveness pings.
//! The monitor pings every registered plugin on a fixed interval; a plugin
//! that misses too many consecutive pongs is treated as lost, which runs
//! the exact same cleanup as a discovery-observed loss.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::plugins::manifest::ConnectionType;
use crate::plugins::transport::TransportMessage;
use crate::plugins::{Plugin, PluginRegistry};
use crate::protocol::VersionName;

/// Minimum SDK version supporting liveness checks.
pub const KEEPALIVE_MIN_VERSION: VersionName = VersionName::new(1, 1, 0);

/// Default seconds between ping rounds.
pub const DEFAULT_PING_INTERVAL_SECS: u64 = 30;

/// Consecutive missed pongs before a plugin counts as lost.
pub const FAILURE_THRESHOLD: u32 = 3;

/// Attribute carried by the ping message.
pub const PING_ATTRIBUTE: &str = "keepalive";

#[derive(Debug, Default)]
struct LivenessEntry {
    missed: u32,
    awaiting_pong: bool,
}

/// Tracks which plugins are under liveness watch.
pub struct KeepAliveMonitor {
    watched: RwLock<HashMap<String, LivenessEntry>>,
    interval: Duration,
}

impl KeepAliveMonitor {
    pub fn new(interval: Duration) -> Self {
        KeepAliveMonitor {
            watched: RwLock::new(HashMap::new()),
            interval,
        }
    }

    /// Whether a plugin qualifies for liveness checks: broadcast transport
    /// and an SDK that understands the ping attribute.
    pub fn supports(plugin: &Plugin) -> bool {
        plugin.connection_type == ConnectionType::Broadcast
            && plugin
                .sdk_version
                .map(|v| v >= KEEPALIVE_MIN_VERSION)
                .unwrap_or(false)
    }

    /// Put a plugin under watch if it qualifies. Returns whether it was
    /// registered.
    pub fn register(&self, plugin: &Plugin) -> bool {
        if !Self::supports(plugin) {
            return false;
        }
        let mut watched = self.watched.write();
        if watched.contains_key(&plugin.id) {
            return true;
        }
        debug!(target: "plugins", plugin_id = %plugin.id, "keep-alive watch started");
        watched.insert(plugin.id.clone(), LivenessEntry::default());
        true
    }

    pub fn deregister(&self, plugin_id: &str) {
        if self.watched.write().remove(plugin_id).is_some() {
            debug!(target: "plugins", plugin_id, "keep-alive watch stopped");
        }
    }

    pub fn is_watched(&self, plugin_id: &str) -> bool {
        self.watched.read().contains_key(plugin_id)
    }

    /// A pong arrived from the plugin; clear its miss counter.
    pub fn record_pong(&self, plugin_id: &str) {
        if let Some(entry) = self.watched.write().get_mut(plugin_id) {
            entry.awaiting_pong = false;
            entry.missed = 0;
        }
    }

    /// One ping round. Returns the ids of plugins that crossed the failure
    /// threshold; the caller removes them from the registry so the normal
    /// loss cleanup runs.
    pub async fn tick(&self, registry: &PluginRegistry) -> Vec<String> {
        let targets: Vec<String> = self.watched.read().keys().cloned().collect();
        let mut lost = Vec::new();

        for plugin_id in targets {
            // Account for the previous round's missing pong first.
            let over_threshold = {
                let mut watched = self.watched.write();
                match watched.get_mut(&plugin_id) {
                    Some(entry) => {
                        if entry.awaiting_pong {
                            entry.missed += 1;
                            warn!(
                                target: "plugins",
                                plugin_id = %plugin_id,
                                missed = entry.missed,
                                "keep-alive pong missing"
                            );
                        }
                        entry.missed >= FAILURE_THRESHOLD
                    }
                    None => continue,
                }
            };
            if over_threshold {
                lost.push(plugin_id);
                continue;
            }

            let ping = {
                let mut payload = serde_json::Map::new();
                payload.insert(
                    "attribute".to_string(),
                    serde_json::Value::String(PING_ATTRIBUTE.to_string()),
                );
                payload
            };
            let plugin = match registry.get(&plugin_id) {
                Some(p) => p,
                None => {
                    self.deregister(&plugin_id);
                    continue;
                }
            };
            match registry
                .dispatch(&plugin.id, TransportMessage::request(&plugin.address, ping))
                .await
            {
                Ok(()) => {
                    if let Some(entry) = self.watched.write().get_mut(&plugin_id) {
                        entry.awaiting_pong = true;
                    }
                }
                Err(e) => {
                    let over = {
                        let mut watched = self.watched.write();
                        match watched.get_mut(&plugin_id) {
                            Some(entry) => {
                                entry.missed += 1;
                                entry.missed >= FAILURE_THRESHOLD
                            }
                            None => false,
                        }
                    };
                    warn!(
                        target: "plugins",
                        plugin_id = %plugin_id,
                        error = %e,
                        "keep-alive ping failed"
                    );
                    if over {
                        lost.push(plugin_id);
                    }
                }
            }
        }

        for plugin_id in &lost {
            info!(
                target: "plugins",
                plugin_id = %plugin_id,
                "plugin lost after repeated keep-alive failures"
            );
            self.deregister(plugin_id);
        }
        lost
    }

    /// Spawn the periodic ping loop. Plugins crossing the threshold are
    /// removed from the registry, which fires the loss listeners.
    pub fn start(self: Arc<Self>, registry: Arc<PluginRegistry>) -> tokio::task::JoinHandle<()> {
        let interval = self.interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let lost = self.tick(&registry).await;
                for plugin_id in lost {
                    registry.remove(&plugin_id);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::transport::{BroadcastTransport, PointToPointTransport};

    fn registry() -> Arc<PluginRegistry> {
        Arc::new(PluginRegistry::new(
            Arc::new(PointToPointTransport::new()),
            Arc::new(BroadcastTransport::new()),
        ))
    }

    fn scan(reg: &PluginRegistry, address: &str, ct: &str, sdk: &str) -> Plugin {
        reg.apply_scan(vec![serde_json::from_value(serde_json::json!({
            "name": "P",
            "address": address,
            "connectionType": ct,
            "sdkVersion": sdk,
            "profiles": [{"name": "battery"}]
        }))
        .unwrap()]);
        reg.get(&crate::plugins::plugin_id_for_address(address)).unwrap()
    }

    #[test]
    fn test_version_and_transport_gating() {
        let reg = registry();
        let ok = scan(&reg, "plugin.a", "broadcast", "1.1.0");
        assert!(KeepAliveMonitor::supports(&ok));

        let reg = registry();
        let old = scan(&reg, "plugin.b", "broadcast", "1.0.9");
        assert!(!KeepAliveMonitor::supports(&old));

        let reg = registry();
        let p2p = scan(&reg, "plugin.c", "pointToPoint", "2.0.0");
        assert!(!KeepAliveMonitor::supports(&p2p));
    }

    #[tokio::test]
    async fn test_register_and_deregister() {
        let reg = registry();
        let plugin = scan(&reg, "plugin.a", "broadcast", "1.1.0");
        let monitor = KeepAliveMonitor::new(Duration::from_secs(30));
        assert!(monitor.register(&plugin));
        assert!(monitor.is_watched(&plugin.id));
        monitor.deregister(&plugin.id);
        assert!(!monitor.is_watched(&plugin.id));
    }

    #[tokio::test]
    async fn test_missed_pongs_cross_threshold() {
        let reg = registry();
        let plugin = scan(&reg, "plugin.a", "broadcast", "1.1.0");
        // Attach an endpoint so pings send successfully but go unanswered.
        let _rx = reg
            .transport_for(ConnectionType::Broadcast)
            .attach("plugin.a");
        let monitor = KeepAliveMonitor::new(Duration::from_secs(30));
        monitor.register(&plugin);

        let mut lost = Vec::new();
        for _ in 0..=FAILURE_THRESHOLD {
            lost = monitor.tick(&reg).await;
            if !lost.is_empty() {
                break;
            }
        }
        assert_eq!(lost, vec![plugin.id.clone()]);
        assert!(!monitor.is_watched(&plugin.id));
    }

    #[tokio::test]
    async fn test_pong_resets_counter() {
        let reg = registry();
        let plugin = scan(&reg, "plugin.a", "broadcast", "1.1.0");
        let _rx = reg
            .transport_for(ConnectionType::Broadcast)
            .attach("plugin.a");
        let monitor = KeepAliveMonitor::new(Duration::from_secs(30));
        monitor.register(&plugin);

        for _ in 0..FAILURE_THRESHOLD * 2 {
            let lost = monitor.tick(&reg).await;
            assert!(lost.is_empty());
            monitor.record_pong(&plugin.id);
        }
        assert!(monitor.is_watched(&plugin.id));
    }

    #[tokio::test]
    async fn test_send_failures_count_toward_loss() {
        let reg = registry();
        // No endpoint attached: every broadcast send fails with NoReceivers.
        let plugin = scan(&reg, "plugin.a", "broadcast", "1.1.0");
        let monitor = KeepAliveMonitor::new(Duration::from_secs(30));
        monitor.register(&plugin);

        let mut lost = Vec::new();
        for _ in 0..FAILURE_THRESHOLD {
            lost = monitor.tick(&reg).await;
            if !lost.is_empty() {
                break;
            }
        }
        assert_eq!(lost, vec![plugin.id]);
    }
}
