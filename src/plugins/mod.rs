//! Plugin registry and lifecycle
//!
//! The registry is the authoritative list of reachable capability providers.
//! Discovery scans feed it manifests; listeners get synchronous callbacks on
//! every mutation so dependent components (event broker, authorization
//! cleanup) react in the same logical transaction as the registry change.

pub mod discovery;
pub mod manifest;
pub mod transport;

use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::protocol::VersionName;
use discovery::DiscoveryProvider;
use manifest::{ConnectionType, Manifest};
use transport::{MessageTransport, MessagingError, TransportMessage};

/// Separator between a plugin-local service id and the plugin id suffix.
const SERVICE_ID_SEPARATOR: char = '.';

/// Connection lifecycle of a registered plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Discovered,
    Connecting,
    Connected,
    Disabled,
    Lost,
}

/// A registered capability provider.
#[derive(Debug, Clone)]
pub struct Plugin {
    /// Stable id derived from the transport address.
    pub id: String,
    pub name: String,
    pub address: String,
    pub connection_type: ConnectionType,
    pub sdk_version: Option<VersionName>,
    pub manifest: Manifest,
    pub state: ConnectionState,
    pub enabled: bool,
    pub discovered_at_ms: u64,
}

impl Plugin {
    fn from_manifest(manifest: Manifest) -> Self {
        Plugin {
            id: plugin_id_for_address(&manifest.address),
            name: manifest.name.clone(),
            address: manifest.address.clone(),
            connection_type: manifest.connection_type,
            sdk_version: manifest.sdk_version_name(),
            manifest,
            state: ConnectionState::Discovered,
            enabled: true,
            discovered_at_ms: now_ms(),
        }
    }

    pub fn supports_profile(&self, profile: &str) -> bool {
        self.manifest.supports_profile(profile)
    }
}

/// Derive the stable plugin id from a transport address.
pub fn plugin_id_for_address(address: &str) -> String {
    let digest = Sha256::digest(address.as_bytes());
    hex::encode(digest)[..32].to_string()
}

/// Append the plugin id suffix to a plugin-local service id, producing the
/// client-visible service id.
pub fn append_plugin_id(service_id: &str, plugin_id: &str) -> String {
    format!("{}{}{}", service_id, SERVICE_ID_SEPARATOR, plugin_id)
}

/// Split a client-visible service id into (plugin-local id, plugin id).
pub fn split_service_id(service_id: &str) -> Option<(&str, &str)> {
    service_id
        .rsplit_once(SERVICE_ID_SEPARATOR)
        .filter(|(local, plugin)| !local.is_empty() && !plugin.is_empty())
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("plugin '{0}' is not registered")]
    NotFound(String),
    #[error("plugin '{0}' is disabled")]
    Disabled(String),
    #[error(transparent)]
    Messaging(#[from] MessagingError),
}

/// Synchronous registry mutation callbacks.
pub trait PluginEventListener: Send + Sync {
    fn on_plugin_found(&self, _plugin: &Plugin) {}
    fn on_plugin_lost(&self, _plugin: &Plugin) {}
    fn on_connection_state_changed(&self, _plugin: &Plugin, _state: ConnectionState) {}
}

/// Authoritative plugin table plus its transports.
pub struct PluginRegistry {
    plugins: RwLock<HashMap<String, Plugin>>,
    listeners: RwLock<Vec<Arc<dyn PluginEventListener>>>,
    point_to_point: Arc<dyn MessageTransport>,
    broadcast: Arc<dyn MessageTransport>,
    scan_in_progress: AtomicBool,
}

impl PluginRegistry {
    pub fn new(
        point_to_point: Arc<dyn MessageTransport>,
        broadcast: Arc<dyn MessageTransport>,
    ) -> Self {
        PluginRegistry {
            plugins: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            point_to_point,
            broadcast,
            scan_in_progress: AtomicBool::new(false),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn PluginEventListener>) {
        self.listeners.write().push(listener);
    }

    /// Transport adapter for the given connection type. Internal plugins
    /// ride the point-to-point adapter.
    pub fn transport_for(&self, connection_type: ConnectionType) -> Arc<dyn MessageTransport> {
        match connection_type {
            ConnectionType::Broadcast => Arc::clone(&self.broadcast),
            ConnectionType::PointToPoint | ConnectionType::Internal => {
                Arc::clone(&self.point_to_point)
            }
        }
    }

    // ------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------

    /// Run one discovery pass through the provider. Guarded so overlapping
    /// invocations collapse into one; must never run on the request path.
    pub async fn scan(&self, provider: &dyn DiscoveryProvider) {
        if self
            .scan_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(target: "plugins", "discovery scan already in progress");
            return;
        }
        let result = provider.scan().await;
        self.scan_in_progress.store(false, Ordering::SeqCst);

        match result {
            Ok(manifests) => self.apply_scan(manifests),
            Err(e) => warn!(target: "plugins", error = %e, "discovery scan failed"),
        }
    }

    /// Apply a scan result: add newly found plugins, keep known ones
    /// untouched, drop vanished ones. Duplicate manifests for the same
    /// address collapse, preferring the point-to-point declaration.
    pub fn apply_scan(&self, manifests: Vec<Manifest>) {
        let mut by_address: HashMap<String, Manifest> = HashMap::new();
        for m in manifests {
            match by_address.get(&m.address) {
                Some(existing)
                    if existing.connection_type == ConnectionType::PointToPoint
                        && m.connection_type != ConnectionType::PointToPoint => {}
                _ => {
                    by_address.insert(m.address.clone(), m);
                }
            }
        }

        let mut found = Vec::new();
        let mut lost = Vec::new();
        {
            let mut plugins = self.plugins.write();
            for manifest in by_address.values() {
                let id = plugin_id_for_address(&manifest.address);
                if !plugins.contains_key(&id) {
                    let plugin = Plugin::from_manifest(manifest.clone());
                    info!(
                        target: "plugins",
                        plugin_id = %plugin.id,
                        name = %plugin.name,
                        "plugin discovered"
                    );
                    plugins.insert(id, plugin.clone());
                    found.push(plugin);
                }
            }
            let vanished: Vec<String> = plugins
                .keys()
                .filter(|id| {
                    !by_address
                        .values()
                        .any(|m| plugin_id_for_address(&m.address) == **id)
                })
                .cloned()
                .collect();
            for id in vanished {
                if let Some(mut plugin) = plugins.remove(&id) {
                    plugin.state = ConnectionState::Lost;
                    info!(target: "plugins", plugin_id = %id, "plugin vanished");
                    lost.push(plugin);
                }
            }
        }

        for plugin in &found {
            self.notify_found(plugin);
        }
        for plugin in &lost {
            self.notify_lost(plugin);
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Mark a plugin connecting, then connected. Failures along the live
    /// channel surface later through dispatch and keep-alive.
    pub fn connect(&self, plugin_id: &str) -> Result<(), PluginError> {
        self.transition(plugin_id, ConnectionState::Connecting)?;
        self.transition(plugin_id, ConnectionState::Connected)
    }

    pub fn disconnect(&self, plugin_id: &str) -> Result<(), PluginError> {
        let plugin = self
            .get(plugin_id)
            .ok_or_else(|| PluginError::NotFound(plugin_id.to_string()))?;
        self.transport_for(plugin.connection_type)
            .detach(&plugin.address);
        self.transition(plugin_id, ConnectionState::Discovered)
    }

    fn transition(&self, plugin_id: &str, state: ConnectionState) -> Result<(), PluginError> {
        let plugin = {
            let mut plugins = self.plugins.write();
            let plugin = plugins
                .get_mut(plugin_id)
                .ok_or_else(|| PluginError::NotFound(plugin_id.to_string()))?;
            plugin.state = state;
            plugin.clone()
        };
        debug!(target: "plugins", plugin_id, state = ?state, "connection state changed");
        for listener in self.listeners.read().iter() {
            listener.on_connection_state_changed(&plugin, state);
        }
        Ok(())
    }

    /// Enable or disable a plugin. A disabled plugin stays registered but is
    /// excluded from routing and from gateway-event fan-out.
    pub fn set_enabled(&self, plugin_id: &str, enabled: bool) -> Result<(), PluginError> {
        {
            let mut plugins = self.plugins.write();
            let plugin = plugins
                .get_mut(plugin_id)
                .ok_or_else(|| PluginError::NotFound(plugin_id.to_string()))?;
            plugin.enabled = enabled;
        }
        let state = if enabled {
            ConnectionState::Discovered
        } else {
            ConnectionState::Disabled
        };
        self.transition(plugin_id, state)
    }

    /// Force-remove a plugin, firing the loss callbacks. Used by keep-alive
    /// when a plugin stops answering.
    pub fn remove(&self, plugin_id: &str) -> Option<Plugin> {
        let plugin = {
            let mut plugins = self.plugins.write();
            plugins.remove(plugin_id).map(|mut p| {
                p.state = ConnectionState::Lost;
                p
            })
        }?;
        self.transport_for(plugin.connection_type)
            .detach(&plugin.address);
        self.notify_lost(&plugin);
        Some(plugin)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn get(&self, plugin_id: &str) -> Option<Plugin> {
        self.plugins.read().get(plugin_id).cloned()
    }

    pub fn list(&self) -> Vec<Plugin> {
        let mut list: Vec<Plugin> = self.plugins.read().values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    /// Enabled plugins declaring the given profile.
    pub fn find_by_profile(&self, profile: &str) -> Vec<Plugin> {
        self.plugins
            .read()
            .values()
            .filter(|p| p.enabled && p.supports_profile(profile))
            .cloned()
            .collect()
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Send a message to a plugin over its transport adapter. Never called
    /// on the listener task; the router's worker owns this await.
    pub async fn dispatch(
        &self,
        plugin_id: &str,
        message: TransportMessage,
    ) -> Result<(), PluginError> {
        let plugin = self
            .get(plugin_id)
            .ok_or_else(|| PluginError::NotFound(plugin_id.to_string()))?;
        if !plugin.enabled {
            return Err(PluginError::Disabled(plugin_id.to_string()));
        }
        self.transport_for(plugin.connection_type)
            .send(&plugin.address, message)
            .await
            .map_err(|e| {
                warn!(
                    target: "plugins",
                    plugin_id,
                    error = %e,
                    "failed to dispatch message to plugin"
                );
                PluginError::Messaging(e)
            })
    }

    /// Fan a gateway lifecycle event out to every enabled plugin.
    pub async fn send_gateway_event(&self, payload: serde_json::Map<String, serde_json::Value>) {
        let targets: Vec<Plugin> = self
            .plugins
            .read()
            .values()
            .filter(|p| p.enabled)
            .cloned()
            .collect();
        for plugin in targets {
            let message = TransportMessage::event(&plugin.address, payload.clone());
            if let Err(e) = self
                .transport_for(plugin.connection_type)
                .send(&plugin.address, message)
                .await
            {
                warn!(
                    target: "plugins",
                    plugin_id = %plugin.id,
                    error = %e,
                    "failed to deliver gateway event"
                );
            }
        }
    }

    fn notify_found(&self, plugin: &Plugin) {
        for listener in self.listeners.read().iter() {
            listener.on_plugin_found(plugin);
        }
    }

    fn notify_lost(&self, plugin: &Plugin) {
        for listener in self.listeners.read().iter() {
            listener.on_plugin_lost(plugin);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use transport::{BroadcastTransport, PointToPointTransport};

    fn registry() -> PluginRegistry {
        PluginRegistry::new(
            Arc::new(PointToPointTransport::new()),
            Arc::new(BroadcastTransport::new()),
        )
    }

    fn manifest(address: &str, profile: &str, ct: &str) -> Manifest {
        serde_json::from_value(serde_json::json!({
            "name": format!("Plugin {address}"),
            "address": address,
            "connectionType": ct,
            "sdkVersion": "1.1.0",
            "profiles": [{"name": profile}]
        }))
        .unwrap()
    }

    #[derive(Default)]
    struct RecordingListener {
        found: Mutex<Vec<String>>,
        lost: Mutex<Vec<String>>,
        states: Mutex<Vec<(String, ConnectionState)>>,
    }

    impl PluginEventListener for RecordingListener {
        fn on_plugin_found(&self, plugin: &Plugin) {
            self.found.lock().push(plugin.id.clone());
        }
        fn on_plugin_lost(&self, plugin: &Plugin) {
            self.lost.lock().push(plugin.id.clone());
        }
        fn on_connection_state_changed(&self, plugin: &Plugin, state: ConnectionState) {
            self.states.lock().push((plugin.id.clone(), state));
        }
    }

    // ========================================================================
    // Identity helpers
    // ========================================================================

    #[test]
    fn test_plugin_id_stable_and_short() {
        let a = plugin_id_for_address("plugin.battery");
        let b = plugin_id_for_address("plugin.battery");
        let c = plugin_id_for_address("plugin.lights");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn test_service_id_append_split_roundtrip() {
        let full = append_plugin_id("meter0", "abc123");
        assert_eq!(full, "meter0.abc123");
        assert_eq!(split_service_id(&full), Some(("meter0", "abc123")));
        assert_eq!(split_service_id("noseparator"), None);
        assert_eq!(split_service_id(".abc"), None);
    }

    // ========================================================================
    // Scan lifecycle
    // ========================================================================

    #[test]
    fn test_apply_scan_adds_and_removes() {
        let reg = registry();
        let listener = Arc::new(RecordingListener::default());
        reg.add_listener(listener.clone());

        reg.apply_scan(vec![
            manifest("plugin.a", "battery", "broadcast"),
            manifest("plugin.b", "light", "pointToPoint"),
        ]);
        assert_eq!(reg.list().len(), 2);
        assert_eq!(listener.found.lock().len(), 2);

        // Second scan without plugin.b drops it and fires the loss callback.
        reg.apply_scan(vec![manifest("plugin.a", "battery", "broadcast")]);
        assert_eq!(reg.list().len(), 1);
        let lost = listener.lost.lock();
        assert_eq!(lost.len(), 1);
        assert_eq!(lost[0], plugin_id_for_address("plugin.b"));
    }

    #[test]
    fn test_apply_scan_keeps_known_plugins_untouched() {
        let reg = registry();
        reg.apply_scan(vec![manifest("plugin.a", "battery", "broadcast")]);
        let id = plugin_id_for_address("plugin.a");
        reg.set_enabled(&id, false).unwrap();

        reg.apply_scan(vec![manifest("plugin.a", "battery", "broadcast")]);
        assert!(!reg.get(&id).unwrap().enabled);
    }

    #[test]
    fn test_duplicate_manifests_prefer_point_to_point() {
        let reg = registry();
        reg.apply_scan(vec![
            manifest("plugin.a", "battery", "broadcast"),
            manifest("plugin.a", "battery", "pointToPoint"),
        ]);
        let plugins = reg.list();
        assert_eq!(plugins.len(), 1);
        assert_eq!(plugins[0].connection_type, ConnectionType::PointToPoint);
    }

    #[tokio::test]
    async fn test_scan_guard_collapses_overlap() {
        let reg = Arc::new(registry());
        let provider =
            discovery::StaticDiscovery::new(vec![manifest("plugin.a", "battery", "broadcast")]);
        // Simulate a scan already running.
        reg.scan_in_progress.store(true, Ordering::SeqCst);
        reg.scan(&provider).await;
        assert!(reg.list().is_empty());

        reg.scan_in_progress.store(false, Ordering::SeqCst);
        reg.scan(&provider).await;
        assert_eq!(reg.list().len(), 1);
    }

    // ========================================================================
    // Enable / disable and routing queries
    // ========================================================================

    #[test]
    fn test_disabled_plugin_excluded_from_profile_lookup() {
        let reg = registry();
        reg.apply_scan(vec![manifest("plugin.a", "battery", "broadcast")]);
        let id = plugin_id_for_address("plugin.a");

        assert_eq!(reg.find_by_profile("battery").len(), 1);
        reg.set_enabled(&id, false).unwrap();
        assert!(reg.find_by_profile("battery").is_empty());
        assert!(reg.get(&id).is_some());

        reg.set_enabled(&id, true).unwrap();
        assert_eq!(reg.find_by_profile("battery").len(), 1);
    }

    #[test]
    fn test_connect_fires_state_transitions() {
        let reg = registry();
        let listener = Arc::new(RecordingListener::default());
        reg.add_listener(listener.clone());
        reg.apply_scan(vec![manifest("plugin.a", "battery", "broadcast")]);
        let id = plugin_id_for_address("plugin.a");

        reg.connect(&id).unwrap();
        let states = listener.states.lock();
        assert_eq!(
            states.iter().map(|(_, s)| *s).collect::<Vec<_>>(),
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );
        drop(states);
        assert_eq!(reg.get(&id).unwrap().state, ConnectionState::Connected);
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    #[tokio::test]
    async fn test_dispatch_to_disabled_plugin_fails() {
        let reg = registry();
        reg.apply_scan(vec![manifest("plugin.a", "battery", "pointToPoint")]);
        let id = plugin_id_for_address("plugin.a");
        reg.set_enabled(&id, false).unwrap();

        let err = reg
            .dispatch(&id, TransportMessage::request("plugin.a", Default::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::Disabled(_)));
    }

    #[tokio::test]
    async fn test_dispatch_reaches_attached_endpoint() {
        let reg = registry();
        reg.apply_scan(vec![manifest("plugin.a", "battery", "pointToPoint")]);
        let id = plugin_id_for_address("plugin.a");
        let mut rx = reg
            .transport_for(ConnectionType::PointToPoint)
            .attach("plugin.a");

        reg.dispatch(&id, TransportMessage::request("plugin.a", Default::default()))
            .await
            .unwrap();
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_dispatch_unknown_plugin() {
        let reg = registry();
        let err = reg
            .dispatch("missing", TransportMessage::request("x", Default::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_gateway_event_skips_disabled() {
        let reg = registry();
        reg.apply_scan(vec![
            manifest("plugin.a", "battery", "pointToPoint"),
            manifest("plugin.b", "light", "pointToPoint"),
        ]);
        let id_b = plugin_id_for_address("plugin.b");
        reg.set_enabled(&id_b, false).unwrap();

        let transport = reg.transport_for(ConnectionType::PointToPoint);
        let mut rx_a = transport.attach("plugin.a");
        let mut rx_b = transport.attach("plugin.b");

        reg.send_gateway_event(Default::default()).await;
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }
}
