//! Event broker and session table
//!
//! Standing subscriptions link a client receiver (WebSocket connection or
//! point-to-point reply channel) to a plugin's event stream for one
//! profile path. The broker owns the session table, fans plugin events out
//! to the right receivers, and tears sessions down on unsubscribe,
//! connection loss, or plugin loss.

pub mod keepalive;

use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::plugins::{append_plugin_id, split_service_id, Plugin};
use crate::protocol::{ApiPath, FIELD_ACCESS_TOKEN, FIELD_SERVICE_ID, FIELD_SESSION_KEY};
use keepalive::KeepAliveMonitor;

/// One standing subscription.
#[derive(Debug, Clone)]
pub struct EventSession {
    /// Identity of the receiving end: origin for token-mode WebSocket
    /// clients, the legacy session key otherwise.
    pub receiver_id: String,
    pub plugin_id: String,
    pub path: ApiPath,
    /// Plugin-local service id the subscription targets, if any.
    pub service_id: Option<String>,
    /// Access token the subscription was created under; events from the
    /// plugin are matched against it case-sensitively.
    pub access_token: Option<String>,
    pub created_at_ms: i64,
}

impl EventSession {
    fn same_key(&self, receiver_id: &str, plugin_id: &str, path: &ApiPath) -> bool {
        self.receiver_id == receiver_id
            && self.plugin_id == plugin_id
            && self.path.matches_ignore_case(path)
    }
}

/// Delivery backend for matched events. The WebSocket server registers one;
/// point-to-point receivers get one backed by the reply transport.
pub trait EventSink: Send + Sync {
    /// Deliver the event to the named receiver. Returns false when the
    /// receiver is unknown to this sink.
    fn deliver(&self, receiver_id: &str, event: &Map<String, Value>) -> bool;
}

/// Session table plus fan-out.
pub struct EventBroker {
    sessions: RwLock<Vec<EventSession>>,
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
    keepalive: Option<Arc<KeepAliveMonitor>>,
}

impl EventBroker {
    pub fn new(keepalive: Option<Arc<KeepAliveMonitor>>) -> Self {
        EventBroker {
            sessions: RwLock::new(Vec::new()),
            sinks: RwLock::new(Vec::new()),
            keepalive,
        }
    }

    pub fn add_sink(&self, sink: Arc<dyn EventSink>) {
        self.sinks.write().push(sink);
    }

    // ------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------

    /// Store a subscription. A second subscribe with the same (receiver,
    /// plugin, path) replaces the existing row instead of duplicating it.
    /// Qualifying plugins go under keep-alive watch.
    pub fn subscribe(&self, session: EventSession, plugin: &Plugin) {
        {
            let mut sessions = self.sessions.write();
            sessions.retain(|s| {
                !s.same_key(&session.receiver_id, &session.plugin_id, &session.path)
            });
            debug!(
                target: "gateway",
                receiver = %session.receiver_id,
                plugin_id = %session.plugin_id,
                path = %session.path,
                "event session stored"
            );
            sessions.push(session);
        }
        if let Some(monitor) = &self.keepalive {
            monitor.register(plugin);
        }
    }

    /// Remove the subscription for one (receiver, plugin, path) key.
    /// Returns how many rows were dropped.
    pub fn unsubscribe(&self, receiver_id: &str, plugin_id: &str, path: &ApiPath) -> usize {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|s| !s.same_key(receiver_id, plugin_id, path));
        before - sessions.len()
    }

    /// Drop every session owned by a receiver (connection closed).
    pub fn on_connection_closed(&self, receiver_id: &str) -> usize {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|s| s.receiver_id != receiver_id);
        let removed = before - sessions.len();
        if removed > 0 {
            debug!(target: "gateway", receiver = receiver_id, removed, "sessions cleared on disconnect");
        }
        removed
    }

    /// Drop every session bound to a lost plugin and stop watching it.
    /// Callers also clear the plugin's authorization data; both run from
    /// the registry's loss callback.
    pub fn on_plugin_lost(&self, plugin_id: &str) -> usize {
        let removed = {
            let mut sessions = self.sessions.write();
            let before = sessions.len();
            sessions.retain(|s| s.plugin_id != plugin_id);
            before - sessions.len()
        };
        if let Some(monitor) = &self.keepalive {
            monitor.deregister(plugin_id);
        }
        if removed > 0 {
            debug!(target: "gateway", plugin_id, removed, "sessions cleared on plugin loss");
        }
        removed
    }

    pub fn sessions_for_plugin(&self, plugin_id: &str) -> Vec<EventSession> {
        self.sessions
            .read()
            .iter()
            .filter(|s| s.plugin_id == plugin_id)
            .cloned()
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    // ------------------------------------------------------------------
    // Fan-out
    // ------------------------------------------------------------------

    /// Route a plugin-originated event to its subscribers.
    ///
    /// Matching is two-phase: a session matches on (plugin id, case-sensitive
    /// service id and access token, case-insensitive path), or on the legacy
    /// session key carried in the payload. The client-visible service id is
    /// rewritten to carry the plugin id suffix before delivery. Events with
    /// no matching session are dropped with a warning, never queued.
    pub fn on_event(&self, plugin_id: &str, mut payload: Map<String, Value>) -> usize {
        let path = ApiPath {
            profile: payload
                .get("profile")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            interface: payload
                .get("interface")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            attribute: payload
                .get("attribute")
                .and_then(|v| v.as_str())
                .map(str::to_string),
        };
        let service_id = payload
            .get(FIELD_SERVICE_ID)
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let access_token = payload
            .get(FIELD_ACCESS_TOKEN)
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let session_key = payload
            .get(FIELD_SESSION_KEY)
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let receivers: Vec<String> = {
            let sessions = self.sessions.read();
            sessions
                .iter()
                .filter(|s| {
                    if s.plugin_id != plugin_id {
                        return false;
                    }
                    if let Some(token) = &access_token {
                        s.access_token.as_deref() == Some(token.as_str())
                            && s.service_id == service_id
                            && s.path.matches_ignore_case(&path)
                    } else if let Some(key) = &session_key {
                        // Legacy key embeds the receiver identity.
                        match split_service_id(key) {
                            Some((receiver, key_plugin)) => {
                                key_plugin == plugin_id && s.receiver_id == receiver
                            }
                            None => s.receiver_id == *key,
                        }
                    } else {
                        false
                    }
                })
                .map(|s| s.receiver_id.clone())
                .collect()
        };

        if receivers.is_empty() {
            warn!(
                target: "gateway",
                plugin_id,
                path = %path,
                "dropping event with no matching session"
            );
            return 0;
        }

        if let Some(local) = &service_id {
            payload.insert(
                FIELD_SERVICE_ID.to_string(),
                Value::String(append_plugin_id(local, plugin_id)),
            );
        }
        payload.remove(FIELD_ACCESS_TOKEN);

        let sinks = self.sinks.read();
        let mut delivered = 0;
        for receiver in receivers {
            let mut sent = false;
            for sink in sinks.iter() {
                if sink.deliver(&receiver, &payload) {
                    sent = true;
                    break;
                }
            }
            if sent {
                delivered += 1;
            } else {
                warn!(
                    target: "gateway",
                    receiver = %receiver,
                    "no sink accepted event for receiver"
                );
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct RecordingSink {
        accept: String,
        delivered: Mutex<Vec<Map<String, Value>>>,
    }

    impl RecordingSink {
        fn new(accept: &str) -> Arc<Self> {
            Arc::new(RecordingSink {
                accept: accept.to_string(),
                delivered: Mutex::new(Vec::new()),
            })
        }
    }

    impl EventSink for RecordingSink {
        fn deliver(&self, receiver_id: &str, event: &Map<String, Value>) -> bool {
            if receiver_id == self.accept {
                self.delivered.lock().push(event.clone());
                true
            } else {
                false
            }
        }
    }

    fn plugin(address: &str) -> Plugin {
        let reg = crate::plugins::PluginRegistry::new(
            Arc::new(crate::plugins::transport::PointToPointTransport::new()),
            Arc::new(crate::plugins::transport::BroadcastTransport::new()),
        );
        reg.apply_scan(vec![serde_json::from_value(serde_json::json!({
            "name": "P",
            "address": address,
            "connectionType": "broadcast",
            "sdkVersion": "1.1.0",
            "profiles": [{"name": "battery"}]
        }))
        .unwrap()]);
        reg.get(&crate::plugins::plugin_id_for_address(address)).unwrap()
    }

    fn session(receiver: &str, plugin_id: &str, token: &str) -> EventSession {
        EventSession {
            receiver_id: receiver.to_string(),
            plugin_id: plugin_id.to_string(),
            path: ApiPath::attribute("battery", "onChargingChange"),
            service_id: Some("meter0".to_string()),
            access_token: Some(token.to_string()),
            created_at_ms: 0,
        }
    }

    fn event_payload(token: &str) -> Map<String, Value> {
        serde_json::from_value::<Map<String, Value>>(serde_json::json!({
            "profile": "Battery",
            "attribute": "onchargingchange",
            "serviceId": "meter0",
            "accessToken": token,
            "charging": true
        }))
        .unwrap()
    }

    // ========================================================================
    // Session table invariants
    // ========================================================================

    #[test]
    fn test_resubscribe_replaces_not_duplicates() {
        let p = plugin("plugin.a");
        let broker = EventBroker::new(None);
        broker.subscribe(session("origin1", &p.id, "tok1"), &p);
        broker.subscribe(session("origin1", &p.id, "tok2"), &p);
        assert_eq!(broker.session_count(), 1);
        // The replacement row carries the newer token.
        assert_eq!(
            broker.sessions_for_plugin(&p.id)[0].access_token.as_deref(),
            Some("tok2")
        );
    }

    #[test]
    fn test_unsubscribe_removes_all_for_key() {
        let p = plugin("plugin.a");
        let broker = EventBroker::new(None);
        broker.subscribe(session("origin1", &p.id, "tok1"), &p);
        let removed = broker.unsubscribe(
            "origin1",
            &p.id,
            &ApiPath::attribute("BATTERY", "onchargingchange"),
        );
        assert_eq!(removed, 1);
        assert_eq!(broker.session_count(), 0);
    }

    #[test]
    fn test_connection_closed_clears_receiver_sessions() {
        let a = plugin("plugin.a");
        let b = plugin("plugin.b");
        let broker = EventBroker::new(None);
        broker.subscribe(session("origin1", &a.id, "t1"), &a);
        broker.subscribe(session("origin1", &b.id, "t2"), &b);
        broker.subscribe(session("origin2", &a.id, "t3"), &a);

        assert_eq!(broker.on_connection_closed("origin1"), 2);
        assert_eq!(broker.session_count(), 1);
    }

    #[test]
    fn test_plugin_lost_clears_its_sessions_and_watch() {
        let a = plugin("plugin.a");
        let b = plugin("plugin.b");
        let monitor = Arc::new(KeepAliveMonitor::new(std::time::Duration::from_secs(30)));
        let broker = EventBroker::new(Some(monitor.clone()));
        broker.subscribe(session("origin1", &a.id, "t1"), &a);
        broker.subscribe(session("origin2", &b.id, "t2"), &b);
        assert!(monitor.is_watched(&a.id));

        assert_eq!(broker.on_plugin_lost(&a.id), 1);
        assert!(!monitor.is_watched(&a.id));
        assert_eq!(broker.session_count(), 1);
    }

    // ========================================================================
    // Fan-out
    // ========================================================================

    #[test]
    fn test_event_matched_rewritten_and_delivered() {
        let p = plugin("plugin.a");
        let broker = EventBroker::new(None);
        let sink = RecordingSink::new("origin1");
        broker.add_sink(sink.clone());
        broker.subscribe(session("origin1", &p.id, "tok1"), &p);

        let delivered = broker.on_event(&p.id, event_payload("tok1"));
        assert_eq!(delivered, 1);

        let events = sink.delivered.lock();
        let event = &events[0];
        // Service id now carries the plugin id suffix; the plugin-side
        // access token never reaches the client.
        assert_eq!(
            event.get("serviceId").unwrap().as_str().unwrap(),
            format!("meter0.{}", p.id)
        );
        assert!(event.get("accessToken").is_none());
        assert_eq!(event.get("charging").unwrap(), &Value::Bool(true));
    }

    #[test]
    fn test_event_token_match_is_case_sensitive() {
        let p = plugin("plugin.a");
        let broker = EventBroker::new(None);
        let sink = RecordingSink::new("origin1");
        broker.add_sink(sink.clone());
        broker.subscribe(session("origin1", &p.id, "Tok1"), &p);

        assert_eq!(broker.on_event(&p.id, event_payload("tok1")), 0);
        assert_eq!(broker.on_event(&p.id, event_payload("Tok1")), 1);
    }

    #[test]
    fn test_event_without_match_dropped() {
        let p = plugin("plugin.a");
        let broker = EventBroker::new(None);
        let sink = RecordingSink::new("origin1");
        broker.add_sink(sink.clone());

        assert_eq!(broker.on_event(&p.id, event_payload("tok1")), 0);
        assert!(sink.delivered.lock().is_empty());
    }

    #[test]
    fn test_legacy_session_key_matching() {
        let p = plugin("plugin.a");
        let broker = EventBroker::new(None);
        let sink = RecordingSink::new("receiver9");
        broker.add_sink(sink.clone());
        let mut s = session("receiver9", &p.id, "unused");
        s.access_token = None;
        broker.subscribe(s, &p);

        let payload = serde_json::from_value::<Map<String, Value>>(serde_json::json!({
            "profile": "battery",
            "attribute": "onChargingChange",
            "serviceId": "meter0",
            "sessionKey": format!("receiver9.{}", p.id),
        }))
        .unwrap();
        assert_eq!(broker.on_event(&p.id, payload), 1);
    }

    #[test]
    fn test_no_further_delivery_after_plugin_loss() {
        let p = plugin("plugin.a");
        let broker = EventBroker::new(None);
        let sink = RecordingSink::new("origin1");
        broker.add_sink(sink.clone());
        broker.subscribe(session("origin1", &p.id, "tok1"), &p);

        broker.on_plugin_lost(&p.id);
        assert_eq!(broker.on_event(&p.id, event_payload("tok1")), 0);
        assert!(sink.delivered.lock().is_empty());
    }
}
