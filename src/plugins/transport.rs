//! Addressable message transport
//!
//! The registry never talks to a plugin process directly; it sends through
//! an addressable transport. Two adapters cover the connection flavors:
//! a point-to-point adapter with one channel per registered destination,
//! and a broadcast adapter where every endpoint sees every message and
//! filters by destination itself.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

/// Broadcast channel depth before lagging receivers start losing messages.
const BROADCAST_CAPACITY: usize = 256;

/// Message kinds crossing the plugin boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageKind {
    Request,
    Response,
    Event,
}

/// A message addressed to (or arriving from) a plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportMessage {
    pub kind: MessageKind,
    /// Transport address of the destination (outbound) or source (inbound).
    pub address: String,
    pub payload: Map<String, Value>,
}

impl TransportMessage {
    pub fn request(address: &str, payload: Map<String, Value>) -> Self {
        TransportMessage {
            kind: MessageKind::Request,
            address: address.to_string(),
            payload,
        }
    }

    pub fn response(address: &str, payload: Map<String, Value>) -> Self {
        TransportMessage {
            kind: MessageKind::Response,
            address: address.to_string(),
            payload,
        }
    }

    pub fn event(address: &str, payload: Map<String, Value>) -> Self {
        TransportMessage {
            kind: MessageKind::Event,
            address: address.to_string(),
            payload,
        }
    }
}

/// Failure to move a message across the plugin boundary. Never swallowed;
/// callers log and surface a generic failure to the client.
#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("no endpoint registered for destination '{0}'")]
    UnknownDestination(String),
    #[error("endpoint for '{0}' is gone")]
    EndpointClosed(String),
    #[error("transport has no connected receivers")]
    NoReceivers,
}

/// Abstract addressable transport the registry depends on.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Deliver a message toward the named destination.
    async fn send(&self, destination: &str, message: TransportMessage)
        -> Result<(), MessagingError>;

    /// Register an endpoint and obtain its inbound stream.
    fn attach(&self, address: &str) -> mpsc::UnboundedReceiver<TransportMessage>;

    /// Remove an endpoint; subsequent sends to it fail.
    fn detach(&self, address: &str);
}

/// Point-to-point adapter: one dedicated channel per destination address.
pub struct PointToPointTransport {
    endpoints: RwLock<HashMap<String, mpsc::UnboundedSender<TransportMessage>>>,
}

impl PointToPointTransport {
    pub fn new() -> Self {
        PointToPointTransport {
            endpoints: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for PointToPointTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageTransport for PointToPointTransport {
    async fn send(
        &self,
        destination: &str,
        message: TransportMessage,
    ) -> Result<(), MessagingError> {
        let sender = {
            let endpoints = self.endpoints.read();
            endpoints
                .get(destination)
                .cloned()
                .ok_or_else(|| MessagingError::UnknownDestination(destination.to_string()))?
        };
        sender
            .send(message)
            .map_err(|_| MessagingError::EndpointClosed(destination.to_string()))
    }

    fn attach(&self, address: &str) -> mpsc::UnboundedReceiver<TransportMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.endpoints.write().insert(address.to_string(), tx);
        rx
    }

    fn detach(&self, address: &str) {
        self.endpoints.write().remove(address);
    }
}

/// Broadcast adapter: every attached endpoint receives every message and
/// filters by the address field.
pub struct BroadcastTransport {
    tx: broadcast::Sender<TransportMessage>,
    /// Relay tasks forwarding the shared stream into per-endpoint channels.
    relays: RwLock<HashMap<String, tokio::task::JoinHandle<()>>>,
}

impl BroadcastTransport {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        BroadcastTransport {
            tx,
            relays: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for BroadcastTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageTransport for BroadcastTransport {
    async fn send(
        &self,
        _destination: &str,
        message: TransportMessage,
    ) -> Result<(), MessagingError> {
        self.tx
            .send(message)
            .map(|_| ())
            .map_err(|_| MessagingError::NoReceivers)
    }

    fn attach(&self, address: &str) -> mpsc::UnboundedReceiver<TransportMessage> {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let mut shared = self.tx.subscribe();
        let address_owned = address.to_string();
        let handle = tokio::spawn(async move {
            loop {
                match shared.recv().await {
                    Ok(msg) => {
                        if msg.address == address_owned && out_tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            target: "plugins",
                            address = %address_owned,
                            skipped,
                            "broadcast endpoint lagged, messages dropped"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        if let Some(old) = self.relays.write().insert(address.to_string(), handle) {
            old.abort();
        }
        out_rx
    }

    fn detach(&self, address: &str) {
        if let Some(handle) = self.relays.write().remove(address) {
            handle.abort();
        }
    }
}
