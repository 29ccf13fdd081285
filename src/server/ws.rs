//! WebSocket event delivery
//!
//! Clients open `/gotapi/websocket`, send one JSON handshake frame, and
//! then receive matched plugin events as flat JSON objects. Strict-mode
//! handshakes carry an access token validated against the connection
//! origin; the legacy form carries a session key and skips validation.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, HeaderMap};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::events::EventSink;
use crate::protocol::{
    FIELD_ACCESS_TOKEN, FIELD_ERROR_CODE, FIELD_ERROR_MESSAGE, FIELD_RESULT, FIELD_SESSION_KEY,
    HEADER_GOTAPI_ORIGIN, RESULT_ERROR, RESULT_OK,
};
use crate::server::GatewayContext;

/// Handshake must arrive within this window or the socket is dropped.
const HANDSHAKE_TIMEOUT_SECS: u64 = 10;

// Handshake error codes; a fixed space separate from the REST codes.
const WS_ERROR_NOT_FOUND_ACCESS_TOKEN: i64 = 1;
const WS_ERROR_NOT_FOUND_ORIGIN: i64 = 2;
const WS_ERROR_INVALID_ACCESS_TOKEN: i64 = 3;
const WS_ERROR_ALREADY_ESTABLISHED: i64 = 4;

/// Live WebSocket connections keyed by receiver identity. Doubles as the
/// broker's delivery sink.
pub struct WsSessionHub {
    connections: Mutex<HashMap<String, mpsc::UnboundedSender<Message>>>,
}

impl WsSessionHub {
    pub fn new() -> Self {
        WsSessionHub {
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Claim the receiver identity. Fails when another live connection
    /// already holds it.
    fn claim(&self, receiver_id: &str, tx: mpsc::UnboundedSender<Message>) -> bool {
        let mut connections = self.connections.lock();
        if connections.contains_key(receiver_id) {
            return false;
        }
        connections.insert(receiver_id.to_string(), tx);
        true
    }

    fn release(&self, receiver_id: &str) {
        self.connections.lock().remove(receiver_id);
    }

    pub fn is_connected(&self, receiver_id: &str) -> bool {
        self.connections.lock().contains_key(receiver_id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }
}

impl Default for WsSessionHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for WsSessionHub {
    fn deliver(&self, receiver_id: &str, event: &Map<String, Value>) -> bool {
        let sender = {
            let connections = self.connections.lock();
            connections.get(receiver_id).cloned()
        };
        let Some(sender) = sender else {
            return false;
        };
        let text = Value::Object(event.clone()).to_string();
        sender.send(Message::Text(text)).is_ok()
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(context): State<Arc<GatewayContext>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let origin = connection_origin(&headers);
    ws.on_upgrade(move |socket| handle_socket(socket, context, origin))
}

/// Native origin header beats the browser-supplied one, same as REST.
fn connection_origin(headers: &HeaderMap) -> Option<String> {
    let native = headers
        .get(HEADER_GOTAPI_ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty());
    let web = headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty());
    native.or(web).map(str::to_string)
}

async fn handle_socket(socket: WebSocket, context: Arc<GatewayContext>, origin: Option<String>) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    let handshake = tokio::time::timeout(
        Duration::from_secs(HANDSHAKE_TIMEOUT_SECS),
        recv_text(&mut receiver),
    )
    .await;
    let text = match handshake {
        Ok(Some(text)) => text,
        Ok(None) => {
            send_task.abort();
            return;
        }
        Err(_) => {
            debug!(target: "ws", "handshake timed out");
            send_task.abort();
            return;
        }
    };

    let receiver_id = match establish(&context, origin.as_deref(), &text) {
        Ok(receiver_id) => receiver_id,
        Err((code, message)) => {
            let _ = tx.send(Message::Text(
                json!({
                    FIELD_RESULT: RESULT_ERROR,
                    FIELD_ERROR_CODE: code,
                    FIELD_ERROR_MESSAGE: message,
                })
                .to_string(),
            ));
            debug!(target: "ws", code, message, "handshake rejected");
            return;
        }
    };

    if !context.ws_hub.claim(&receiver_id, tx.clone()) {
        let _ = tx.send(Message::Text(
            json!({
                FIELD_RESULT: RESULT_ERROR,
                FIELD_ERROR_CODE: WS_ERROR_ALREADY_ESTABLISHED,
                FIELD_ERROR_MESSAGE: "Connection is already established.",
            })
            .to_string(),
        ));
        return;
    }
    let _ = tx.send(Message::Text(json!({ FIELD_RESULT: RESULT_OK }).to_string()));
    info!(target: "ws", receiver = %receiver_id, "event channel established");

    // Inbound frames after the handshake are ignored; the socket exists
    // for server push only.
    while let Some(frame) = receiver.next().await {
        match frame {
            Ok(Message::Close(_)) | Err(_) => break,
            _ => {}
        }
    }

    context.ws_hub.release(&receiver_id);
    let removed = context.broker.on_connection_closed(&receiver_id);
    info!(
        target: "ws",
        receiver = %receiver_id,
        sessions = removed,
        "event channel closed"
    );
    send_task.abort();
}

async fn recv_text(receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin)) -> Option<String> {
    while let Some(frame) = receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => return Some(text),
            Ok(Message::Close(_)) | Err(_) => return None,
            _ => {}
        }
    }
    None
}

/// Validate the handshake frame and yield the receiver identity the
/// connection will be keyed by.
fn establish(
    context: &GatewayContext,
    origin: Option<&str>,
    text: &str,
) -> Result<String, (i64, &'static str)> {
    let frame: Value = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(target: "ws", error = %e, "malformed handshake frame");
            return Err((WS_ERROR_NOT_FOUND_ACCESS_TOKEN, "Handshake frame is not JSON."));
        }
    };

    let access_token = frame
        .get(FIELD_ACCESS_TOKEN)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty());
    let session_key = frame
        .get(FIELD_SESSION_KEY)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty());

    match (access_token, session_key) {
        (Some(token), _) => {
            let Some(origin) = origin else {
                return Err((WS_ERROR_NOT_FOUND_ORIGIN, "Origin is required."));
            };
            match context.auth.package_for_token(token) {
                Some(package) if package == origin => Ok(origin.to_string()),
                _ => Err((
                    WS_ERROR_INVALID_ACCESS_TOKEN,
                    "Access token is invalid for this origin.",
                )),
            }
        }
        // Legacy handshake: the key itself is the receiver identity.
        (None, Some(key)) => Ok(key.to_string()),
        (None, None) => Err((WS_ERROR_NOT_FOUND_ACCESS_TOKEN, "accessToken is required.")),
    }
}
