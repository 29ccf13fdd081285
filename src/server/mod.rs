//! Server module
//!
//! HTTP REST surface, WebSocket event channel, and the shared wiring
//! behind both.

pub mod files;
pub mod http;
pub mod ws;

use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

use crate::events::EventBroker;
use crate::oauth::AuthServer;
use crate::plugins::{Plugin, PluginEventListener, PluginRegistry};
use crate::router::Router;
use crate::trust::TrustManager;
use files::FileCatalog;
use ws::WsSessionHub;

/// Shared state behind every HTTP and WebSocket handler.
pub struct GatewayContext {
    pub router: Arc<Router>,
    pub registry: Arc<PluginRegistry>,
    pub auth: Arc<AuthServer>,
    pub trust: Arc<TrustManager>,
    pub broker: Arc<EventBroker>,
    pub catalog: Arc<FileCatalog>,
    pub ws_hub: Arc<WsSessionHub>,
}

impl GatewayContext {
    /// Tie the pieces together: the WebSocket hub becomes the broker's
    /// delivery sink, and plugin loss tears down both event sessions and
    /// the plugin's OAuth data.
    pub fn new(
        router: Arc<Router>,
        registry: Arc<PluginRegistry>,
        auth: Arc<AuthServer>,
        trust: Arc<TrustManager>,
        broker: Arc<EventBroker>,
    ) -> Arc<Self> {
        let ws_hub = Arc::new(WsSessionHub::new());
        broker.add_sink(ws_hub.clone());
        registry.add_listener(Arc::new(PluginLossCleanup {
            broker: Arc::clone(&broker),
            auth: Arc::clone(&auth),
        }));
        router.start();
        Arc::new(GatewayContext {
            router,
            registry,
            auth,
            trust,
            broker,
            catalog: Arc::new(FileCatalog::new()),
            ws_hub,
        })
    }
}

/// Registry listener that runs the loss cleanup path.
struct PluginLossCleanup {
    broker: Arc<EventBroker>,
    auth: Arc<AuthServer>,
}

impl PluginEventListener for PluginLossCleanup {
    fn on_plugin_lost(&self, plugin: &Plugin) {
        let removed = self.broker.on_plugin_lost(&plugin.id);
        info!(
            target: "plugins",
            plugin_id = %plugin.id,
            sessions = removed,
            "cleaned up after plugin loss"
        );
        if let Err(e) = self.auth.destroy_plugin_data(&plugin.id) {
            warn!(
                target: "plugins",
                plugin_id = %plugin.id,
                error = %e,
                "failed to destroy plugin authorization data"
            );
        }
    }
}

/// Bind and serve until the task is cancelled.
pub async fn serve(context: Arc<GatewayContext>, addr: SocketAddr) -> std::io::Result<()> {
    let app = http::create_router(context);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(target: "http", %addr, "gateway listening");
    axum::serve(listener, app).await
}
