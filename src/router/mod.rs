//! Request router
//!
//! Front door for every parsed client request. Validates the origin,
//! enforces token scopes, answers the built-in profiles locally, and
//! forwards everything else to the owning plugin through the transport
//! layer, correlating the asynchronous reply back to the waiting caller.

pub mod correlation;

use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::events::keepalive::{KeepAliveMonitor, PING_ATTRIBUTE};
use crate::events::{EventBroker, EventSession};
use crate::oauth::{AuthServer, OAuthError, PublishTokenParams};
use crate::plugins::{
    plugin_id_for_address, split_service_id, ConnectionState, Plugin, PluginError, PluginRegistry,
};
use crate::plugins::manifest::ConnectionType;
use crate::plugins::transport::{MessageKind, TransportMessage};
use crate::protocol::{
    error_response, error_response_with_message, success_response, ErrorCode, GatewayRequest,
    Method, ANONYMOUS_ORIGIN, DEFAULT_API, FIELD_ACCESS_TOKEN, FIELD_HMAC, FIELD_NONCE,
    FIELD_PRODUCT, FIELD_SERVICE_ID, FIELD_VERSION,
};
use crate::trust::TrustManager;
use correlation::{CorrelationArena, FIELD_REQUEST_CODE};

/// Transport address the gateway itself listens on for plugin replies and
/// events.
pub const GATEWAY_ADDRESS: &str = "switchyard.gateway";

/// Profiles answered by the gateway without touching a plugin.
pub const PROFILE_AVAILABILITY: &str = "availability";
pub const PROFILE_AUTHORIZATION: &str = "authorization";
pub const PROFILE_SERVICE_DISCOVERY: &str = "serviceDiscovery";
pub const PROFILE_SYSTEM: &str = "system";
pub const PROFILE_FILES: &str = "files";

/// Profiles that never require an access token.
pub const TOKEN_EXEMPT_PROFILES: &[&str] = &[
    PROFILE_AUTHORIZATION,
    PROFILE_AVAILABILITY,
    PROFILE_SERVICE_DISCOVERY,
    PROFILE_FILES,
];

const ATTR_GRANT: &str = "grant";
const ATTR_ACCESS_TOKEN: &str = "accesstoken";
const INTERFACE_DEVICE: &str = "device";
const ATTR_WAKEUP: &str = "wakeup";
const PARAM_PLUGIN_ID: &str = "pluginId";
const PARAM_CLIENT_ID: &str = "clientId";
const PARAM_APPLICATION_NAME: &str = "applicationName";
const PARAM_SCOPE: &str = "scope";
const PARAM_HMAC_KEY: &str = "key";

/// Router knobs fixed at startup.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub product: String,
    pub version: String,
    /// How long a forwarded request may wait for its plugin reply.
    pub request_timeout: Duration,
    /// When off, scope enforcement is skipped entirely.
    pub local_oauth: bool,
    pub locale: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        RouterConfig {
            product: "Switchyard".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            request_timeout: Duration::from_secs(60),
            local_oauth: true,
            locale: "en".to_string(),
        }
    }
}

pub struct Router {
    config: RouterConfig,
    registry: Arc<PluginRegistry>,
    auth: Arc<AuthServer>,
    trust: Arc<TrustManager>,
    broker: Arc<EventBroker>,
    keepalive: Option<Arc<KeepAliveMonitor>>,
    arena: CorrelationArena,
}

impl Router {
    pub fn new(
        config: RouterConfig,
        registry: Arc<PluginRegistry>,
        auth: Arc<AuthServer>,
        trust: Arc<TrustManager>,
        broker: Arc<EventBroker>,
        keepalive: Option<Arc<KeepAliveMonitor>>,
    ) -> Self {
        Router {
            config,
            registry,
            auth,
            trust,
            broker,
            keepalive,
            arena: CorrelationArena::new(),
        }
    }

    pub fn pending_requests(&self) -> usize {
        self.arena.pending_count()
    }

    /// Attach the gateway endpoint on both transports and pump inbound
    /// plugin messages into the router.
    pub fn start(self: &Arc<Self>) {
        for connection_type in [ConnectionType::PointToPoint, ConnectionType::Broadcast] {
            let mut rx = self
                .registry
                .transport_for(connection_type)
                .attach(GATEWAY_ADDRESS);
            let router = Arc::clone(self);
            tokio::spawn(async move {
                while let Some(message) = rx.recv().await {
                    router.on_plugin_message(message);
                }
            });
        }
    }

    /// Handle a message arriving from a plugin. Responses complete their
    /// pending correlation slot; events go to the broker, with keep-alive
    /// pongs intercepted for the liveness monitor.
    pub fn on_plugin_message(&self, message: TransportMessage) {
        match message.kind {
            MessageKind::Response => {
                let Some(correlation_id) = message
                    .payload
                    .get(FIELD_REQUEST_CODE)
                    .and_then(|v| v.as_u64())
                else {
                    warn!(target: "gateway", "plugin response without a request code");
                    return;
                };
                self.arena.complete(correlation_id, message.payload);
            }
            MessageKind::Event => {
                let plugin_id = plugin_id_for_address(&message.address);
                let is_pong = message
                    .payload
                    .get("attribute")
                    .and_then(|v| v.as_str())
                    .map(|a| a.eq_ignore_ascii_case(PING_ATTRIBUTE))
                    .unwrap_or(false);
                if is_pong {
                    if let Some(keepalive) = &self.keepalive {
                        keepalive.record_pong(&plugin_id);
                    }
                    return;
                }
                self.broker.on_event(&plugin_id, message.payload);
            }
            MessageKind::Request => {
                debug!(target: "gateway", address = %message.address, "ignoring plugin-originated request");
            }
        }
    }

    /// Run one client request through the full pipeline and produce the
    /// response envelope.
    pub async fn route(
        &self,
        native_origin: Option<&str>,
        web_origin: Option<&str>,
        mut request: GatewayRequest,
    ) -> Map<String, Value> {
        let (validity, origin) = self.trust.check_origin(native_origin, web_origin);
        let response = match validity.error_code() {
            Some(code) => error_response_with_message(code, validity.message()),
            None => {
                request.origin = origin;
                self.refresh_hmac_key(&request);
                self.dispatch_request(request.clone()).await
            }
        };
        self.finish_response(response, &request)
    }

    /// Clients rotate their anti-spoofing key by attaching it to any
    /// request.
    fn refresh_hmac_key(&self, request: &GatewayRequest) {
        let (Some(origin), Some(key)) = (&request.origin, request.param(PARAM_HMAC_KEY)) else {
            return;
        };
        if origin.value != ANONYMOUS_ORIGIN && self.trust.enable_hmac(&origin.value, key) {
            debug!(target: "gateway", origin = %origin.value, "updated response signing key");
        }
    }

    async fn dispatch_request(&self, request: GatewayRequest) -> Map<String, Value> {
        let profile = request.path.profile.clone();

        if profile.eq_ignore_ascii_case(PROFILE_AVAILABILITY) {
            return self.handle_availability(&request);
        }
        if profile.eq_ignore_ascii_case(PROFILE_AUTHORIZATION) {
            return self.handle_authorization(&request).await;
        }

        if self.config.local_oauth {
            if let Some(error) = self.enforce_access_token(&request) {
                return error;
            }
        }

        if profile.eq_ignore_ascii_case(PROFILE_SERVICE_DISCOVERY) {
            return self.handle_service_discovery(&request);
        }
        if profile.eq_ignore_ascii_case(PROFILE_SYSTEM) {
            return self.handle_system(&request).await;
        }

        self.forward(&request).await
    }

    // ------------------------------------------------------------------
    // Token enforcement
    // ------------------------------------------------------------------

    /// Scope check against the profile name. Returns the error envelope to
    /// short-circuit with, or None when the request may proceed.
    fn enforce_access_token(&self, request: &GatewayRequest) -> Option<Map<String, Value>> {
        let check = self.auth.check_access_token(
            request.access_token.as_deref(),
            &request.path.profile,
            Some(TOKEN_EXEMPT_PROFILES),
        );
        if check.is_valid() {
            return None;
        }
        let code = if request.access_token.as_deref().unwrap_or("").is_empty() {
            ErrorCode::EmptyAccessToken
        } else if !check.exists_access_token || !check.exists_client_id {
            ErrorCode::NotFoundClientId
        } else if !check.exists_scope {
            ErrorCode::Scope
        } else {
            ErrorCode::ExpiredAccessToken
        };
        Some(error_response(code))
    }

    // ------------------------------------------------------------------
    // Built-in profiles
    // ------------------------------------------------------------------

    fn handle_availability(&self, request: &GatewayRequest) -> Map<String, Value> {
        if request.method != Method::Get {
            return error_response(ErrorCode::NotSupportAction);
        }
        success_response()
    }

    async fn handle_authorization(&self, request: &GatewayRequest) -> Map<String, Value> {
        if request.method != Method::Get {
            return error_response(ErrorCode::NotSupportAction);
        }
        match request.path.attribute.as_deref() {
            Some(a) if a.eq_ignore_ascii_case(ATTR_GRANT) => self.handle_grant(request),
            Some(a) if a.eq_ignore_ascii_case(ATTR_ACCESS_TOKEN) => {
                self.handle_access_token(request).await
            }
            _ => error_response(ErrorCode::UnknownAttribute),
        }
    }

    fn handle_grant(&self, request: &GatewayRequest) -> Map<String, Value> {
        let package = match &request.origin {
            Some(origin) => origin.value.clone(),
            None => ANONYMOUS_ORIGIN.to_string(),
        };
        match self.auth.create_client(&package, None) {
            Ok(credentials) => {
                let mut response = success_response();
                response.insert(PARAM_CLIENT_ID.to_string(), json!(credentials.client_id));
                response
            }
            Err(e) => {
                warn!(target: "auth", package = %package, error = %e, "client registration refused");
                error_response_with_message(ErrorCode::Authorization, &e.to_string())
            }
        }
    }

    async fn handle_access_token(&self, request: &GatewayRequest) -> Map<String, Value> {
        let Some(client_id) = request.param(PARAM_CLIENT_ID) else {
            return error_response_with_message(ErrorCode::InvalidRequestParameter, "clientId is required.");
        };
        let Some(application_name) = request.param(PARAM_APPLICATION_NAME) else {
            return error_response_with_message(
                ErrorCode::InvalidRequestParameter,
                "applicationName is required.",
            );
        };
        let scopes: Vec<String> = request
            .param(PARAM_SCOPE)
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        let plugin = self
            .auth
            .client(client_id)
            .and_then(|c| c.plugin_id)
            .and_then(|id| self.registry.get(&id));
        let manifest = plugin.as_ref().map(|p| &p.manifest);

        let params = PublishTokenParams {
            client_id: client_id.to_string(),
            application_name: application_name.to_string(),
            scopes,
            plugin_id: plugin.as_ref().map(|p| p.id.clone()),
        };
        match self
            .auth
            .confirm_publish_access_token(params, manifest, &self.config.locale)
            .await
        {
            Ok(Some(token)) => {
                let scopes: Vec<Value> = token
                    .scopes
                    .iter()
                    .map(|g| {
                        json!({
                            "scope": g.scope,
                            "expirePeriod": g.expire_period_secs,
                        })
                    })
                    .collect();
                let mut response = success_response();
                response.insert(FIELD_ACCESS_TOKEN.to_string(), json!(token.access_token));
                response.insert("scopes".to_string(), Value::Array(scopes));
                response
            }
            Ok(None) => error_response_with_message(
                ErrorCode::Authorization,
                "The access token request was denied.",
            ),
            Err(OAuthError::InvalidParameter(name)) => error_response_with_message(
                ErrorCode::InvalidRequestParameter,
                &format!("{name} is invalid."),
            ),
            Err(OAuthError::UnknownClient(_)) => error_response(ErrorCode::NotFoundClientId),
            Err(e) => error_response_with_message(ErrorCode::Authorization, &e.to_string()),
        }
    }

    fn handle_service_discovery(&self, request: &GatewayRequest) -> Map<String, Value> {
        if request.method != Method::Get {
            return error_response(ErrorCode::NotSupportAction);
        }
        let services: Vec<Value> = self
            .registry
            .list()
            .into_iter()
            .filter(|p| p.enabled)
            .map(|p| {
                json!({
                    "id": p.id,
                    "name": p.name,
                    "online": p.state == ConnectionState::Connected,
                    "config": p.address,
                })
            })
            .collect();
        let mut response = success_response();
        response.insert("services".to_string(), Value::Array(services));
        response
    }

    async fn handle_system(&self, request: &GatewayRequest) -> Map<String, Value> {
        // Wake-up addresses a plugin directly and skips profile matching.
        if request.path.interface.as_deref() == Some(INTERFACE_DEVICE)
            && request.path.attribute.as_deref() == Some(ATTR_WAKEUP)
        {
            return self.handle_wakeup(request).await;
        }
        if request.method != Method::Get {
            return error_response(ErrorCode::NotSupportAction);
        }
        if request.path.interface.is_some() || request.path.attribute.is_some() {
            return error_response(ErrorCode::UnknownAttribute);
        }

        let plugins = self.registry.list();
        let mut supports: Vec<String> = plugins
            .iter()
            .filter(|p| p.enabled)
            .flat_map(|p| p.manifest.profiles.iter().map(|d| d.name.clone()))
            .collect();
        supports.sort();
        supports.dedup();

        let plugin_entries: Vec<Value> = plugins
            .iter()
            .map(|p| {
                json!({
                    "id": p.id,
                    "name": p.name,
                    "packageName": p.address,
                    "version": p.manifest.sdk_version,
                })
            })
            .collect();

        let mut response = success_response();
        response.insert("supports".to_string(), json!(supports));
        response.insert("plugins".to_string(), Value::Array(plugin_entries));
        response
    }

    async fn handle_wakeup(&self, request: &GatewayRequest) -> Map<String, Value> {
        if request.method != Method::Put {
            return error_response(ErrorCode::NotSupportAction);
        }
        let Some(plugin_id) = request.param(PARAM_PLUGIN_ID) else {
            return error_response_with_message(
                ErrorCode::InvalidRequestParameter,
                "pluginId is required.",
            );
        };
        let Some(plugin) = self.registry.get(plugin_id) else {
            return error_response(ErrorCode::NotFoundService);
        };
        self.forward_to_plugin(&plugin, None, request).await
    }

    // ------------------------------------------------------------------
    // Plugin delivery
    // ------------------------------------------------------------------

    /// Resolve the destination plugin and deliver the request to it.
    async fn forward(&self, request: &GatewayRequest) -> Map<String, Value> {
        let (plugin, local_service_id) = match &request.service_id {
            Some(service_id) => {
                let Some((local, plugin_id)) = split_service_id(service_id) else {
                    return error_response(ErrorCode::NotFoundService);
                };
                let Some(plugin) = self.registry.get(plugin_id) else {
                    return error_response(ErrorCode::NotFoundService);
                };
                (plugin, Some(local.to_string()))
            }
            None => {
                let mut candidates = self.registry.find_by_profile(&request.path.profile);
                if candidates.is_empty() {
                    return error_response(ErrorCode::NotSupportProfile);
                }
                (candidates.remove(0), None)
            }
        };
        let response = self
            .forward_to_plugin(&plugin, local_service_id.as_deref(), request)
            .await;
        self.track_event_session(&plugin, local_service_id.as_deref(), request, &response);
        response
    }

    async fn forward_to_plugin(
        &self,
        plugin: &Plugin,
        local_service_id: Option<&str>,
        request: &GatewayRequest,
    ) -> Map<String, Value> {
        let handle = self.arena.insert();

        let mut payload = request.params.clone();
        payload.insert(FIELD_REQUEST_CODE.to_string(), json!(handle.correlation_id));
        payload.insert("api".to_string(), json!(DEFAULT_API));
        payload.insert("action".to_string(), json!(request.method.as_str()));
        payload.insert("profile".to_string(), json!(request.path.profile));
        if let Some(interface) = &request.path.interface {
            payload.insert("interface".to_string(), json!(interface));
        }
        if let Some(attribute) = &request.path.attribute {
            payload.insert("attribute".to_string(), json!(attribute));
        }
        if let Some(service_id) = local_service_id {
            payload.insert(FIELD_SERVICE_ID.to_string(), json!(service_id));
        }
        if let Some(token) = &request.access_token {
            payload.insert(FIELD_ACCESS_TOKEN.to_string(), json!(token));
        }
        if let Some(origin) = &request.origin {
            payload.insert("origin".to_string(), json!(origin.value));
        }
        if let Some(uri) = &request.file_uri {
            payload.insert("uri".to_string(), json!(uri));
        }

        let message = TransportMessage::request(&plugin.address, payload);
        if let Err(e) = self.registry.dispatch(&plugin.id, message).await {
            self.arena.evict(handle.correlation_id);
            return match e {
                PluginError::NotFound(_) => error_response(ErrorCode::NotFoundService),
                PluginError::Disabled(_) => error_response_with_message(
                    ErrorCode::IllegalServerState,
                    "Plugin is disabled.",
                ),
                PluginError::Messaging(_) => {
                    error_response_with_message(ErrorCode::Unknown, "Plugin is unreachable.")
                }
            };
        }

        let mut response = self.arena.wait(handle, self.config.request_timeout).await;
        response.remove(FIELD_REQUEST_CODE);
        rewrite_service_ids(&mut response, &plugin.id);
        response
    }

    /// PUT registers an event subscription, DELETE removes it. Bookkeeping
    /// happens only after the plugin accepted the change.
    fn track_event_session(
        &self,
        plugin: &Plugin,
        local_service_id: Option<&str>,
        request: &GatewayRequest,
        response: &Map<String, Value>,
    ) {
        if !crate::protocol::is_success(response) {
            return;
        }
        let receiver_id = match &request.origin {
            Some(origin) => origin.value.clone(),
            None => return,
        };
        match request.method {
            Method::Put => {
                let session = EventSession {
                    receiver_id,
                    plugin_id: plugin.id.clone(),
                    path: request.path.clone(),
                    service_id: local_service_id.map(str::to_string),
                    access_token: request.access_token.clone(),
                    created_at_ms: chrono::Utc::now().timestamp_millis(),
                };
                self.broker.subscribe(session, plugin);
            }
            Method::Delete => {
                self.broker
                    .unsubscribe(&receiver_id, &plugin.id, &request.path);
            }
            _ => {}
        }
    }

    // ------------------------------------------------------------------
    // Response post-processing
    // ------------------------------------------------------------------

    /// Stamp product identity and, for origins with a registered signing
    /// key, the response HMAC over the request nonce.
    fn finish_response(
        &self,
        mut response: Map<String, Value>,
        request: &GatewayRequest,
    ) -> Map<String, Value> {
        response.insert(FIELD_PRODUCT.to_string(), json!(self.config.product));
        response.insert(FIELD_VERSION.to_string(), json!(self.config.version));

        if let Some(nonce) = &request.nonce {
            if let Some(origin) = self.signing_origin(request) {
                match self.trust.generate_hmac(&origin, nonce) {
                    Some(hmac) => {
                        response.insert(FIELD_HMAC.to_string(), json!(hmac));
                    }
                    None => {
                        debug!(target: "gateway", origin = %origin, "nonce present but no signing key");
                    }
                }
            }
        }
        response.remove(FIELD_NONCE);
        response
    }

    /// Origin used for response signing. Anonymous requests fall back to
    /// the package the access token was issued to.
    fn signing_origin(&self, request: &GatewayRequest) -> Option<String> {
        match &request.origin {
            Some(origin) if origin.value != ANONYMOUS_ORIGIN => Some(origin.value.clone()),
            _ => request
                .access_token
                .as_deref()
                .and_then(|token| self.auth.package_for_token(token)),
        }
    }
}

/// Append the plugin id suffix to every client-visible service id in a
/// plugin response, both the top-level field and discovery result entries.
fn rewrite_service_ids(response: &mut Map<String, Value>, plugin_id: &str) {
    if let Some(Value::String(service_id)) = response.get_mut(FIELD_SERVICE_ID) {
        *service_id = crate::plugins::append_plugin_id(service_id, plugin_id);
    }
    if let Some(Value::Array(services)) = response.get_mut("services") {
        for service in services {
            if let Some(Value::String(id)) = service.get_mut("id") {
                *id = crate::plugins::append_plugin_id(id, plugin_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oauth::store::MemoryStorage;
    use crate::plugins::discovery::StaticDiscovery;
    use crate::plugins::manifest::{ConnectionType, Manifest, ProfileDecl};
    use crate::plugins::transport::{BroadcastTransport, MessageTransport, PointToPointTransport};
    use crate::protocol::{parse_api_path, FIELD_ERROR_CODE, FIELD_RESULT};
    use crate::trust::OriginPolicy;
    use std::collections::HashMap;

    // ==================================================================
    // Test fixtures
    // ==================================================================

    fn manifest(address: &str, profiles: &[&str]) -> Manifest {
        Manifest {
            name: format!("{address} plugin"),
            address: address.to_string(),
            connection_type: ConnectionType::PointToPoint,
            sdk_version: "1.1.0".to_string(),
            profiles: profiles
                .iter()
                .map(|p| ProfileDecl {
                    name: p.to_string(),
                    expire_period: None,
                    localized_names: HashMap::new(),
                })
                .collect(),
        }
    }

    struct Fixture {
        router: Arc<Router>,
        registry: Arc<PluginRegistry>,
        auth: Arc<AuthServer>,
        trust: Arc<TrustManager>,
        broker: Arc<EventBroker>,
        point_to_point: Arc<PointToPointTransport>,
    }

    async fn fixture_with(config: RouterConfig, manifests: Vec<Manifest>) -> Fixture {
        let point_to_point = Arc::new(PointToPointTransport::new());
        let point_to_point_dyn: Arc<dyn MessageTransport> = point_to_point.clone();
        let broadcast: Arc<dyn MessageTransport> = Arc::new(BroadcastTransport::new());
        let registry = Arc::new(PluginRegistry::new(point_to_point_dyn, broadcast));
        registry.scan(&StaticDiscovery::new(manifests)).await;
        for plugin in registry.list() {
            let _ = registry.connect(&plugin.id);
        }

        let auth = Arc::new(AuthServer::new(Box::new(MemoryStorage), false));
        let trust = Arc::new(TrustManager::new(OriginPolicy {
            require_origin: false,
            restrict_origins: false,
        }));
        let broker = Arc::new(EventBroker::new(None));
        let router = Arc::new(Router::new(
            config,
            registry.clone(),
            auth.clone(),
            trust.clone(),
            broker.clone(),
            None,
        ));
        router.start();
        Fixture {
            router,
            registry,
            auth,
            trust,
            broker,
            point_to_point,
        }
    }

    async fn fixture(manifests: Vec<Manifest>) -> Fixture {
        fixture_with(RouterConfig::default(), manifests).await
    }

    /// Run a plugin stub that answers every request with a success echo.
    fn spawn_echo_plugin(fixture: &Fixture, address: &str, extra: Map<String, Value>) {
        let mut rx = fixture.point_to_point.attach(address);
        let transport = fixture.point_to_point.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let mut payload = success_response();
                if let Some(code) = message.payload.get(FIELD_REQUEST_CODE) {
                    payload.insert(FIELD_REQUEST_CODE.to_string(), code.clone());
                }
                for (k, v) in extra.clone() {
                    payload.insert(k, v);
                }
                let reply = TransportMessage::response(GATEWAY_ADDRESS, payload);
                let _ = transport.send(GATEWAY_ADDRESS, reply).await;
            }
        });
    }

    fn get_request(path: &[&str]) -> GatewayRequest {
        let (method, api_path) = parse_api_path(path, Method::Get).unwrap();
        GatewayRequest::new(method, api_path)
    }

    fn error_code_of(response: &Map<String, Value>) -> Option<i64> {
        response.get(FIELD_ERROR_CODE).and_then(|v| v.as_i64())
    }

    async fn grant_client(fixture: &Fixture, origin: &str) -> String {
        let response = fixture
            .router
            .route(Some(origin), None, get_request(&["availability"]))
            .await;
        assert_eq!(response.get(FIELD_RESULT).unwrap().as_i64(), Some(0));
        let response = fixture
            .router
            .route(Some(origin), None, get_request(&["authorization", "grant"]))
            .await;
        response
            .get(PARAM_CLIENT_ID)
            .and_then(|v| v.as_str())
            .unwrap()
            .to_string()
    }

    // ==================================================================
    // Origin and availability
    // ==================================================================

    #[tokio::test]
    async fn test_availability_needs_no_token() {
        let f = fixture(vec![]).await;
        let response = f
            .router
            .route(Some("com.example.app"), None, get_request(&["availability"]))
            .await;
        assert_eq!(response.get(FIELD_RESULT).unwrap().as_i64(), Some(0));
        assert!(response.get(FIELD_PRODUCT).is_some());
        assert!(response.get(FIELD_VERSION).is_some());
    }

    #[tokio::test]
    async fn test_conflicting_origins_rejected() {
        let f = fixture(vec![]).await;
        let response = f
            .router
            .route(
                Some("com.example.app"),
                Some("https://elsewhere.example"),
                get_request(&["availability"]),
            )
            .await;
        assert_eq!(error_code_of(&response), Some(18));
    }

    #[tokio::test]
    async fn test_anonymous_origin_allowed_by_default() {
        let f = fixture(vec![]).await;
        let response = f.router.route(None, None, get_request(&["availability"])).await;
        assert_eq!(response.get(FIELD_RESULT).unwrap().as_i64(), Some(0));
    }

    // ==================================================================
    // Token enforcement
    // ==================================================================

    #[tokio::test]
    async fn test_missing_token_is_empty_access_token_error() {
        let f = fixture(vec![manifest("com.example.host", &["battery"])]).await;
        let response = f
            .router
            .route(Some("app"), None, get_request(&["battery"]))
            .await;
        assert_eq!(error_code_of(&response), Some(13));
    }

    #[tokio::test]
    async fn test_unknown_token_is_not_found_client_id() {
        let f = fixture(vec![manifest("com.example.host", &["battery"])]).await;
        let mut request = get_request(&["battery"]);
        request.access_token = Some("bogus".to_string());
        let response = f.router.route(Some("app"), None, request).await;
        assert_eq!(error_code_of(&response), Some(15));
    }

    #[tokio::test]
    async fn test_token_without_scope_is_scope_error() {
        let f = fixture(vec![manifest("com.example.host", &["battery"])]).await;
        let client = f.auth.create_client("app", None).unwrap();
        let token = f
            .auth
            .issue_token(&client.client_id, &["light".to_string()], None)
            .unwrap();
        let mut request = get_request(&["battery"]);
        request.access_token = Some(token.access_token);
        let response = f.router.route(Some("app"), None, request).await;
        assert_eq!(error_code_of(&response), Some(14));
    }

    // ==================================================================
    // Authorization profile
    // ==================================================================

    #[tokio::test]
    async fn test_grant_returns_client_id() {
        let f = fixture(vec![]).await;
        let client_id = grant_client(&f, "com.example.app").await;
        assert!(!client_id.is_empty());
        assert!(f.auth.client(&client_id).is_some());
    }

    #[tokio::test]
    async fn test_access_token_flow_with_approval() {
        let f = fixture(vec![manifest("com.example.host", &["battery"])]).await;
        let client_id = grant_client(&f, "com.example.app").await;

        // Approve every queued request as a user would.
        struct Approver(tokio::sync::mpsc::UnboundedSender<u64>);
        impl crate::oauth::approval::ApprovalPort for Approver {
            fn show(&self, request: &crate::oauth::approval::ApprovalRequest) {
                let _ = self.0.send(request.request_id);
            }
        }
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        f.auth.approval_queue().set_port(Arc::new(Approver(tx)));
        let auth = f.auth.clone();
        tokio::spawn(async move {
            while let Some(request_id) = rx.recv().await {
                auth.resolve_approval(request_id, true);
            }
        });

        let mut request = get_request(&["authorization", "accesstoken"]);
        request.params.insert("clientId".to_string(), json!(client_id));
        request
            .params
            .insert("applicationName".to_string(), json!("Demo"));
        request.params.insert("scope".to_string(), json!("battery"));
        let response = f.router.route(Some("com.example.app"), None, request).await;
        assert_eq!(response.get(FIELD_RESULT).unwrap().as_i64(), Some(0));
        let token = response
            .get(FIELD_ACCESS_TOKEN)
            .and_then(|v| v.as_str())
            .unwrap()
            .to_string();

        // The issued token now opens the scoped profile.
        spawn_echo_plugin(&f, "com.example.host", Map::new());
        let mut request = get_request(&["battery"]);
        request.access_token = Some(token);
        let response = f.router.route(Some("com.example.app"), None, request).await;
        assert_eq!(response.get(FIELD_RESULT).unwrap().as_i64(), Some(0));
    }

    #[tokio::test]
    async fn test_access_token_without_client_id_is_invalid_parameter() {
        let f = fixture(vec![]).await;
        let request = get_request(&["authorization", "accesstoken"]);
        let response = f.router.route(Some("app"), None, request).await;
        assert_eq!(error_code_of(&response), Some(10));
    }

    // ==================================================================
    // Built-in discovery and system
    // ==================================================================

    #[tokio::test]
    async fn test_service_discovery_lists_plugins() {
        let f = fixture(vec![
            manifest("com.example.a", &["battery"]),
            manifest("com.example.b", &["light"]),
        ])
        .await;
        let response = f
            .router
            .route(Some("app"), None, get_request(&["serviceDiscovery"]))
            .await;
        assert_eq!(response.get(FIELD_RESULT).unwrap().as_i64(), Some(0));
        let services = response.get("services").unwrap().as_array().unwrap();
        assert_eq!(services.len(), 2);
        assert!(services.iter().all(|s| s.get("online") == Some(&json!(true))));
    }

    #[tokio::test]
    async fn test_system_reports_supported_profiles() {
        let f = fixture(vec![manifest("com.example.a", &["battery", "light"])]).await;
        let response = f
            .router
            .route(Some("app"), None, get_request(&["system"]))
            .await;
        // system is not token exempt; expect the scope gate first.
        assert_eq!(error_code_of(&response), Some(13));

        let client = f.auth.create_client("app", None).unwrap();
        let token = f
            .auth
            .issue_token(&client.client_id, &["system".to_string()], None)
            .unwrap();
        let mut request = get_request(&["system"]);
        request.access_token = Some(token.access_token);
        let response = f.router.route(Some("app"), None, request).await;
        let supports = response.get("supports").unwrap().as_array().unwrap();
        assert_eq!(supports.len(), 2);
    }

    // ==================================================================
    // Forwarding and correlation
    // ==================================================================

    async fn token_for(f: &Fixture, package: &str, scope: &str) -> String {
        let client = f.auth.create_client(package, None).unwrap();
        f.auth
            .issue_token(&client.client_id, &[scope.to_string()], None)
            .unwrap()
            .access_token
    }

    #[tokio::test]
    async fn test_forward_rewrites_service_id() {
        let f = fixture(vec![manifest("com.example.host", &["battery"])]).await;
        let plugin = f.registry.list().remove(0);
        let mut extra = Map::new();
        extra.insert(FIELD_SERVICE_ID.to_string(), json!("local0"));
        spawn_echo_plugin(&f, "com.example.host", extra);

        let mut request = get_request(&["battery"]);
        request.access_token = Some(token_for(&f, "app", "battery").await);
        let response = f.router.route(Some("app"), None, request).await;
        assert_eq!(response.get(FIELD_RESULT).unwrap().as_i64(), Some(0));
        assert_eq!(
            response.get(FIELD_SERVICE_ID).unwrap().as_str().unwrap(),
            format!("local0.{}", plugin.id)
        );
        assert!(response.get(FIELD_REQUEST_CODE).is_none());
    }

    #[tokio::test]
    async fn test_unanswered_request_times_out_without_leak() {
        let mut config = RouterConfig::default();
        config.request_timeout = Duration::from_millis(50);
        let f = fixture_with(config, vec![manifest("com.example.host", &["battery"])]).await;
        // Plugin endpoint exists but never replies.
        let _rx = f.point_to_point.attach("com.example.host");

        let mut request = get_request(&["battery"]);
        request.access_token = Some(token_for(&f, "app", "battery").await);
        let response = f.router.route(Some("app"), None, request).await;
        assert_eq!(error_code_of(&response), Some(7));
        assert_eq!(f.router.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_unknown_profile_is_not_supported() {
        let f = fixture(vec![]).await;
        let mut request = get_request(&["battery"]);
        request.access_token = Some(token_for(&f, "app", "battery").await);
        let response = f.router.route(Some("app"), None, request).await;
        assert_eq!(error_code_of(&response), Some(2));
    }

    #[tokio::test]
    async fn test_service_id_with_unknown_plugin_is_not_found() {
        let f = fixture(vec![]).await;
        let mut request = get_request(&["battery"]);
        request.access_token = Some(token_for(&f, "app", "battery").await);
        request.service_id = Some("local0.ffffffffffffffffffffffffffffffff".to_string());
        let response = f.router.route(Some("app"), None, request).await;
        assert_eq!(error_code_of(&response), Some(6));
    }

    // ==================================================================
    // Event subscription bookkeeping
    // ==================================================================

    #[tokio::test]
    async fn test_put_registers_and_delete_removes_session() {
        let f = fixture(vec![manifest("com.example.host", &["battery"])]).await;
        spawn_echo_plugin(&f, "com.example.host", Map::new());
        let token = token_for(&f, "app", "battery").await;

        let (_, path) = parse_api_path(&["battery", "onChargingChange"], Method::Put).unwrap();
        let mut request = GatewayRequest::new(Method::Put, path.clone());
        request.access_token = Some(token.clone());
        let response = f.router.route(Some("app"), None, request).await;
        assert_eq!(response.get(FIELD_RESULT).unwrap().as_i64(), Some(0));
        assert_eq!(f.broker.session_count(), 1);

        let mut request = GatewayRequest::new(Method::Delete, path);
        request.access_token = Some(token);
        let response = f.router.route(Some("app"), None, request).await;
        assert_eq!(response.get(FIELD_RESULT).unwrap().as_i64(), Some(0));
        assert_eq!(f.broker.session_count(), 0);
    }

    // ==================================================================
    // Response signing
    // ==================================================================

    #[tokio::test]
    async fn test_response_carries_hmac_for_registered_origin() {
        let f = fixture(vec![]).await;
        let key = "00".repeat(32);
        let mut request = get_request(&["availability"]);
        request.nonce = Some("a1b2c3d4".to_string());
        request
            .params
            .insert(PARAM_HMAC_KEY.to_string(), json!(key));
        let response = f.router.route(Some("com.example.app"), None, request).await;
        assert_eq!(response.get(FIELD_RESULT).unwrap().as_i64(), Some(0));
        let hmac = response.get(FIELD_HMAC).unwrap().as_str().unwrap();
        let expected = f
            .trust
            .generate_hmac("com.example.app", "a1b2c3d4")
            .unwrap();
        assert_eq!(hmac, expected);
    }

    #[tokio::test]
    async fn test_no_hmac_without_registered_key() {
        let f = fixture(vec![]).await;
        let mut request = get_request(&["availability"]);
        request.nonce = Some("a1b2c3d4".to_string());
        let response = f.router.route(Some("com.example.app"), None, request).await;
        assert!(response.get(FIELD_HMAC).is_none());
    }
}
