//! HTTP REST surface
//!
//! Implements:
//! - Gateway API (`/<api>/<profile>[/<interface>]/<attribute>`, both the
//!   method-as-verb and method-in-path addressing variants)
//! - WebSocket upgrade (GET /gotapi/websocket)
//! - File retrieval with conditional and byte-range support
//!   (GET /gotapi/files?uri=...)
//! - Manager surface (plugin enable/disable, token list/revoke)
//!
//! Every gateway response is an HTTP 200 carrying the JSON envelope;
//! failures are expressed through `result`/`errorCode`, not status codes.

use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{header, HeaderMap, Method as HttpMethod, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, delete, get, put},
    Json, Router as HttpRouter,
};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, warn};

use crate::protocol::{
    error_response, parse_api_path, success_response, ErrorCode, GatewayRequest,
    HEADER_GOTAPI_ORIGIN,
};
use crate::server::files::{etag_for, parse_range, ByteRange};
use crate::server::{ws, GatewayContext};

/// Default listen port of the gateway.
pub const DEFAULT_PORT: u16 = 4035;

/// Build the full HTTP application.
pub fn create_router(context: Arc<GatewayContext>) -> HttpRouter {
    HttpRouter::new()
        .route("/gotapi/websocket", get(ws::ws_handler))
        .route("/gotapi/files", get(files_handler))
        .route("/gotapi/manager/plugins", get(list_plugins_handler))
        .route(
            "/gotapi/manager/plugins/:id/enable",
            put(enable_plugin_handler),
        )
        .route(
            "/gotapi/manager/plugins/:id/disable",
            put(disable_plugin_handler),
        )
        .route(
            "/gotapi/manager/tokens",
            get(list_tokens_handler).delete(revoke_all_tokens_handler),
        )
        .route("/gotapi/manager/tokens/:token", delete(revoke_token_handler))
        .route("/gotapi/*path", any(gateway_handler))
        .with_state(context)
}

// ----------------------------------------------------------------------
// Gateway API
// ----------------------------------------------------------------------

async fn gateway_handler(
    State(context): State<Arc<GatewayContext>>,
    method: HttpMethod,
    Path(path): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Json<Value> {
    let Some(verb) = crate::protocol::Method::parse(method.as_str()) else {
        return Json(Value::Object(error_response(ErrorCode::NotSupportAction)));
    };

    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let (api_method, api_path) = match parse_api_path(&segments, verb) {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!(target: "http", path = %path, error = %e, "rejected request path");
            return Json(Value::Object(error_response(e.error_code())));
        }
    };

    let mut params: Map<String, Value> = Map::new();
    for (key, value) in query {
        params.insert(key, Value::String(value));
    }
    merge_body_params(&headers, &body, &mut params);

    let mut request = GatewayRequest::new(api_method, api_path);
    request.access_token = string_param(&params, "accessToken");
    request.nonce = string_param(&params, "nonce");
    request.service_id = string_param(&params, "serviceId");
    request.file_uri = string_param(&params, "uri");
    request.params = params;

    let native = header_value(&headers, HEADER_GOTAPI_ORIGIN);
    let web = header_value(&headers, header::ORIGIN.as_str());
    let response = context
        .router
        .route(native.as_deref(), web.as_deref(), request)
        .await;
    Json(Value::Object(response))
}

/// Fold body parameters into the parameter map. Urlencoded forms and JSON
/// objects are both accepted; body values override query values.
fn merge_body_params(headers: &HeaderMap, body: &Bytes, params: &mut Map<String, Value>) {
    if body.is_empty() {
        return;
    }
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if content_type.starts_with("application/x-www-form-urlencoded") {
        match serde_urlencoded::from_bytes::<Vec<(String, String)>>(body) {
            Ok(pairs) => {
                for (key, value) in pairs {
                    params.insert(key, Value::String(value));
                }
            }
            Err(e) => debug!(target: "http", error = %e, "unparseable form body"),
        }
    } else if content_type.starts_with("application/json") {
        match serde_json::from_slice::<Map<String, Value>>(body) {
            Ok(object) => params.extend(object),
            Err(e) => debug!(target: "http", error = %e, "unparseable json body"),
        }
    }
}

fn string_param(params: &Map<String, Value>, name: &str) -> Option<String> {
    params
        .get(name)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

// ----------------------------------------------------------------------
// File retrieval
// ----------------------------------------------------------------------

#[derive(serde::Deserialize)]
struct FilesQuery {
    uri: Option<String>,
}

async fn files_handler(
    State(context): State<Arc<GatewayContext>>,
    Query(query): Query<FilesQuery>,
    headers: HeaderMap,
) -> Response {
    let Some(uri) = query.uri else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let Some(path) = context.catalog.resolve(&uri) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let len = match tokio::fs::metadata(&path).await {
        Ok(metadata) => metadata.len(),
        Err(e) => {
            warn!(target: "http", uri = %uri, error = %e, "registered content unreadable");
            return StatusCode::NOT_FOUND.into_response();
        }
    };
    let etag = etag_for(&uri, len);

    if let Some(candidate) = header_value(&headers, header::IF_NONE_MATCH.as_str()) {
        if candidate.trim() == etag {
            return Response::builder()
                .status(StatusCode::NOT_MODIFIED)
                .header(header::ETAG, &etag)
                .body(Body::empty())
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
        }
    }

    // A stale If-Range validator downgrades the range request to a full
    // response instead of serving mismatched bytes.
    let range_header = header_value(&headers, header::RANGE.as_str()).filter(|_| {
        match header_value(&headers, header::IF_RANGE.as_str()) {
            Some(validator) => validator.trim() == etag,
            None => true,
        }
    });

    match range_header.as_deref().and_then(|h| parse_range(h, len)) {
        Some(ByteRange::Unsatisfiable) => Response::builder()
            .status(StatusCode::RANGE_NOT_SATISFIABLE)
            .header(header::CONTENT_RANGE, format!("bytes */{len}"))
            .body(Body::empty())
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
        Some(ByteRange::Satisfiable { start, end }) => {
            match read_slice(&path, start, end).await {
                Ok(bytes) => Response::builder()
                    .status(StatusCode::PARTIAL_CONTENT)
                    .header(header::ETAG, &etag)
                    .header(header::ACCEPT_RANGES, "bytes")
                    .header(header::CONTENT_RANGE, format!("bytes {start}-{end}/{len}"))
                    .header(header::CONTENT_TYPE, "application/octet-stream")
                    .body(Body::from(bytes))
                    .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
                Err(e) => {
                    warn!(target: "http", uri = %uri, error = %e, "failed to read content slice");
                    StatusCode::INTERNAL_SERVER_ERROR.into_response()
                }
            }
        }
        None => match tokio::fs::read(&path).await {
            Ok(bytes) => Response::builder()
                .status(StatusCode::OK)
                .header(header::ETAG, &etag)
                .header(header::ACCEPT_RANGES, "bytes")
                .header(header::CONTENT_TYPE, "application/octet-stream")
                .body(Body::from(bytes))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
            Err(e) => {
                warn!(target: "http", uri = %uri, error = %e, "failed to read content");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        },
    }
}

async fn read_slice(
    path: &std::path::Path,
    start: u64,
    end: u64,
) -> std::io::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(std::io::SeekFrom::Start(start)).await?;
    let mut buffer = vec![0u8; (end - start + 1) as usize];
    file.read_exact(&mut buffer).await?;
    Ok(buffer)
}

// ----------------------------------------------------------------------
// Manager surface
// ----------------------------------------------------------------------

async fn list_plugins_handler(State(context): State<Arc<GatewayContext>>) -> Json<Value> {
    let plugins: Vec<Value> = context
        .registry
        .list()
        .into_iter()
        .map(|p| {
            json!({
                "id": p.id,
                "name": p.name,
                "address": p.address,
                "connectionType": p.connection_type,
                "state": format!("{:?}", p.state),
                "enabled": p.enabled,
            })
        })
        .collect();
    let mut response = success_response();
    response.insert("plugins".to_string(), Value::Array(plugins));
    Json(Value::Object(response))
}

async fn enable_plugin_handler(
    State(context): State<Arc<GatewayContext>>,
    Path(id): Path<String>,
) -> Json<Value> {
    set_plugin_enabled(&context, &id, true)
}

async fn disable_plugin_handler(
    State(context): State<Arc<GatewayContext>>,
    Path(id): Path<String>,
) -> Json<Value> {
    set_plugin_enabled(&context, &id, false)
}

fn set_plugin_enabled(context: &GatewayContext, id: &str, enabled: bool) -> Json<Value> {
    match context.registry.set_enabled(id, enabled) {
        Ok(()) => Json(Value::Object(success_response())),
        Err(_) => Json(Value::Object(error_response(ErrorCode::NotFoundService))),
    }
}

async fn list_tokens_handler(State(context): State<Arc<GatewayContext>>) -> Json<Value> {
    let tokens = context.auth.list_tokens();
    let mut response = success_response();
    response.insert(
        "tokens".to_string(),
        serde_json::to_value(tokens).unwrap_or(Value::Array(Vec::new())),
    );
    Json(Value::Object(response))
}

async fn revoke_token_handler(
    State(context): State<Arc<GatewayContext>>,
    Path(token): Path<String>,
) -> Json<Value> {
    match context.auth.revoke_token(&token) {
        Ok(true) => Json(Value::Object(success_response())),
        Ok(false) => Json(Value::Object(error_response(ErrorCode::NotFoundClientId))),
        Err(e) => {
            warn!(target: "auth", error = %e, "token revocation failed");
            Json(Value::Object(error_response(ErrorCode::IllegalServerState)))
        }
    }
}

async fn revoke_all_tokens_handler(State(context): State<Arc<GatewayContext>>) -> Json<Value> {
    match context.auth.revoke_all_tokens() {
        Ok(revoked) => {
            let mut response = success_response();
            response.insert("revoked".to_string(), json!(revoked));
            Json(Value::Object(response))
        }
        Err(e) => {
            warn!(target: "auth", error = %e, "token revocation failed");
            Json(Value::Object(error_response(ErrorCode::IllegalServerState)))
        }
    }
}
