//! Wire protocol model
//!
//! The client-facing surface speaks a small JSON envelope over REST and
//! WebSocket: `result` 0/1, profile-specific fields, and on failure a
//! numeric `errorCode` plus `errorMessage`. This module owns the envelope
//! builders, the stable error-code space, the three-level capability path,
//! and the dotted version names plugins declare.

use serde_json::{json, Map, Value};
use std::fmt;
use thiserror::Error;

/// Result value for a successful response.
pub const RESULT_OK: i64 = 0;
/// Result value for a failed response.
pub const RESULT_ERROR: i64 = 1;

/// API prefix accepted on the REST surface.
pub const DEFAULT_API: &str = "gotapi";

/// Native origin header sent by installed applications.
pub const HEADER_GOTAPI_ORIGIN: &str = "X-GotAPI-Origin";

/// Sentinel substituted when origin is optional by policy and absent.
pub const ANONYMOUS_ORIGIN: &str = "<anonymous>";

// Envelope field names.
pub const FIELD_RESULT: &str = "result";
pub const FIELD_ERROR_CODE: &str = "errorCode";
pub const FIELD_ERROR_MESSAGE: &str = "errorMessage";
pub const FIELD_PRODUCT: &str = "product";
pub const FIELD_VERSION: &str = "version";
pub const FIELD_HMAC: &str = "hmac";
pub const FIELD_ACCESS_TOKEN: &str = "accessToken";
pub const FIELD_SERVICE_ID: &str = "serviceId";
pub const FIELD_PROFILE: &str = "profile";
pub const FIELD_INTERFACE: &str = "interface";
pub const FIELD_ATTRIBUTE: &str = "attribute";
pub const FIELD_NONCE: &str = "nonce";
pub const FIELD_SESSION_KEY: &str = "sessionKey";
pub const FIELD_URI: &str = "uri";

/// Client-visible error codes. The numeric values are part of the wire
/// contract and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    Unknown = 1,
    NotSupportProfile = 2,
    NotSupportAction = 3,
    NotSupportAttribute = 4,
    EmptyServiceId = 5,
    NotFoundService = 6,
    Timeout = 7,
    UnknownAttribute = 8,
    LowBattery = 9,
    InvalidRequestParameter = 10,
    Authorization = 11,
    ExpiredAccessToken = 12,
    EmptyAccessToken = 13,
    Scope = 14,
    NotFoundClientId = 15,
    IllegalDeviceState = 16,
    IllegalServerState = 17,
    InvalidOrigin = 18,
    InvalidUrl = 19,
    InvalidProfile = 20,
}

impl ErrorCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Default human-readable message for the code.
    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::Unknown => "Unknown error was encountered.",
            ErrorCode::NotSupportProfile => "Non-supported Profile was accessed.",
            ErrorCode::NotSupportAction => "Non-supported HTTP method was used.",
            ErrorCode::NotSupportAttribute => "Non-supported attribute was used.",
            ErrorCode::EmptyServiceId => "Service ID is required.",
            ErrorCode::NotFoundService => "Service was not found.",
            ErrorCode::Timeout => "Response timeout.",
            ErrorCode::UnknownAttribute => "Illegal or nonexistent attribute or interface was accessed.",
            ErrorCode::LowBattery => "Process canceled due to low battery.",
            ErrorCode::InvalidRequestParameter => "Request parameter is invalid.",
            ErrorCode::Authorization => "Authorization error.",
            ErrorCode::ExpiredAccessToken => "Access token expired.",
            ErrorCode::EmptyAccessToken => "Access token is required.",
            ErrorCode::Scope => "Request is out of scope.",
            ErrorCode::NotFoundClientId => "Client ID was not found.",
            ErrorCode::IllegalDeviceState => "Device is in an illegal state.",
            ErrorCode::IllegalServerState => "Server is in an illegal state.",
            ErrorCode::InvalidOrigin => "Origin of the request is invalid.",
            ErrorCode::InvalidUrl => "URL of the request is invalid.",
            ErrorCode::InvalidProfile => "Profile of the request is invalid.",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message(), self.code())
    }
}

/// HTTP-equivalent methods understood by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Put,
    Post,
    Delete,
}

impl Method {
    /// Parse a method from a path segment or verb, case-insensitively.
    pub fn parse(s: &str) -> Option<Method> {
        match s.to_ascii_lowercase().as_str() {
            "get" => Some(Method::Get),
            "put" => Some(Method::Put),
            "post" => Some(Method::Post),
            "delete" => Some(Method::Delete),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Put => "PUT",
            Method::Post => "POST",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Three-level capability address: profile, optional interface, optional
/// attribute.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ApiPath {
    pub profile: String,
    pub interface: Option<String>,
    pub attribute: Option<String>,
}

impl ApiPath {
    pub fn profile(profile: &str) -> Self {
        ApiPath {
            profile: profile.to_string(),
            interface: None,
            attribute: None,
        }
    }

    pub fn attribute(profile: &str, attribute: &str) -> Self {
        ApiPath {
            profile: profile.to_string(),
            interface: None,
            attribute: Some(attribute.to_string()),
        }
    }

    pub fn full(profile: &str, interface: &str, attribute: &str) -> Self {
        ApiPath {
            profile: profile.to_string(),
            interface: Some(interface.to_string()),
            attribute: Some(attribute.to_string()),
        }
    }

    /// Case-insensitive match on all three levels.
    pub fn matches_ignore_case(&self, other: &ApiPath) -> bool {
        fn eq_opt(a: &Option<String>, b: &Option<String>) -> bool {
            match (a, b) {
                (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
                (None, None) => true,
                _ => false,
            }
        }
        self.profile.eq_ignore_ascii_case(&other.profile)
            && eq_opt(&self.interface, &other.interface)
            && eq_opt(&self.attribute, &other.attribute)
    }
}

impl fmt::Display for ApiPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.profile)?;
        if let Some(ref i) = self.interface {
            write!(f, "/{}", i)?;
        }
        if let Some(ref a) = self.attribute {
            write!(f, "/{}", a)?;
        }
        Ok(())
    }
}

/// Errors raised while resolving a request path into an [`ApiPath`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathParseError {
    #[error("URL of the request is invalid")]
    InvalidUrl,
    #[error("profile segment names a method")]
    InvalidProfile,
}

impl PathParseError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            PathParseError::InvalidUrl => ErrorCode::InvalidUrl,
            PathParseError::InvalidProfile => ErrorCode::InvalidProfile,
        }
    }
}

/// Resolve the path segments after the API prefix into a method override
/// and an [`ApiPath`].
///
/// Both addressing variants are accepted:
/// `/<api>/<profile>[/<interface>]/<attribute>` with the HTTP verb carrying
/// the method, and `/<api>/<method>/<profile>[/<interface>]/<attribute>`
/// with the method embedded in the path. The embedded form is honored only
/// when the actual verb is GET; a profile segment that itself names a
/// method is rejected so the two forms can never be confused.
pub fn parse_api_path(
    segments: &[&str],
    http_method: Method,
) -> Result<(Method, ApiPath), PathParseError> {
    if segments.is_empty() || segments.len() > 4 {
        return Err(PathParseError::InvalidUrl);
    }
    if segments.iter().any(|s| s.is_empty()) {
        return Err(PathParseError::InvalidUrl);
    }

    let method_in_path = Method::parse(segments[0]);
    match method_in_path {
        Some(method) => {
            if http_method != Method::Get {
                return Err(PathParseError::InvalidUrl);
            }
            let rest = &segments[1..];
            if rest.is_empty() {
                return Err(PathParseError::InvalidUrl);
            }
            if Method::parse(rest[0]).is_some() {
                return Err(PathParseError::InvalidProfile);
            }
            Ok((method, build_path(rest)?))
        }
        None => {
            if segments.len() == 4 {
                // Four segments require the method-in-path form.
                return Err(PathParseError::InvalidUrl);
            }
            Ok((http_method, build_path(segments)?))
        }
    }
}

fn build_path(segments: &[&str]) -> Result<ApiPath, PathParseError> {
    match segments.len() {
        1 => Ok(ApiPath::profile(segments[0])),
        2 => Ok(ApiPath::attribute(segments[0], segments[1])),
        3 => Ok(ApiPath::full(segments[0], segments[1], segments[2])),
        _ => Err(PathParseError::InvalidUrl),
    }
}

/// Declared origin of a request. Web origins come from the standard browser
/// header and are tagged so policy can treat them differently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestOrigin {
    pub value: String,
    pub web: bool,
}

impl RequestOrigin {
    pub fn native(value: &str) -> Self {
        RequestOrigin {
            value: value.to_string(),
            web: false,
        }
    }

    pub fn web(value: &str) -> Self {
        RequestOrigin {
            value: value.to_string(),
            web: true,
        }
    }
}

/// An inbound client request after surface-level parsing, before routing.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    pub method: Method,
    pub path: ApiPath,
    pub origin: Option<RequestOrigin>,
    pub access_token: Option<String>,
    pub nonce: Option<String>,
    pub service_id: Option<String>,
    pub params: Map<String, Value>,
    /// Content URI of the single allowed file attachment, if any.
    pub file_uri: Option<String>,
}

impl GatewayRequest {
    pub fn new(method: Method, path: ApiPath) -> Self {
        GatewayRequest {
            method,
            path,
            origin: None,
            access_token: None,
            nonce: None,
            service_id: None,
            params: Map::new(),
            file_uri: None,
        }
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).and_then(|v| v.as_str())
    }
}

/// Build a success envelope with optional extra fields.
pub fn success_response() -> Map<String, Value> {
    let mut map = Map::new();
    map.insert(FIELD_RESULT.to_string(), json!(RESULT_OK));
    map
}

/// Build an error envelope for the given code with its default message.
pub fn error_response(code: ErrorCode) -> Map<String, Value> {
    error_response_with_message(code, code.message())
}

/// Build an error envelope with an explicit message.
pub fn error_response_with_message(code: ErrorCode, message: &str) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert(FIELD_RESULT.to_string(), json!(RESULT_ERROR));
    map.insert(FIELD_ERROR_CODE.to_string(), json!(code.code()));
    map.insert(FIELD_ERROR_MESSAGE.to_string(), json!(message));
    map
}

/// Whether the envelope carries `result: 0`.
pub fn is_success(response: &Map<String, Value>) -> bool {
    response
        .get(FIELD_RESULT)
        .and_then(|v| v.as_i64())
        .map(|r| r == RESULT_OK)
        .unwrap_or(false)
}

/// Dotted version name as declared by plugin SDKs, e.g. `"1.1.0"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VersionName {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl VersionName {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        VersionName {
            major,
            minor,
            patch,
        }
    }

    /// Parse `major.minor[.patch]`; anything else is rejected.
    pub fn parse(s: &str) -> Option<VersionName> {
        let mut parts = s.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let patch = match parts.next() {
            Some(p) => p.parse().ok()?,
            None => 0,
        };
        if parts.next().is_some() {
            return None;
        }
        Some(VersionName {
            major,
            minor,
            patch,
        })
    }
}

impl fmt::Display for VersionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}
