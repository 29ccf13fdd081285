//! Origin/HMAC trust layer
//!
//! Every inbound request declares its calling application's origin, either
//! through the native header or the standard browser header. This module
//! decides whether that declaration is acceptable under the configured
//! policy, and manages the per-origin HMAC keys used to sign responses for
//! clients that asked for proof of session continuity.

use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use sha2::Sha256;
use std::collections::{HashMap, HashSet};

use crate::protocol::{ErrorCode, RequestOrigin, ANONYMOUS_ORIGIN};

type HmacSha256 = Hmac<Sha256>;

/// Allow-list entry matching any origin.
pub const ORIGIN_WILDCARD: &str = "*";

/// Outcome of origin validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OriginValidity {
    /// Origin acceptable (or substituted by the anonymous sentinel).
    None,
    /// Origin required by policy but absent.
    NotSpecified,
    /// Conflicting origins declared by different signals in one request.
    NotUnique,
    /// Origin present but blocked by the allow-list.
    NotAllowed,
}

impl OriginValidity {
    /// Client-visible error code; all origin failures share code 18 and are
    /// distinguished by message.
    pub fn error_code(self) -> Option<ErrorCode> {
        match self {
            OriginValidity::None => None,
            _ => Some(ErrorCode::InvalidOrigin),
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            OriginValidity::None => "",
            OriginValidity::NotSpecified => "Origin is not specified.",
            OriginValidity::NotUnique => "The specified origin is not unique.",
            OriginValidity::NotAllowed => "The specified origin is not allowed.",
        }
    }
}

/// Origin policy knobs, filled from settings.
#[derive(Debug, Clone)]
pub struct OriginPolicy {
    /// When false, requests without an origin get the anonymous sentinel.
    pub require_origin: bool,
    /// When true, origins must appear in the allow-list.
    pub restrict_origins: bool,
}

impl Default for OriginPolicy {
    fn default() -> Self {
        OriginPolicy {
            require_origin: true,
            restrict_origins: false,
        }
    }
}

/// Origin validation plus per-origin HMAC key registry.
pub struct TrustManager {
    policy: OriginPolicy,
    allowed: RwLock<HashSet<String>>,
    hmac_keys: RwLock<HashMap<String, Vec<u8>>>,
}

impl TrustManager {
    pub fn new(policy: OriginPolicy) -> Self {
        TrustManager {
            policy,
            allowed: RwLock::new(HashSet::new()),
            hmac_keys: RwLock::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &OriginPolicy {
        &self.policy
    }

    // ------------------------------------------------------------------
    // Origin validation
    // ------------------------------------------------------------------

    /// Validate the declared origin of a request.
    ///
    /// The native header wins over the web header; a request carrying both
    /// with different values is rejected as not-unique. When origin is
    /// optional and absent, the anonymous sentinel is substituted so the
    /// rest of the pipeline always sees an origin value.
    pub fn check_origin(
        &self,
        native: Option<&str>,
        web: Option<&str>,
    ) -> (OriginValidity, Option<RequestOrigin>) {
        let native = native.map(str::trim).filter(|s| !s.is_empty());
        let web = web.map(str::trim).filter(|s| !s.is_empty());

        if let (Some(n), Some(w)) = (native, web) {
            if n != w {
                return (OriginValidity::NotUnique, None);
            }
        }

        let origin = match (native, web) {
            (Some(n), _) => Some(RequestOrigin::native(n)),
            (None, Some(w)) => Some(RequestOrigin::web(w)),
            (None, None) => None,
        };

        match origin {
            None => {
                if self.policy.require_origin {
                    (OriginValidity::NotSpecified, None)
                } else {
                    (
                        OriginValidity::None,
                        Some(RequestOrigin::native(ANONYMOUS_ORIGIN)),
                    )
                }
            }
            Some(origin) => {
                if self.policy.restrict_origins && !self.is_allowed(&origin.value) {
                    (OriginValidity::NotAllowed, None)
                } else {
                    (OriginValidity::None, Some(origin))
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Allow-list management
    // ------------------------------------------------------------------

    pub fn allow_origin(&self, origin: &str) {
        self.allowed.write().insert(origin.to_string());
    }

    pub fn disallow_origin(&self, origin: &str) {
        self.allowed.write().remove(origin);
    }

    pub fn allowed_origins(&self) -> Vec<String> {
        let mut list: Vec<String> = self.allowed.read().iter().cloned().collect();
        list.sort();
        list
    }

    fn is_allowed(&self, origin: &str) -> bool {
        let allowed = self.allowed.read();
        allowed.contains(ORIGIN_WILDCARD) || allowed.contains(origin)
    }

    // ------------------------------------------------------------------
    // HMAC keys
    // ------------------------------------------------------------------

    /// Register (or rotate) the HMAC key for an origin. The key arrives
    /// hex-encoded from the client.
    pub fn enable_hmac(&self, origin: &str, key_hex: &str) -> bool {
        match hex::decode(key_hex) {
            Ok(key) if !key.is_empty() => {
                self.hmac_keys.write().insert(origin.to_string(), key);
                true
            }
            _ => {
                tracing::warn!(target: "auth", origin, "rejected malformed hmac key");
                false
            }
        }
    }

    pub fn disable_hmac(&self, origin: &str) {
        self.hmac_keys.write().remove(origin);
    }

    pub fn uses_hmac(&self, origin: &str) -> bool {
        self.hmac_keys.read().contains_key(origin)
    }

    /// Sign a request nonce with the origin's current key. Returns `None`
    /// when the origin never registered for HMAC-backed responses or the
    /// nonce is malformed.
    pub fn generate_hmac(&self, origin: &str, nonce_hex: &str) -> Option<String> {
        let keys = self.hmac_keys.read();
        let key = keys.get(origin)?;
        let nonce = hex::decode(nonce_hex).ok()?;
        let mut mac = HmacSha256::new_from_slice(key).ok()?;
        mac.update(&nonce);
        Some(hex::encode(mac.finalize().into_bytes()))
    }
}

/// Constant-time string comparison for secrets.
pub fn timing_safe_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
