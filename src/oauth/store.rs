//! Authorization backing store
//!
//! Clients and tokens live in one serializable blob guarded by the
//! authorization server's single store lock. Persistence is pluggable; the
//! default JSON-file implementation writes atomically (tmp file, sync,
//! rename) and moves corrupt files aside instead of losing them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

/// Hard cap on concurrently registered clients.
pub const CLIENT_MAX: usize = 100;

/// Clients idle longer than this are purged before new registrations.
pub const CLIENT_IDLE_HORIZON_SECS: i64 = 60 * 60 * 24 * 30;

/// Default scope expiry when the plugin manifest declares no override.
pub const DEFAULT_TOKEN_EXPIRE_SECS: i64 = 60 * 60 * 24 * 180;

/// Grace window for zero-expiry scopes: valid this long after issuance, and
/// only until the first access.
pub const ACCESS_TOKEN_GRACE_SECS: i64 = 60;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read authorization store {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to write authorization store {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to encode authorization store: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A registered OAuth client bound to one package identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRecord {
    pub client_id: String,
    pub client_secret: String,
    /// Package/service identity the client is bound to.
    pub package: String,
    /// Owning plugin, when the client was registered on behalf of one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugin_id: Option<String>,
    pub created_at_ms: i64,
    pub last_used_at_ms: i64,
}

/// One granted scope on a token.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeGrant {
    pub scope: String,
    pub grant_time_ms: i64,
    /// Seconds. Zero means grace-window-then-first-access; negative means
    /// always expired.
    pub expire_period_secs: i64,
    #[serde(default)]
    pub first_access_done: bool,
}

impl ScopeGrant {
    /// Per-scope expiry evaluation at the given instant. Does not flip the
    /// first-access marker; the caller owns that mutation.
    pub fn is_valid_at(&self, now_ms: i64) -> bool {
        if self.expire_period_secs < 0 {
            return false;
        }
        if self.expire_period_secs == 0 {
            return !self.first_access_done
                && now_ms < self.grant_time_ms + ACCESS_TOKEN_GRACE_SECS * 1000;
        }
        now_ms < self.grant_time_ms + self.expire_period_secs * 1000
    }
}

/// An issued access token with its per-scope grants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRecord {
    pub access_token: String,
    pub client_id: String,
    pub registered_at_ms: i64,
    pub accessed_at_ms: i64,
    pub scopes: Vec<ScopeGrant>,
}

impl TokenRecord {
    pub fn scope(&self, name: &str) -> Option<&ScopeGrant> {
        self.scopes.iter().find(|s| s.scope == name)
    }
}

/// The whole authorization state, persisted as one document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthData {
    /// Keyed by client id.
    #[serde(default)]
    pub clients: HashMap<String, ClientRecord>,
    /// Keyed by access token value.
    #[serde(default)]
    pub tokens: HashMap<String, TokenRecord>,
}

impl OAuthData {
    pub fn client_for_package(&self, package: &str) -> Option<&ClientRecord> {
        self.clients.values().find(|c| c.package == package)
    }

    pub fn tokens_for_client(&self, client_id: &str) -> Vec<String> {
        self.tokens
            .values()
            .filter(|t| t.client_id == client_id)
            .map(|t| t.access_token.clone())
            .collect()
    }
}

/// Persistence behind the authorization server. Implementations only move
/// bytes; all invariants are enforced above, under the store lock.
pub trait OAuthStorage: Send + Sync {
    fn load(&self) -> Result<Option<OAuthData>, StoreError>;
    fn save(&self, data: &OAuthData) -> Result<(), StoreError>;
}

/// JSON-file persistence with atomic replace and corrupt-file backup.
pub struct JsonFileStorage {
    path: PathBuf,
}

impl JsonFileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonFileStorage { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl OAuthStorage for JsonFileStorage {
    fn load(&self) -> Result<Option<OAuthData>, StoreError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path).map_err(|e| StoreError::Read {
            path: self.path.display().to_string(),
            source: e,
        })?;
        match serde_json::from_str::<OAuthData>(&content) {
            Ok(data) => Ok(Some(data)),
            Err(e) => {
                // Keep the corrupt file for inspection and start fresh.
                let backup = self.path.with_extension("corrupt");
                warn!(
                    target: "auth",
                    path = %self.path.display(),
                    backup = %backup.display(),
                    error = %e,
                    "authorization store corrupt, moving aside"
                );
                if let Err(rename_err) = fs::rename(&self.path, &backup) {
                    warn!(
                        target: "auth",
                        error = %rename_err,
                        "failed to move corrupt authorization store"
                    );
                }
                Ok(None)
            }
        }
    }

    fn save(&self, data: &OAuthData) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::Write {
                path: self.path.display().to_string(),
                source: e,
            })?;
        }
        let json = serde_json::to_string_pretty(data)?;
        let tmp = self.path.with_extension("tmp");
        let write = |path: &Path| -> std::io::Result<()> {
            let mut file = fs::File::create(path)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()
        };
        write(&tmp).map_err(|e| StoreError::Write {
            path: tmp.display().to_string(),
            source: e,
        })?;
        fs::rename(&tmp, &self.path).map_err(|e| StoreError::Write {
            path: self.path.display().to_string(),
            source: e,
        })
    }
}

/// Volatile storage for tests and ephemeral gateways.
pub struct MemoryStorage;

impl OAuthStorage for MemoryStorage {
    fn load(&self) -> Result<Option<OAuthData>, StoreError> {
        Ok(None)
    }

    fn save(&self, _data: &OAuthData) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grant(expire_secs: i64, grant_time_ms: i64) -> ScopeGrant {
        ScopeGrant {
            scope: "battery".to_string(),
            grant_time_ms,
            expire_period_secs: expire_secs,
            first_access_done: false,
        }
    }

    // ========================================================================
    // Scope expiry rules
    // ========================================================================

    #[test]
    fn test_negative_expire_always_invalid() {
        let g = grant(-1, 1_000);
        assert!(!g.is_valid_at(1_000));
        assert!(!g.is_valid_at(0));
    }

    #[test]
    fn test_positive_expire_boundary() {
        let g = grant(10, 1_000);
        assert!(g.is_valid_at(1_000));
        assert!(g.is_valid_at(10_999));
        assert!(!g.is_valid_at(11_000));
    }

    #[test]
    fn test_zero_expire_grace_window() {
        let g = grant(0, 1_000);
        assert!(g.is_valid_at(1_000 + ACCESS_TOKEN_GRACE_SECS * 1000 - 1));
        assert!(!g.is_valid_at(1_000 + ACCESS_TOKEN_GRACE_SECS * 1000));
    }

    #[test]
    fn test_zero_expire_first_access_only() {
        let mut g = grant(0, 1_000);
        assert!(g.is_valid_at(1_500));
        g.first_access_done = true;
        assert!(!g.is_valid_at(1_500));
    }

    // ========================================================================
    // JSON-file storage
    // ========================================================================

    #[test]
    fn test_file_storage_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = JsonFileStorage::new(tmp.path().join("oauth.json"));
        assert!(storage.load().unwrap().is_none());

        let mut data = OAuthData::default();
        data.clients.insert(
            "c1".to_string(),
            ClientRecord {
                client_id: "c1".to_string(),
                client_secret: "s1".to_string(),
                package: "app.sample".to_string(),
                plugin_id: None,
                created_at_ms: 1,
                last_used_at_ms: 1,
            },
        );
        storage.save(&data).unwrap();

        let loaded = storage.load().unwrap().unwrap();
        assert_eq!(loaded.clients.len(), 1);
        assert_eq!(loaded.clients["c1"].package, "app.sample");
    }

    #[test]
    fn test_file_storage_corrupt_backup() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("oauth.json");
        fs::write(&path, "{broken").unwrap();

        let storage = JsonFileStorage::new(&path);
        assert!(storage.load().unwrap().is_none());
        assert!(path.with_extension("corrupt").exists());
        assert!(!path.exists());
    }

    #[test]
    fn test_token_lookup_helpers() {
        let mut data = OAuthData::default();
        data.tokens.insert(
            "tok".to_string(),
            TokenRecord {
                access_token: "tok".to_string(),
                client_id: "c1".to_string(),
                registered_at_ms: 0,
                accessed_at_ms: 0,
                scopes: vec![grant(10, 0)],
            },
        );
        assert_eq!(data.tokens_for_client("c1"), vec!["tok".to_string()]);
        assert!(data.tokens["tok"].scope("battery").is_some());
        assert!(data.tokens["tok"].scope("camera").is_none());
    }
}
