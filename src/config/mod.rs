//! Configuration parsing module
//!
//! JSON5 settings file resolved from an environment-controlled path, with
//! hard defaults for every field so a bare install runs without a file.

use serde::Deserialize;
use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::server::http::DEFAULT_PORT;

/// Settings file base name; the `.json` spelling is accepted as fallback.
const SETTINGS_FILE: &str = "switchyard.json5";
const SETTINGS_FILE_PLAIN: &str = "switchyard.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read settings file {path}: {message}")]
    Read { path: String, message: String },

    #[error("failed to parse JSON5 at {path}: {message}")]
    Parse { path: String, message: String },

    #[error("invalid listen address {addr}: {message}")]
    Address { addr: String, message: String },
}

/// Gateway settings as read from disk, env overrides applied.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    pub host: String,
    pub port: u16,
    /// Product name stamped onto every response envelope.
    pub product: String,
    pub locale: String,

    pub require_origin: bool,
    pub restrict_origins: bool,
    pub allowed_origins: Vec<String>,

    pub local_oauth: bool,
    /// Debug-only: lets the `*` scope satisfy every scope check.
    pub debug_wildcard_scope: bool,
    /// Grant token requests without prompting. Headless installs keep this
    /// on; an embedding frontend turns it off and answers through the
    /// approval port.
    pub auto_approve: bool,

    pub request_timeout_secs: u64,
    pub manifest_dir: Option<PathBuf>,
    pub token_store_path: Option<PathBuf>,

    pub keepalive_enabled: bool,
    pub keepalive_interval_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            product: "Switchyard".to_string(),
            locale: "en".to_string(),
            require_origin: true,
            restrict_origins: false,
            allowed_origins: Vec::new(),
            local_oauth: true,
            debug_wildcard_scope: false,
            auto_approve: true,
            request_timeout_secs: 60,
            manifest_dir: None,
            token_store_path: None,
            keepalive_enabled: true,
            keepalive_interval_secs: crate::events::keepalive::DEFAULT_PING_INTERVAL_SECS,
        }
    }
}

impl Settings {
    /// Load from the resolved settings path. A missing file yields the
    /// defaults.
    pub fn load() -> Result<Settings, ConfigError> {
        Settings::load_with(None)
    }

    /// Load from an explicit path, or the resolved path when none is
    /// given. An explicit path must exist; the resolved one may not.
    pub fn load_with(path: Option<&Path>) -> Result<Settings, ConfigError> {
        let mut settings = match path {
            Some(path) => Settings::load_from(path)?,
            None => {
                let path = settings_path();
                if path.exists() {
                    Settings::load_from(&path)?
                } else {
                    Settings::default()
                }
            }
        };
        settings.apply_env_overrides();
        Ok(settings)
    }

    pub fn load_from(path: &Path) -> Result<Settings, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        json5::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(host) = env::var("SWITCHYARD_HOST") {
            if !host.is_empty() {
                self.host = host;
            }
        }
        if let Ok(port) = env::var("SWITCHYARD_PORT") {
            if let Ok(port) = port.parse() {
                self.port = port;
            }
        }
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let addr = format!("{}:{}", self.host, self.port);
        addr.parse().map_err(|e: std::net::AddrParseError| {
            ConfigError::Address {
                addr,
                message: e.to_string(),
            }
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    /// Directory scanned for plugin capability manifests.
    pub fn manifest_dir(&self) -> PathBuf {
        self.manifest_dir
            .clone()
            .unwrap_or_else(|| state_dir().join("plugins"))
    }

    /// Path of the persisted client/token store.
    pub fn token_store_path(&self) -> PathBuf {
        self.token_store_path
            .clone()
            .unwrap_or_else(|| state_dir().join("oauth.json"))
    }
}

/// Settings file path.
/// Priority: SWITCHYARD_CONFIG_PATH > SWITCHYARD_STATE_DIR > ~/.switchyard/.
pub fn settings_path() -> PathBuf {
    if let Ok(path) = env::var("SWITCHYARD_CONFIG_PATH") {
        return PathBuf::from(path);
    }
    let base = state_dir();
    let json5 = base.join(SETTINGS_FILE);
    if json5.exists() {
        return json5;
    }
    base.join(SETTINGS_FILE_PLAIN)
}

/// State directory holding the settings file, manifest directory, and
/// token store by default.
pub fn state_dir() -> PathBuf {
    if let Ok(dir) = env::var("SWITCHYARD_STATE_DIR") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".switchyard")
}
