//! Capability manifest parsing
//!
//! Each provider declares its capabilities in a JSON manifest: the profiles
//! it serves, optional per-profile token expiry overrides (minutes), display
//! names per locale, its SDK version, and how it wants to be reached.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::protocol::VersionName;

/// Seconds per minute, for expiry override conversion.
const MINUTE_SECS: i64 = 60;

/// Transport flavor a plugin connects over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionType {
    /// Dedicated request/reply channel per plugin.
    PointToPoint,
    /// Shared fan-out channel; the plugin filters by destination.
    Broadcast,
    /// Runs inside the gateway process.
    Internal,
}

/// One declared capability profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileDecl {
    pub name: String,
    /// Token expiry override in minutes. Absent means the system default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expire_period: Option<i64>,
    /// Display names keyed by locale tag ("en", "ja", ...).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub localized_names: HashMap<String, String>,
}

/// Parsed capability manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub name: String,
    /// Stable transport address; the plugin id is derived from it.
    pub address: String,
    pub connection_type: ConnectionType,
    /// Dotted SDK version the plugin was built against.
    pub sdk_version: String,
    #[serde(default)]
    pub profiles: Vec<ProfileDecl>,
}

impl Manifest {
    pub fn profile(&self, name: &str) -> Option<&ProfileDecl> {
        self.profiles
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }

    pub fn supports_profile(&self, name: &str) -> bool {
        self.profile(name).is_some()
    }

    /// Expiry override for a scope in seconds, if the manifest declares one.
    pub fn expire_period_secs(&self, scope: &str) -> Option<i64> {
        self.profile(scope)
            .and_then(|p| p.expire_period)
            .map(|minutes| minutes * MINUTE_SECS)
    }

    /// Display name for a scope in the given locale, falling back to the
    /// declared profile name, then the raw scope string.
    pub fn display_scope_name(&self, scope: &str, locale: &str) -> String {
        match self.profile(scope) {
            Some(p) => p
                .localized_names
                .get(locale)
                .cloned()
                .unwrap_or_else(|| p.name.clone()),
            None => scope.to_string(),
        }
    }

    pub fn sdk_version_name(&self) -> Option<VersionName> {
        VersionName::parse(&self.sdk_version)
    }
}
