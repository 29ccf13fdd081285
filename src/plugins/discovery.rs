//! Manifest-based plugin discovery
//!
//! Discovery is an injectable collaborator: anything that can yield a list
//! of capability manifests. The shipped implementation scans a directory of
//! `*.json` manifests, which is how locally-installed providers register
//! themselves with the gateway.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

use super::manifest::Manifest;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to read manifest directory {path}: {source}")]
    ReadDir {
        path: String,
        source: std::io::Error,
    },
}

/// Source of (descriptor, manifest) pairs. Implementations may scan a
/// filesystem, a service registry, or an OS catalog.
#[async_trait]
pub trait DiscoveryProvider: Send + Sync {
    async fn scan(&self) -> Result<Vec<Manifest>, DiscoveryError>;
}

/// Scans a directory of JSON capability manifests.
pub struct DirectoryDiscovery {
    dir: PathBuf,
}

impl DirectoryDiscovery {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        DirectoryDiscovery { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl DiscoveryProvider for DirectoryDiscovery {
    async fn scan(&self) -> Result<Vec<Manifest>, DiscoveryError> {
        // An absent directory means no plugins are installed yet.
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut dir = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| DiscoveryError::ReadDir {
                path: self.dir.display().to_string(),
                source: e,
            })?;

        let mut found = Vec::new();
        while let Ok(Some(entry)) = dir.next_entry().await.map_err(|e| {
            warn!(target: "plugins", error = %e, "error walking manifest directory");
            e
        }) {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match tokio::fs::read_to_string(&path).await {
                Ok(content) => match serde_json::from_str::<Manifest>(&content) {
                    Ok(manifest) => {
                        debug!(
                            target: "plugins",
                            path = %path.display(),
                            name = %manifest.name,
                            "parsed capability manifest"
                        );
                        found.push(manifest);
                    }
                    Err(e) => {
                        warn!(
                            target: "plugins",
                            path = %path.display(),
                            error = %e,
                            "skipping malformed manifest"
                        );
                    }
                },
                Err(e) => {
                    warn!(
                        target: "plugins",
                        path = %path.display(),
                        error = %e,
                        "skipping unreadable manifest"
                    );
                }
            }
        }
        Ok(found)
    }
}

/// Fixed list of manifests, mainly for tests and embedded providers.
pub struct StaticDiscovery {
    manifests: Vec<Manifest>,
}

impl StaticDiscovery {
    pub fn new(manifests: Vec<Manifest>) -> Self {
        StaticDiscovery { manifests }
    }
}

#[async_trait]
impl DiscoveryProvider for StaticDiscovery {
    async fn scan(&self) -> Result<Vec<Manifest>, DiscoveryError> {
        Ok(self.manifests.clone())
    }
}
