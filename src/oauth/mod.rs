//! Local authorization server
//!
//! Client registration and scoped token lifecycle. All store mutations are
//! serialized behind one lock: registration, issuance, and revocation each
//! span multiple read-then-write steps that must land as a unit. The
//! approval queue has its own lock (see [`approval`]) so a slow consent UI
//! never blocks token storage operations for unrelated flows.

pub mod approval;
pub mod store;

use parking_lot::Mutex;
use rand::RngCore;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::plugins::manifest::Manifest;
use approval::{ApprovalQueue, ApprovalRequest, APPROVAL_TIMEOUT_SECS};
use store::{
    ClientRecord, OAuthData, OAuthStorage, ScopeGrant, StoreError, TokenRecord,
    CLIENT_IDLE_HORIZON_SECS, CLIENT_MAX, DEFAULT_TOKEN_EXPIRE_SECS,
};

/// Debug-only scope satisfying every scope check when enabled in settings.
pub const WILDCARD_SCOPE: &str = "*";

#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("client counts is full")]
    ClientQuotaFull,
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
    #[error("client '{0}' is not registered")]
    UnknownClient(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Fresh credentials returned from client registration.
#[derive(Debug, Clone)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: String,
}

/// Parameters of a token publication request.
#[derive(Debug, Clone)]
pub struct PublishTokenParams {
    pub client_id: String,
    pub application_name: String,
    pub scopes: Vec<String>,
    /// Set when the requester is a plugin; display names then come from its
    /// capability manifest.
    pub plugin_id: Option<String>,
}

/// A token as handed back to the requester after approval.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub access_token: String,
    pub scopes: Vec<ScopeGrant>,
}

/// Four independent verdicts so callers can distinguish failure causes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckAccessTokenResult {
    pub exists_client_id: bool,
    pub exists_access_token: bool,
    pub exists_scope: bool,
    pub not_expired: bool,
}

impl CheckAccessTokenResult {
    pub fn all(value: bool) -> Self {
        CheckAccessTokenResult {
            exists_client_id: value,
            exists_access_token: value,
            exists_scope: value,
            not_expired: value,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.exists_client_id && self.exists_access_token && self.exists_scope && self.not_expired
    }
}

/// The authorization server.
pub struct AuthServer {
    data: Mutex<OAuthData>,
    storage: Box<dyn OAuthStorage>,
    queue: ApprovalQueue,
    /// Debug escape hatch: a token holding the wildcard scope passes every
    /// scope and expiry check.
    wildcard_scope_enabled: bool,
    next_request_id: AtomicU64,
}

impl AuthServer {
    pub fn new(storage: Box<dyn OAuthStorage>, wildcard_scope_enabled: bool) -> Self {
        let data = match storage.load() {
            Ok(Some(data)) => data,
            Ok(None) => OAuthData::default(),
            Err(e) => {
                warn!(target: "auth", error = %e, "failed to load authorization store");
                OAuthData::default()
            }
        };
        AuthServer {
            data: Mutex::new(data),
            storage,
            queue: ApprovalQueue::new(),
            wildcard_scope_enabled,
            next_request_id: AtomicU64::new(1),
        }
    }

    pub fn approval_queue(&self) -> &ApprovalQueue {
        &self.queue
    }

    /// Resolve a pending approval from whatever frontend is wired up.
    pub fn resolve_approval(&self, request_id: u64, approved: bool) -> bool {
        self.queue.resolve(request_id, approved, now_ms())
    }

    // ------------------------------------------------------------------
    // Client lifecycle
    // ------------------------------------------------------------------

    /// Register a client for the given package identity. Purges idle
    /// clients first, replaces any existing client for the same identity
    /// (revoking its tokens), and enforces the population cap.
    pub fn create_client(
        &self,
        package: &str,
        plugin_id: Option<&str>,
    ) -> Result<ClientCredentials, OAuthError> {
        self.create_client_at(package, plugin_id, now_ms())
    }

    pub fn create_client_at(
        &self,
        package: &str,
        plugin_id: Option<&str>,
        now_ms: i64,
    ) -> Result<ClientCredentials, OAuthError> {
        if package.is_empty() {
            return Err(OAuthError::InvalidParameter("package"));
        }
        let mut data = self.data.lock();

        let horizon = now_ms - CLIENT_IDLE_HORIZON_SECS * 1000;
        let idle: Vec<String> = data
            .clients
            .values()
            .filter(|c| c.last_used_at_ms < horizon)
            .map(|c| c.client_id.clone())
            .collect();
        for client_id in idle {
            debug!(target: "auth", client_id = %client_id, "purging idle client");
            Self::remove_client_locked(&mut data, &client_id);
        }

        // Same identity replaces its previous client in place.
        if let Some(existing) = data.client_for_package(package).map(|c| c.client_id.clone()) {
            info!(target: "auth", package, "replacing existing client for identity");
            Self::remove_client_locked(&mut data, &existing);
        }

        if data.clients.len() >= CLIENT_MAX {
            return Err(OAuthError::ClientQuotaFull);
        }

        let credentials = ClientCredentials {
            client_id: Uuid::new_v4().simple().to_string(),
            client_secret: generate_secret(),
        };
        data.clients.insert(
            credentials.client_id.clone(),
            ClientRecord {
                client_id: credentials.client_id.clone(),
                client_secret: credentials.client_secret.clone(),
                package: package.to_string(),
                plugin_id: plugin_id.map(str::to_string),
                created_at_ms: now_ms,
                last_used_at_ms: now_ms,
            },
        );
        self.persist(&data)?;
        Ok(credentials)
    }

    fn remove_client_locked(data: &mut OAuthData, client_id: &str) {
        data.clients.remove(client_id);
        data.tokens.retain(|_, t| t.client_id != client_id);
    }

    pub fn client(&self, client_id: &str) -> Option<ClientRecord> {
        self.data.lock().clients.get(client_id).cloned()
    }

    /// Package identity bound to the client that issued the given token.
    pub fn package_for_token(&self, access_token: &str) -> Option<String> {
        let data = self.data.lock();
        let token = data.tokens.get(access_token)?;
        data.clients
            .get(&token.client_id)
            .map(|c| c.package.clone())
    }

    // ------------------------------------------------------------------
    // Token publication
    // ------------------------------------------------------------------

    /// Run the full publication flow: validate, queue for approval, wait
    /// for the decision (bounded), and issue on approval. Denial and
    /// timeout both yield `Ok(None)`; the requester gets exactly one
    /// outcome either way.
    pub async fn confirm_publish_access_token(
        &self,
        params: PublishTokenParams,
        manifest: Option<&Manifest>,
        locale: &str,
    ) -> Result<Option<IssuedToken>, OAuthError> {
        if params.application_name.trim().is_empty() {
            return Err(OAuthError::InvalidParameter("applicationName"));
        }
        if params.client_id.is_empty() {
            return Err(OAuthError::InvalidParameter("clientId"));
        }
        if params.scopes.is_empty() {
            return Err(OAuthError::InvalidParameter("scope"));
        }
        if self.client(&params.client_id).is_none() {
            return Err(OAuthError::UnknownClient(params.client_id));
        }

        let display_scopes: Vec<String> = params
            .scopes
            .iter()
            .map(|scope| match manifest {
                Some(m) => m.display_scope_name(scope, locale),
                None => scope.clone(),
            })
            .collect();

        let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        let enqueued_at = now_ms();
        let rx = self.queue.enqueue(
            ApprovalRequest {
                request_id,
                application_name: params.application_name.clone(),
                client_id: params.client_id.clone(),
                scopes: params.scopes.clone(),
                display_scopes,
                enqueued_at_ms: enqueued_at,
            },
            enqueued_at,
        );

        let decision = tokio::time::timeout(
            std::time::Duration::from_secs(APPROVAL_TIMEOUT_SECS),
            rx,
        )
        .await;
        let approved = match decision {
            Ok(Ok(approved)) => approved,
            // Channel dropped: request went stale in the queue.
            Ok(Err(_)) => false,
            Err(_) => {
                self.queue.abandon(request_id, now_ms());
                debug!(target: "auth", request_id, "approval timed out, treating as denial");
                false
            }
        };

        if !approved {
            return Ok(None);
        }
        self.issue_token(&params.client_id, &params.scopes, manifest)
            .map(Some)
    }

    /// Issue a token for the client, one grant per scope, replacing any
    /// prior token held by the same client. Stale tokens whose client no
    /// longer exists are purged first.
    pub fn issue_token(
        &self,
        client_id: &str,
        scopes: &[String],
        manifest: Option<&Manifest>,
    ) -> Result<IssuedToken, OAuthError> {
        self.issue_token_at(client_id, scopes, manifest, now_ms())
    }

    pub fn issue_token_at(
        &self,
        client_id: &str,
        scopes: &[String],
        manifest: Option<&Manifest>,
        now_ms: i64,
    ) -> Result<IssuedToken, OAuthError> {
        let mut data = self.data.lock();
        if !data.clients.contains_key(client_id) {
            return Err(OAuthError::UnknownClient(client_id.to_string()));
        }

        let orphaned: Vec<String> = data
            .tokens
            .values()
            .filter(|t| !data.clients.contains_key(&t.client_id))
            .map(|t| t.access_token.clone())
            .collect();
        for token in orphaned {
            data.tokens.remove(&token);
        }

        data.tokens.retain(|_, t| t.client_id != client_id);

        let grants: Vec<ScopeGrant> = scopes
            .iter()
            .map(|scope| ScopeGrant {
                scope: scope.clone(),
                grant_time_ms: now_ms,
                expire_period_secs: manifest
                    .and_then(|m| m.expire_period_secs(scope))
                    .unwrap_or(DEFAULT_TOKEN_EXPIRE_SECS),
                first_access_done: false,
            })
            .collect();

        let access_token = Uuid::new_v4().simple().to_string();
        data.tokens.insert(
            access_token.clone(),
            TokenRecord {
                access_token: access_token.clone(),
                client_id: client_id.to_string(),
                registered_at_ms: now_ms,
                accessed_at_ms: now_ms,
                scopes: grants.clone(),
            },
        );
        info!(
            target: "auth",
            client_id,
            scopes = scopes.len(),
            "issued access token"
        );
        self.persist(&data)?;
        Ok(IssuedToken {
            access_token,
            scopes: grants,
        })
    }

    // ------------------------------------------------------------------
    // Token validation
    // ------------------------------------------------------------------

    pub fn check_access_token(
        &self,
        access_token: Option<&str>,
        scope: &str,
        special_scopes: Option<&[&str]>,
    ) -> CheckAccessTokenResult {
        self.check_access_token_at(access_token, scope, special_scopes, now_ms())
    }

    pub fn check_access_token_at(
        &self,
        access_token: Option<&str>,
        scope: &str,
        special_scopes: Option<&[&str]>,
        now_ms: i64,
    ) -> CheckAccessTokenResult {
        if let Some(special) = special_scopes {
            if special.iter().any(|s| s.eq_ignore_ascii_case(scope)) {
                return CheckAccessTokenResult::all(true);
            }
        }
        let token_value = match access_token {
            Some(t) if !t.is_empty() => t,
            _ => return CheckAccessTokenResult::all(false),
        };

        let mut data = self.data.lock();
        let Some(token) = data.tokens.get_mut(token_value) else {
            return CheckAccessTokenResult::all(false);
        };
        token.accessed_at_ms = now_ms;
        let client_id = token.client_id.clone();

        let wildcard = self.wildcard_scope_enabled && token.scope(WILDCARD_SCOPE).is_some();
        let (exists_scope, not_expired) = if wildcard {
            (true, true)
        } else {
            match token.scopes.iter_mut().find(|g| g.scope == scope) {
                Some(grant) => {
                    let valid = grant.is_valid_at(now_ms);
                    if valid && grant.expire_period_secs == 0 {
                        grant.first_access_done = true;
                    }
                    (true, valid)
                }
                None => (false, false),
            }
        };

        let exists_client = data.clients.contains_key(&client_id);
        if exists_client {
            if let Some(client) = data.clients.get_mut(&client_id) {
                client.last_used_at_ms = now_ms;
            }
        }
        if let Err(e) = self.storage.save(&data) {
            warn!(target: "auth", error = %e, "failed to persist token access update");
        }

        CheckAccessTokenResult {
            exists_client_id: exists_client,
            exists_access_token: true,
            exists_scope,
            not_expired,
        }
    }

    // ------------------------------------------------------------------
    // Administrative operations
    // ------------------------------------------------------------------

    pub fn list_tokens(&self) -> Vec<TokenRecord> {
        let data = self.data.lock();
        let mut tokens: Vec<TokenRecord> = data.tokens.values().cloned().collect();
        tokens.sort_by(|a, b| a.registered_at_ms.cmp(&b.registered_at_ms));
        tokens
    }

    pub fn revoke_token(&self, access_token: &str) -> Result<bool, OAuthError> {
        let mut data = self.data.lock();
        let removed = data.tokens.remove(access_token).is_some();
        if removed {
            self.persist(&data)?;
        }
        Ok(removed)
    }

    pub fn revoke_tokens_for_client(&self, client_id: &str) -> Result<usize, OAuthError> {
        let mut data = self.data.lock();
        let before = data.tokens.len();
        data.tokens.retain(|_, t| t.client_id != client_id);
        let removed = before - data.tokens.len();
        if removed > 0 {
            self.persist(&data)?;
        }
        Ok(removed)
    }

    pub fn revoke_all_tokens(&self) -> Result<usize, OAuthError> {
        let mut data = self.data.lock();
        let removed = data.tokens.len();
        data.tokens.clear();
        self.persist(&data)?;
        Ok(removed)
    }

    /// Drop tokens whose issuing client no longer exists.
    pub fn purge_orphan_tokens(&self) -> Result<usize, OAuthError> {
        let mut data = self.data.lock();
        let before = data.tokens.len();
        let live: Vec<String> = data.clients.keys().cloned().collect();
        data.tokens.retain(|_, t| live.contains(&t.client_id));
        let removed = before - data.tokens.len();
        if removed > 0 {
            self.persist(&data)?;
        }
        Ok(removed)
    }

    /// Remove every client and token bound to a vanished plugin. Wired to
    /// the registry's loss callback.
    pub fn destroy_plugin_data(&self, plugin_id: &str) -> Result<(), OAuthError> {
        let mut data = self.data.lock();
        let doomed: Vec<String> = data
            .clients
            .values()
            .filter(|c| c.plugin_id.as_deref() == Some(plugin_id))
            .map(|c| c.client_id.clone())
            .collect();
        if doomed.is_empty() {
            return Ok(());
        }
        info!(
            target: "auth",
            plugin_id,
            clients = doomed.len(),
            "destroying authorization data for lost plugin"
        );
        for client_id in doomed {
            Self::remove_client_locked(&mut data, &client_id);
        }
        self.persist(&data)?;
        Ok(())
    }

    pub fn client_count(&self) -> usize {
        self.data.lock().clients.len()
    }

    pub fn token_count(&self) -> usize {
        self.data.lock().tokens.len()
    }

    fn persist(&self, data: &OAuthData) -> Result<(), OAuthError> {
        self.storage.save(data)?;
        Ok(())
    }
}

fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
