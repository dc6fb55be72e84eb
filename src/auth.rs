//! Capability authorization.
//!
//! Access is granted by bearer tokens scoped to path prefixes with a read
//! or write permission.  Tokens are minted through a two-step handshake:
//!
//! 1. [`Auth::authorize`] accepts a [`Key`] (the privileges the caller
//!    wants), parks it as a pending authorization under a random id and
//!    hands a one-time code to the [`CodeNotifier`].
//! 2. [`Auth::complete_auth`] redeems `(id, code)` exactly once and returns
//!    a freshly persisted token.
//!
//! The read path ([`Auth::can_read`], [`Auth::can_write`]) only touches the
//! token store, never the pending map.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{info, warn};

use crate::errors::GatewayError;
use crate::metrics::record_handshake;
use crate::tokens::TokenStore;

/// Largest accepted credential payload.
pub const MAX_KEY_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Write,
}

impl Permission {
    /// Write implies read.
    pub fn grants(self, wanted: Permission) -> bool {
        self == Permission::Write || wanted == Permission::Read
    }
}

/// One path-prefix scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Privilege {
    pub path: String,
    pub perm: Permission,
}

impl Privilege {
    pub fn allows(&self, path: &str, wanted: Permission) -> bool {
        self.perm.grants(wanted) && scope_contains(&self.path, path)
    }
}

/// Credential presented to `authorize`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Key {
    /// Caller-chosen identity, recorded as the token label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub privileges: Vec<Privilege>,
}

impl Key {
    /// Decode and validate a JSON credential body.
    pub fn parse(body: &[u8]) -> Result<Key, AuthError> {
        if body.len() > MAX_KEY_BYTES {
            return Err(AuthError::InvalidCredential(
                "credential too large".to_string(),
            ));
        }
        let key: Key = serde_json::from_slice(body)
            .map_err(|e| AuthError::InvalidCredential(e.to_string()))?;
        key.validate()?;
        Ok(key)
    }

    /// Reject empty or malformed privilege lists.
    pub fn validate(&self) -> Result<(), AuthError> {
        if self.privileges.is_empty() {
            return Err(AuthError::InvalidCredential(
                "no privileges requested".to_string(),
            ));
        }
        for privilege in &self.privileges {
            if !privilege.path.starts_with('/') {
                return Err(AuthError::InvalidCredential(format!(
                    "privilege path must start with '/': {}",
                    privilege.path
                )));
            }
            if has_parent_segment(&privilege.path) {
                return Err(AuthError::InvalidCredential(format!(
                    "privilege path must not contain '..': {}",
                    privilege.path
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Invalid credential: {0}")]
    InvalidCredential(String),

    #[error("Authorization not found")]
    NotFound,

    #[error("Invalid code")]
    InvalidCode,

    #[error("Token store error: {0}")]
    Store(String),
}

impl From<AuthError> for GatewayError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Store(_) => GatewayError::Internal(err.to_string()),
            other => GatewayError::BadRequest(other.to_string()),
        }
    }
}

/// Out-of-band delivery of one-time codes to whoever approves requests.
pub trait CodeNotifier: Send + Sync {
    fn notify(&self, auth_id: &str, key: &Key, code: &str);
}

/// Writes codes to the log for the operator.
pub struct LogNotifier;

impl CodeNotifier for LogNotifier {
    fn notify(&self, auth_id: &str, key: &Key, code: &str) {
        let scopes: Vec<String> = key
            .privileges
            .iter()
            .map(|p| format!("{}:{:?}", p.path, p.perm))
            .collect();
        info!(
            "Authorization {} requested by {} for [{}]: code {}",
            auth_id,
            key.id.as_deref().unwrap_or("anonymous"),
            scopes.join(", "),
            code
        );
    }
}

/// Wrong codes a pending authorization tolerates before it is dropped.
pub const MAX_CODE_ATTEMPTS: u32 = 5;

struct PendingAuth {
    key: Key,
    code: String,
    created: Instant,
    failures: u32,
}

/// The authorization engine.
pub struct Auth {
    tokens: Arc<TokenStore>,
    pending: Mutex<HashMap<String, PendingAuth>>,
    anonymous: Vec<Privilege>,
    notifier: Arc<dyn CodeNotifier>,
    pending_ttl: Duration,
    token_ttl: Duration,
}

impl Auth {
    pub fn new(tokens: Arc<TokenStore>) -> Self {
        Self {
            tokens,
            pending: Mutex::new(HashMap::new()),
            anonymous: Vec::new(),
            notifier: Arc::new(LogNotifier),
            pending_ttl: Duration::from_secs(900),
            token_ttl: Duration::from_secs(365 * 24 * 3600),
        }
    }

    /// Scopes granted to every caller, token or not.
    pub fn with_anonymous(mut self, anonymous: Vec<Privilege>) -> Self {
        self.anonymous = anonymous;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn CodeNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_ttls(mut self, pending_ttl: Duration, token_ttl: Duration) -> Self {
        self.pending_ttl = pending_ttl;
        self.token_ttl = token_ttl;
        self
    }

    /// Start a handshake.  Returns the authorization id; the code goes to
    /// the notifier.
    pub fn authorize(&self, key: Key) -> Result<String, AuthError> {
        if let Err(e) = key.validate() {
            record_handshake("authorize", "invalid");
            return Err(e);
        }

        let id = random_hex(16);
        let code = format!("{:06}", rand::thread_rng().gen_range(0..1_000_000u32));

        {
            let mut pending = self.lock_pending()?;
            let ttl = self.pending_ttl;
            pending.retain(|_, p| p.created.elapsed() < ttl);
            pending.insert(
                id.clone(),
                PendingAuth {
                    key: key.clone(),
                    code: code.clone(),
                    created: Instant::now(),
                    failures: 0,
                },
            );
        }

        self.notifier.notify(&id, &key, &code);
        record_handshake("authorize", "ok");
        Ok(id)
    }

    /// Redeem a pending authorization.  Lookup, code check and removal
    /// happen under one lock, so an id is redeemed at most once.
    pub fn complete_auth(&self, id: &str, code: &str) -> Result<String, AuthError> {
        let pending = {
            let mut pending = self.lock_pending()?;
            let check = pending.get(id).map(|p| {
                (
                    p.created.elapsed() >= self.pending_ttl,
                    bool::from(p.code.as_bytes().ct_eq(code.as_bytes())),
                )
            });
            match check {
                None => {
                    record_handshake("complete", "not_found");
                    return Err(AuthError::NotFound);
                }
                Some((true, _)) => {
                    pending.remove(id);
                    record_handshake("complete", "expired");
                    return Err(AuthError::NotFound);
                }
                Some((false, false)) => {
                    record_handshake("complete", "invalid_code");
                    let exhausted = pending.get_mut(id).map_or(true, |p| {
                        p.failures += 1;
                        p.failures >= MAX_CODE_ATTEMPTS
                    });
                    if exhausted {
                        pending.remove(id);
                        warn!(
                            "Authorization {} dropped after {} wrong codes",
                            id, MAX_CODE_ATTEMPTS
                        );
                    }
                    return Err(AuthError::InvalidCode);
                }
                Some((false, true)) => pending.remove(id).ok_or(AuthError::NotFound)?,
            }
        };

        let token = random_hex(32);
        self.tokens
            .insert(
                &token,
                pending.key.id.clone(),
                pending.key.privileges,
                self.token_ttl,
            )
            .map_err(|e| {
                record_handshake("complete", "error");
                AuthError::Store(format!("{e:#}"))
            })?;

        info!("Authorization {} completed", id);
        record_handshake("complete", "ok");
        Ok(token)
    }

    pub fn can_read(&self, token: Option<&str>, path: &str) -> bool {
        self.allowed(token, path, Permission::Read)
    }

    pub fn can_write(&self, token: Option<&str>, path: &str) -> bool {
        self.allowed(token, path, Permission::Write)
    }

    fn allowed(&self, token: Option<&str>, path: &str, wanted: Permission) -> bool {
        if has_parent_segment(path) {
            return false;
        }
        if self.anonymous.iter().any(|p| p.allows(path, wanted)) {
            return true;
        }

        let token = match token {
            Some(t) if !t.is_empty() => t,
            _ => return false,
        };
        match self.tokens.lookup(token) {
            Ok(Some(record)) => record.privileges.iter().any(|p| p.allows(path, wanted)),
            Ok(None) => false,
            Err(e) => {
                warn!("Token lookup failed: {:#}", e);
                false
            }
        }
    }

    fn lock_pending(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, PendingAuth>>, AuthError> {
        self.pending
            .lock()
            .map_err(|_| AuthError::Store("pending authorization lock poisoned".to_string()))
    }
}

/// Whether `scope` covers `path`, comparing whole segments.
///
/// `/a` and `/a/` both cover `/a`, `/a/` and `/a/b`; neither covers `/ab`.
pub fn scope_contains(scope: &str, path: &str) -> bool {
    let scope = scope.trim_end_matches('/');
    if scope.is_empty() {
        return path.starts_with('/');
    }
    match path.strip_prefix(scope) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

fn has_parent_segment(path: &str) -> bool {
    path.split('/').any(|segment| segment == "..")
}

/// `n` random bytes, hex encoded.
pub fn random_hex(n: usize) -> String {
    let mut bytes = vec![0u8; n];
    rand::thread_rng().fill(bytes.as_mut_slice());
    hex::encode(bytes)
}
