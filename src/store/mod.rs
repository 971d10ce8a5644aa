//! Token store: the in-memory token map plus its crash-safe snapshot.
//!
//! - `validate` is the hot path. It updates `last_used` in memory and only
//!   flushes when `save_interval` has passed since the last flush.
//! - `create` / `rotate` / `disable` change authorization outcomes, so they
//!   flush synchronously and roll the in-memory change back if the flush
//!   fails. Success is never acknowledged for a change that is not on disk.
//! - One lock guards the map and the flush. It is never held across I/O
//!   other than the snapshot write itself.

pub mod snapshot;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::Zeroize;

use crate::models::policy::GlobalRules;
use crate::models::token::{
    is_known_scope, IssuedToken, NewToken, StoredToken, TokenRecord, SCOPE_ADMIN,
};
use snapshot::{Snapshot, SnapshotFile};

/// Prefix on every issued secret, so leaked credentials are recognizable.
pub const SECRET_PREFIX: &str = "hg_";
const SECRET_BYTES: usize = 32;
const MAX_SECRET_LEN: usize = 256;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unauthenticated")]
    Unauthenticated,
    #[error("unknown token '{0}'")]
    UnknownToken(String),
    #[error("{0}")]
    Invalid(String),
    #[error("token store corrupted: {detail}")]
    Corrupted { detail: String },
    #[error("token store I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("token store serialization: {0}")]
    Serialize(#[from] serde_json::Error),
}

// ── Secrets ──────────────────────────────────────────────────

/// Lowercase hex SHA-256 of a bearer secret. This is what gets persisted.
pub fn digest(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

/// Short, non-reversible handle for logs.
pub fn fingerprint(secret: &str) -> String {
    let mut d = digest(secret);
    d.truncate(12);
    d
}

fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    OsRng.fill_bytes(&mut bytes);
    let secret = format!("{}{}", SECRET_PREFIX, hex::encode(bytes));
    bytes.zeroize();
    secret
}

fn generate_token_id() -> String {
    let mut bytes = [0u8; 8];
    OsRng.fill_bytes(&mut bytes);
    format!("tok_{}", hex::encode(bytes))
}

fn well_formed(secret: &str) -> bool {
    !secret.is_empty()
        && secret.len() <= MAX_SECRET_LEN
        && secret.bytes().all(|b| b.is_ascii_graphic())
}

// ── Store ────────────────────────────────────────────────────

/// Guarded by the non-reentrant `TokenStore::inner` lock. Helpers take
/// `&mut Inner` from the caller's guard and must never lock it again.
struct Inner {
    file: SnapshotFile,
    tokens: HashMap<String, StoredToken>,
    /// digest -> token_id
    by_digest: HashMap<String, String>,
    rules: GlobalRules,
    dirty: bool,
    last_flush: Instant,
    flushes: u64,
}

impl Inner {
    fn snapshot(&self) -> Snapshot {
        let mut tokens: Vec<StoredToken> = self.tokens.values().cloned().collect();
        tokens.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.token_id.cmp(&b.token_id))
        });
        Snapshot {
            tokens,
            global_rules: self.rules.clone(),
            ..Snapshot::default()
        }
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        let snapshot = self.snapshot();
        self.file.write(&snapshot)?;
        self.dirty = false;
        self.last_flush = Instant::now();
        self.flushes += 1;
        Ok(())
    }

    fn insert(&mut self, token: StoredToken) {
        self.by_digest
            .insert(token.secret_sha256.clone(), token.token_id.clone());
        self.tokens.insert(token.token_id.clone(), token);
    }
}

pub struct TokenStore {
    inner: Mutex<Inner>,
    save_interval: Duration,
}

impl TokenStore {
    /// Load the snapshot at `path` (recovering from backup if needed).
    /// A missing file yields an empty store with default global rules.
    pub fn open(path: impl Into<PathBuf>, save_interval: Duration) -> Result<Self, StoreError> {
        let mut file = SnapshotFile::new(path);
        let snapshot = file.load()?.unwrap_or_default();

        let mut inner = Inner {
            file,
            tokens: HashMap::with_capacity(snapshot.tokens.len()),
            by_digest: HashMap::with_capacity(snapshot.tokens.len()),
            rules: snapshot.global_rules,
            dirty: false,
            last_flush: Instant::now(),
            flushes: 0,
        };
        for token in snapshot.tokens {
            inner.insert(token);
        }

        tracing::info!(
            path = %inner.file.path().display(),
            tokens = inner.tokens.len(),
            "token store loaded"
        );

        Ok(Self {
            inner: Mutex::new(inner),
            save_interval,
        })
    }

    pub fn path(&self) -> PathBuf {
        self.inner.lock().file.path().to_path_buf()
    }

    /// Resolve a presented bearer secret to its token.
    ///
    /// Unknown, malformed, disabled, and expired tokens all fail the same way.
    pub fn validate(&self, secret: &str) -> Result<TokenRecord, StoreError> {
        if !well_formed(secret) {
            return Err(StoreError::Unauthenticated);
        }
        let presented = digest(secret);
        let now = Utc::now();

        let mut inner = self.inner.lock();
        let token_id = match inner.by_digest.get(&presented) {
            Some(id) => id.clone(),
            None => {
                tracing::debug!(fingerprint = %fingerprint(secret), "unknown token presented");
                return Err(StoreError::Unauthenticated);
            }
        };
        let token = inner
            .tokens
            .get_mut(&token_id)
            .ok_or(StoreError::Unauthenticated)?;

        let matches: bool = token
            .secret_sha256
            .as_bytes()
            .ct_eq(presented.as_bytes())
            .into();
        if !matches || !token.enabled || token.is_expired(now) {
            tracing::debug!(token_id = %token.token_id, "rejected disabled or expired token");
            return Err(StoreError::Unauthenticated);
        }

        token.last_used = Some(now);
        let record = token.record();
        inner.dirty = true;

        if inner.last_flush.elapsed() >= self.save_interval {
            // last_used is advisory; a failed flush stays dirty and is retried.
            if let Err(e) = inner.flush() {
                tracing::warn!(error = %e, "debounced token flush failed");
            }
        }
        Ok(record)
    }

    pub fn create(&self, new: NewToken) -> Result<IssuedToken, StoreError> {
        let NewToken {
            label,
            scopes,
            expires_in_days,
            rules,
            metadata,
        } = new;

        let label = label.trim().to_string();
        if label.is_empty() {
            return Err(StoreError::Invalid("label must not be empty".into()));
        }
        if scopes.is_empty() {
            return Err(StoreError::Invalid("at least one scope is required".into()));
        }
        if let Some(bad) = scopes.iter().find(|s| !is_known_scope(s)) {
            return Err(StoreError::Invalid(format!("unknown scope '{}'", bad)));
        }
        if rules
            .rate_limits
            .iter()
            .any(|l| l.max_requests == 0 || l.window_secs == 0)
        {
            return Err(StoreError::Invalid(
                "rate limits need a positive max_requests and window_secs".into(),
            ));
        }

        let now = Utc::now();
        let expires_at = match expires_in_days {
            None => None,
            Some(days) => Some(
                chrono::Duration::try_days(i64::from(days))
                    .and_then(|d| now.checked_add_signed(d))
                    .ok_or_else(|| StoreError::Invalid("expires_in_days out of range".into()))?,
            ),
        };

        let secret = generate_secret();
        let token = StoredToken {
            token_id: generate_token_id(),
            label,
            secret_sha256: digest(&secret),
            scopes: scopes.into_iter().collect(),
            enabled: true,
            created_at: now,
            last_used: None,
            expires_at,
            rules,
            metadata,
        };
        let record = token.record();

        self.mutate_durably(|inner| {
            inner.insert(token);
            Ok(())
        })?;

        tracing::info!(token_id = %record.token_id, scopes = ?record.scopes, "token created");
        Ok(IssuedToken {
            record,
            token: secret,
        })
    }

    /// Replace a token's secret. The swap happens under the store lock, so
    /// exactly one of the two secrets validates at any instant.
    pub fn rotate(&self, token_id: &str) -> Result<IssuedToken, StoreError> {
        let secret = generate_secret();
        let new_digest = digest(&secret);

        let record = self.mutate_durably(|inner| {
            let token = inner
                .tokens
                .get_mut(token_id)
                .ok_or_else(|| StoreError::UnknownToken(token_id.to_string()))?;
            if !token.enabled {
                return Err(StoreError::Invalid(format!(
                    "token '{}' is disabled and cannot be rotated",
                    token_id
                )));
            }
            let old_digest = std::mem::replace(&mut token.secret_sha256, new_digest.clone());
            let record = token.record();
            inner.by_digest.remove(&old_digest);
            inner.by_digest.insert(new_digest, token_id.to_string());
            Ok(record)
        })?;

        tracing::info!(token_id = %token_id, "token rotated");
        Ok(IssuedToken {
            record,
            token: secret,
        })
    }

    /// Disable a token. Disabling an already disabled token is a no-op.
    pub fn disable(&self, token_id: &str) -> Result<TokenRecord, StoreError> {
        {
            let inner = self.inner.lock();
            match inner.tokens.get(token_id) {
                None => return Err(StoreError::UnknownToken(token_id.to_string())),
                Some(t) if !t.enabled => return Ok(t.record()),
                Some(_) => {}
            }
        }

        let record = self.mutate_durably(|inner| {
            let token = inner
                .tokens
                .get_mut(token_id)
                .ok_or_else(|| StoreError::UnknownToken(token_id.to_string()))?;
            token.enabled = false;
            Ok(token.record())
        })?;

        tracing::info!(token_id = %token_id, "token disabled");
        Ok(record)
    }

    /// All tokens, secrets redacted, oldest first.
    pub fn list(&self) -> Vec<TokenRecord> {
        let inner = self.inner.lock();
        inner.snapshot().tokens.iter().map(StoredToken::record).collect()
    }

    /// Import an existing plaintext secret as an admin token.
    /// Returns `None` when the secret is already known.
    pub fn import(&self, secret: &str, label: &str) -> Result<Option<TokenRecord>, StoreError> {
        if !well_formed(secret) {
            return Err(StoreError::Invalid("legacy secret is malformed".into()));
        }
        let secret_digest = digest(secret);
        if self.inner.lock().by_digest.contains_key(&secret_digest) {
            return Ok(None);
        }

        let token = StoredToken {
            token_id: generate_token_id(),
            label: label.to_string(),
            secret_sha256: secret_digest,
            scopes: [SCOPE_ADMIN.to_string()].into_iter().collect(),
            enabled: true,
            created_at: Utc::now(),
            last_used: None,
            expires_at: None,
            rules: Default::default(),
            metadata: Default::default(),
        };
        let record = token.record();
        self.mutate_durably(|inner| {
            inner.insert(token);
            Ok(())
        })?;
        tracing::info!(token_id = %record.token_id, "legacy token imported");
        Ok(Some(record))
    }

    pub fn global_rules(&self) -> GlobalRules {
        self.inner.lock().rules.clone()
    }

    pub fn set_global_rules(&self, rules: GlobalRules) -> Result<(), StoreError> {
        self.mutate_durably(|inner| {
            inner.rules = rules;
            Ok(())
        })
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().tokens.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.lock().dirty
    }

    /// Number of snapshot writes performed by this instance.
    pub fn flush_count(&self) -> u64 {
        self.inner.lock().flushes
    }

    /// Flush if dirty and the save interval has elapsed. Returns whether a
    /// write happened.
    pub fn flush_if_due(&self) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        if inner.dirty && inner.last_flush.elapsed() >= self.save_interval {
            inner.flush()?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Flush any dirty state regardless of the interval (shutdown path).
    pub fn flush(&self) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        if inner.dirty {
            inner.flush()?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Generate an admin token if the store holds none at all.
    pub fn bootstrap_admin(&self) -> Result<Option<IssuedToken>, StoreError> {
        if !self.is_empty() {
            return Ok(None);
        }
        let issued = self.create(NewToken {
            label: "bootstrap admin".into(),
            scopes: vec![SCOPE_ADMIN.into()],
            ..Default::default()
        })?;
        Ok(Some(issued))
    }

    /// Apply `f` and flush before returning. On flush failure the token map
    /// and rules are restored to their state before `f`.
    fn mutate_durably<T>(
        &self,
        f: impl FnOnce(&mut Inner) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut inner = self.inner.lock();
        let saved_tokens = inner.tokens.clone();
        let saved_digests = inner.by_digest.clone();
        let saved_rules = inner.rules.clone();
        let was_dirty = inner.dirty;

        let out = f(&mut *inner)?;
        if let Err(e) = inner.flush() {
            tracing::error!(error = %e, "token store flush failed; change rolled back");
            inner.tokens = saved_tokens;
            inner.by_digest = saved_digests;
            inner.rules = saved_rules;
            inner.dirty = was_dirty;
            return Err(e);
        }
        Ok(out)
    }
}

impl std::fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStore")
            .field("save_interval", &self.save_interval)
            .finish_non_exhaustive()
    }
}

/// Read legacy plaintext secrets: comma-separated `inline` plus one per
/// line from `file`. Blank lines and `#` comments are skipped.
pub fn read_legacy_secrets(inline: Option<&str>, file: Option<&Path>) -> std::io::Result<Vec<String>> {
    let mut out = Vec::new();
    if let Some(raw) = inline {
        out.extend(
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from),
        );
    }
    if let Some(path) = file {
        let mut content = std::fs::read_to_string(path)?;
        out.extend(
            content
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(String::from),
        );
        content.zeroize();
    }
    out.dedup();
    Ok(out)
}
