use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Scopes ───────────────────────────────────────────────────

pub const SCOPE_ADMIN: &str = "admin";
pub const SCOPE_FS_READ: &str = "fs:read";
pub const SCOPE_FS_WRITE: &str = "fs:write";
pub const SCOPE_FS_ALL: &str = "fs:*";
pub const SCOPE_EXEC: &str = "exec";

const KNOWN_SCOPES: &[&str] = &[
    SCOPE_ADMIN,
    SCOPE_FS_READ,
    SCOPE_FS_WRITE,
    SCOPE_FS_ALL,
    SCOPE_EXEC,
];

pub fn is_known_scope(scope: &str) -> bool {
    KNOWN_SCOPES.contains(&scope)
}

// ── Rate limits ──────────────────────────────────────────────

/// A sliding-window limit: at most `max_requests` in any `window_secs` span.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RateLimit {
    pub max_requests: u32,
    pub window_secs: u64,
}

// ── Stored token ─────────────────────────────────────────────

/// A token as persisted in the snapshot.
///
/// The bearer secret itself is never stored; only its SHA-256 digest
/// (`secret_sha256`) is, so the snapshot file cannot be replayed as a
/// credential list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredToken {
    pub token_id: String,
    pub label: String,
    pub secret_sha256: String,
    pub scopes: BTreeSet<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_used: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub rules: TokenRules,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

fn default_enabled() -> bool {
    true
}

impl StoredToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| now >= exp)
    }

    /// Redacted view handed to callers.
    pub fn record(&self) -> TokenRecord {
        TokenRecord {
            token_id: self.token_id.clone(),
            label: self.label.clone(),
            scopes: self.scopes.clone(),
            enabled: self.enabled,
            created_at: self.created_at,
            last_used: self.last_used,
            expires_at: self.expires_at,
            rules: self.rules.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

/// Per-token restrictions layered on top of scopes and the global rules.
///
/// Empty allowlists mean "no restriction"; denylists always apply.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TokenRules {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path_allowlist: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path_denylist: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command_allowlist: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command_denylist: Vec<String>,
    /// Operation names that need approval for this token, in addition to
    /// the global `require_approval_operations`.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub require_approval: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rate_limits: Vec<RateLimit>,
}

// ── Caller-facing views ──────────────────────────────────────

/// A validated token with the secret redacted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenRecord {
    pub token_id: String,
    pub label: String,
    pub scopes: BTreeSet<String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub rules: TokenRules,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl TokenRecord {
    pub fn is_admin(&self) -> bool {
        self.scopes.contains(SCOPE_ADMIN)
    }
}

/// Returned exactly once from `create`/`rotate`; the only place the
/// plaintext secret ever appears.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedToken {
    #[serde(flatten)]
    pub record: TokenRecord,
    pub token: String,
}

/// Parameters for a new token.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewToken {
    pub label: String,
    pub scopes: Vec<String>,
    #[serde(default)]
    pub expires_in_days: Option<u32>,
    #[serde(default)]
    pub rules: TokenRules,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored(expires_at: Option<DateTime<Utc>>) -> StoredToken {
        StoredToken {
            token_id: "tok_1".into(),
            label: "ci".into(),
            secret_sha256: "00".into(),
            scopes: [SCOPE_EXEC.to_string()].into_iter().collect(),
            enabled: true,
            created_at: Utc::now(),
            last_used: None,
            expires_at,
            rules: TokenRules::default(),
            metadata: Default::default(),
        }
    }

    #[test]
    fn test_expiry() {
        let now = Utc::now();
        assert!(!stored(None).is_expired(now));
        assert!(stored(Some(now - chrono::Duration::seconds(1))).is_expired(now));
        assert!(!stored(Some(now + chrono::Duration::hours(1))).is_expired(now));
    }

    #[test]
    fn test_record_omits_digest() {
        let json = serde_json::to_value(stored(None).record()).unwrap();
        assert!(json.get("secret_sha256").is_none());
        assert_eq!(json["token_id"], "tok_1");
    }

    #[test]
    fn test_stored_token_tolerates_missing_optional_fields() {
        let raw = r#"{
            "token_id": "tok_legacy",
            "label": "old",
            "secret_sha256": "ab",
            "scopes": ["admin"],
            "created_at": "2024-01-01T00:00:00Z"
        }"#;
        let tok: StoredToken = serde_json::from_str(raw).unwrap();
        assert!(tok.enabled);
        assert!(tok.rules.rate_limits.is_empty());
        assert!(tok.record().is_admin());
    }

    #[test]
    fn test_known_scopes() {
        assert!(is_known_scope("fs:read"));
        assert!(is_known_scope("fs:*"));
        assert!(!is_known_scope("fs:delete"));
        assert!(!is_known_scope(""));
    }
}
