use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::operation::{OP_EXEC_SUDO, OP_FS_RM};

// ── Global rules ─────────────────────────────────────────────

/// Scope-independent rules persisted alongside the tokens.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GlobalRules {
    /// Command or path patterns no token may touch, `admin` included.
    /// Path entries (absolute or `~`-prefixed) match by path prefix;
    /// other entries match the command basename or a full-command prefix.
    #[serde(default)]
    pub global_denylist: Vec<String>,
    /// Operation names that are withheld until a human approves them.
    #[serde(default = "default_require_approval")]
    pub require_approval_operations: BTreeSet<String>,
}

fn default_require_approval() -> BTreeSet<String> {
    [OP_FS_RM, OP_EXEC_SUDO]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for GlobalRules {
    fn default() -> Self {
        Self {
            global_denylist: Vec::new(),
            require_approval_operations: default_require_approval(),
        }
    }
}

impl GlobalRules {
    /// Rules written by `hostgate init`.
    pub fn example() -> Self {
        Self {
            global_denylist: vec![
                "/etc/shadow".into(),
                "/etc/sudoers".into(),
                "~/.ssh".into(),
                "~/.aws/credentials".into(),
                "~/.gnupg".into(),
            ],
            require_approval_operations: default_require_approval(),
        }
    }
}

// ── Decisions ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    Deny(DenyReason),
    RequireApproval,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    InsufficientScope { required: String },
    /// Matched an entry of the global denylist.
    Denylist { entry: String },
    /// Rejected by one of the token's own allow/deny lists.
    TokenRule { detail: String },
    /// `sudo` requested on a gateway configured with `allow_sudo=false`.
    SudoDisabled,
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DenyReason::InsufficientScope { required } => {
                write!(f, "missing required scope '{}'", required)
            }
            DenyReason::Denylist { entry } => write!(f, "matches global denylist entry '{}'", entry),
            DenyReason::TokenRule { detail } => write!(f, "{}", detail),
            DenyReason::SudoDisabled => write!(f, "sudo is disabled on this gateway"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_approval_set_gets_defaults() {
        let rules: GlobalRules = serde_json::from_str(r#"{"global_denylist": ["/etc"]}"#).unwrap();
        assert!(rules.require_approval_operations.contains("fs_rm"));
        assert!(rules.require_approval_operations.contains("exec:sudo"));
    }

    #[test]
    fn test_explicit_empty_approval_set_is_kept() {
        let rules: GlobalRules =
            serde_json::from_str(r#"{"require_approval_operations": []}"#).unwrap();
        assert!(rules.require_approval_operations.is_empty());
    }
}
