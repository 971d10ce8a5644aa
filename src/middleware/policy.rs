//! Policy evaluation.
//!
//! Stateless: the verdict depends only on the token, the operation and the
//! global rules passed in. Rules apply in a fixed order and the first match
//! wins:
//!
//! 1. scope (admin implies all)
//! 2. sudo requested while the gateway has `allow_sudo = false`
//! 3. global denylist, for every token including admin
//! 4. the token's own path/command allow and deny lists
//! 5. approval required (global set, then the token's own set)
//!
//! Filesystem paths are expected to be resolved by the confinement layer
//! before they reach the engine.

use std::path::{Path, PathBuf};

use crate::models::operation::{command_name, Operation};
use crate::models::policy::{DenyReason, GlobalRules, PolicyDecision};
use crate::models::token::TokenRecord;
use crate::sandbox::confine::{expand_tilde, resolve_lenient};

use super::rbac::check_scope;

#[derive(Debug, Clone)]
pub struct PolicyEngine {
    allow_sudo: bool,
}

impl PolicyEngine {
    pub fn new(allow_sudo: bool) -> Self {
        Self { allow_sudo }
    }

    pub fn evaluate(
        &self,
        token: &TokenRecord,
        op: &Operation,
        rules: &GlobalRules,
    ) -> PolicyDecision {
        let required = op.required_scope();
        if !check_scope(&token.scopes, required) {
            return PolicyDecision::Deny(DenyReason::InsufficientScope {
                required: required.to_string(),
            });
        }

        if op.is_sudo() && !self.allow_sudo {
            return PolicyDecision::Deny(DenyReason::SudoDisabled);
        }

        let target = Target::of(op);

        if let Some(entry) = rules
            .global_denylist
            .iter()
            .find(|entry| target.matches(entry))
        {
            return PolicyDecision::Deny(DenyReason::Denylist {
                entry: entry.clone(),
            });
        }

        if let Some(reason) = check_token_rules(token, &target) {
            return PolicyDecision::Deny(reason);
        }

        let name = op.name();
        if rules.require_approval_operations.contains(name)
            || token.rules.require_approval.contains(name)
        {
            return PolicyDecision::RequireApproval;
        }

        PolicyDecision::Allow
    }
}

fn check_token_rules(token: &TokenRecord, target: &Target) -> Option<DenyReason> {
    let rules = &token.rules;

    if let Some(entry) = rules
        .path_denylist
        .iter()
        .find(|e| target.paths.iter().any(|p| path_matches(p, e)))
    {
        return Some(DenyReason::TokenRule {
            detail: format!("path matches token denylist entry '{}'", entry),
        });
    }
    if !rules.path_allowlist.is_empty() {
        let outside = target
            .paths
            .iter()
            .take(1)
            .any(|p| !rules.path_allowlist.iter().any(|e| path_matches(p, e)));
        if outside {
            return Some(DenyReason::TokenRule {
                detail: "path is not in the token's allowlist".into(),
            });
        }
    }

    if let Some(argv) = &target.argv {
        if let Some(entry) = rules
            .command_denylist
            .iter()
            .find(|e| command_matches(argv, e))
        {
            return Some(DenyReason::TokenRule {
                detail: format!("command matches token denylist entry '{}'", entry),
            });
        }
        if !rules.command_allowlist.is_empty()
            && !rules.command_allowlist.iter().any(|e| command_matches(argv, e))
        {
            return Some(DenyReason::TokenRule {
                detail: "command is not in the token's allowlist".into(),
            });
        }
    }
    None
}

// ── Matching ─────────────────────────────────────────────────

/// What an operation touches. `paths[0]` is the primary path (fs target or
/// exec cwd); exec arguments that name files follow it.
struct Target {
    paths: Vec<PathBuf>,
    argv: Option<Vec<String>>,
}

impl Target {
    fn of(op: &Operation) -> Self {
        let primary = op.path().to_path_buf();
        match op.command() {
            None => Self {
                paths: vec![primary],
                argv: None,
            },
            Some(cmd) => {
                let argv = effective_argv(cmd);
                let mut paths = vec![primary.clone()];
                paths.extend(
                    argv.iter()
                        .skip(1)
                        .filter(|a| !a.starts_with('-'))
                        .filter_map(|a| argument_path(&primary, a)),
                );
                Self {
                    paths,
                    argv: Some(argv),
                }
            }
        }
    }

    fn matches(&self, entry: &str) -> bool {
        if is_path_pattern(entry) {
            self.paths.iter().any(|p| path_matches(p, entry))
        } else {
            self.argv
                .as_ref()
                .is_some_and(|argv| command_matches(argv, entry))
        }
    }
}

/// The command that will actually run: a leading `sudo` and its flags are
/// stripped.
fn effective_argv(cmd: &[String]) -> Vec<String> {
    match cmd.first() {
        Some(first) if command_name(first) == "sudo" => cmd
            .iter()
            .skip(1)
            .skip_while(|a| a.starts_with('-'))
            .cloned()
            .collect(),
        _ => cmd.to_vec(),
    }
}

fn argument_path(cwd: &Path, arg: &str) -> Option<PathBuf> {
    if arg.is_empty() || arg.contains('\0') {
        return None;
    }
    let expanded = expand_tilde(Path::new(arg));
    let abs = if expanded.is_absolute() {
        expanded
    } else {
        cwd.join(expanded)
    };
    resolve_lenient(&abs).ok()
}

fn is_path_pattern(entry: &str) -> bool {
    entry.starts_with('/') || entry.starts_with('~')
}

/// Component-wise prefix match, so `/etc/ssh` does not match `/etc/sshd`.
fn path_matches(path: &Path, entry: &str) -> bool {
    let expanded = expand_tilde(Path::new(entry));
    let pattern = resolve_lenient(&expanded).unwrap_or(expanded);
    path.starts_with(&pattern)
}

/// Basename of argv[0], or a prefix of the full command on word boundaries.
fn command_matches(argv: &[String], entry: &str) -> bool {
    let entry = entry.trim();
    if entry.is_empty() {
        return false;
    }
    let Some(first) = argv.first() else {
        return false;
    };
    if command_name(first) == entry || first == entry {
        return true;
    }
    let full = argv.join(" ");
    full == entry || full.starts_with(&format!("{} ", entry))
}
