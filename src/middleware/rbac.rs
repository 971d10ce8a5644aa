use std::collections::BTreeSet;

use crate::errors::AppError;
use crate::models::token::{TokenRecord, SCOPE_ADMIN};

/// Scope-based access control.
/// Format: "resource:action" (e.g., "fs:read", "fs:write"). A bare scope such
/// as "exec" names a whole resource.
pub fn check_scope(scopes: &BTreeSet<String>, required_scope: &str) -> bool {
    // admin implies every other scope
    if scopes.contains(SCOPE_ADMIN) {
        return true;
    }

    if scopes.contains(required_scope) {
        return true;
    }

    // Resource wildcard (e.g., "fs:*" matches "fs:write")
    if let Some((resource, _)) = required_scope.split_once(':') {
        let resource_wildcard = format!("{}:*", resource);
        if scopes.contains(&resource_wildcard) {
            return true;
        }
    }

    false
}

/// Return 403 `insufficient_scope` unless the token carries `scope`.
pub fn require_scope(token: &TokenRecord, scope: &str) -> Result<(), AppError> {
    if check_scope(&token.scopes, scope) {
        return Ok(());
    }
    tracing::warn!(
        token_id = %token.token_id,
        scope = scope,
        "access denied: missing scope"
    );
    Err(AppError::InsufficientScope {
        required: scope.to_string(),
    })
}

pub fn require_admin(token: &TokenRecord) -> Result<(), AppError> {
    require_scope(token, SCOPE_ADMIN)
}

// ── Tests ───────────────────────────────────────────────────────
