use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::middleware::hitl::ApprovalError;
use crate::sandbox::exec::ExecError;
use crate::sandbox::fs::FsError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("unauthenticated")]
    Unauthenticated,

    #[error("insufficient scope: '{required}' required")]
    InsufficientScope { required: String },

    #[error("policy denied: {reason}")]
    PolicyDenied { reason: String },

    #[error("approval denied")]
    ApprovalDenied { id: String },

    #[error("approval expired")]
    ApprovalExpired { id: String },

    #[error("rate limit exceeded")]
    RateLimited { limit: u32, window_secs: u64 },

    #[error("path outside base directory: {0}")]
    PathOutsideBase(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already decided: {0}")]
    AlreadyDecided(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("token store corrupted")]
    StoreCorrupted,

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, code, msg) = match &self {
            AppError::Unauthenticated => (
                StatusCode::UNAUTHORIZED,
                "authentication_error",
                "unauthenticated",
                "invalid or missing token".to_string(),
            ),
            AppError::InsufficientScope { required } => (
                StatusCode::FORBIDDEN,
                "permission_error",
                "insufficient_scope",
                format!("token lacks the '{}' scope", required),
            ),
            AppError::PolicyDenied { reason } => (
                StatusCode::FORBIDDEN,
                "permission_error",
                "policy_denylist",
                format!("request blocked by policy: {}", reason),
            ),
            AppError::ApprovalDenied { id } => (
                StatusCode::FORBIDDEN,
                "permission_error",
                "approval_denied",
                format!("approval request {} was denied", id),
            ),
            AppError::ApprovalExpired { id } => (
                StatusCode::REQUEST_TIMEOUT,
                "timeout_error",
                "approval_expired",
                format!("approval request {} expired without a decision", id),
            ),
            AppError::RateLimited { limit, window_secs } => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limit_error",
                "rate_limited",
                format!("rate limit exceeded: {} requests per {}s", limit, window_secs),
            ),
            AppError::PathOutsideBase(path) => (
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "path_outside_base",
                format!("path is outside the permitted base directory: {}", path),
            ),
            AppError::InvalidRequest(msg) => (
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "invalid_request",
                msg.clone(),
            ),
            AppError::NotFound(what) => (
                StatusCode::NOT_FOUND,
                "invalid_request_error",
                "not_found",
                format!("not found: {}", what),
            ),
            AppError::AlreadyDecided(state) => (
                StatusCode::CONFLICT,
                "invalid_request_error",
                "already_decided",
                format!("approval request is already {}", state),
            ),
            AppError::Conflict(msg) => (
                StatusCode::CONFLICT,
                "invalid_request_error",
                "conflict",
                msg.clone(),
            ),
            AppError::StoreCorrupted => {
                tracing::error!("token store is corrupted; refusing privileged request");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "internal_error",
                    "store_corrupted",
                    "credential store unavailable".to_string(),
                )
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {:#}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal_error",
                    "internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "message": msg,
                "type": error_type,
                "code": code,
            }
        }));

        let retry_after = match &self {
            AppError::RateLimited { window_secs, .. } => Some(*window_secs),
            _ => None,
        };

        let mut response = (status, body).into_response();

        if let Some(secs) = retry_after {
            if let Ok(value) = axum::http::HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert("retry-after", value);
            }
        }

        response
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unauthenticated => AppError::Unauthenticated,
            StoreError::UnknownToken(id) => AppError::NotFound(format!("token '{}'", id)),
            StoreError::Invalid(msg) => AppError::InvalidRequest(msg),
            StoreError::Corrupted { .. } => AppError::StoreCorrupted,
            other => AppError::Internal(anyhow::Error::new(other)),
        }
    }
}

impl From<ApprovalError> for AppError {
    fn from(err: ApprovalError) -> Self {
        match err {
            ApprovalError::NotFound(id) => AppError::NotFound(format!("approval request '{}'", id)),
            ApprovalError::AlreadyDecided(state) => AppError::AlreadyDecided(state.to_string()),
        }
    }
}

impl From<FsError> for AppError {
    fn from(err: FsError) -> Self {
        match err {
            FsError::NotFound(path) => AppError::NotFound(path),
            FsError::AlreadyExists(path) => {
                AppError::Conflict(format!("path already exists: {}", path))
            }
            FsError::NotEmpty(path) => AppError::Conflict(format!(
                "directory not empty (set recursive to remove): {}",
                path
            )),
            FsError::Invalid(msg) => AppError::InvalidRequest(msg),
            FsError::Io(e) => AppError::Internal(anyhow::Error::new(e)),
        }
    }
}

impl From<ExecError> for AppError {
    fn from(err: ExecError) -> Self {
        match err {
            ExecError::EmptyCommand | ExecError::Spawn { .. } => {
                AppError::InvalidRequest(err.to_string())
            }
            ExecError::Io(e) => AppError::Internal(anyhow::Error::new(e)),
        }
    }
}
