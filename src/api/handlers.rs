use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Extension, Json};
use serde::{Deserialize, Serialize};

use super::extract::{ApiJson, ApiQuery};
use crate::errors::AppError;
use crate::middleware::rbac;
use crate::models::approval::{ApprovalRequest, Decision};
use crate::models::token::{IssuedToken, NewToken, TokenRecord};
use crate::AppState;

// ── Request / Response DTOs ──────────────────────────────────

#[derive(Deserialize)]
pub struct TokenIdRequest {
    pub token_id: String,
}

#[derive(Serialize)]
pub struct TokenListResponse {
    pub tokens: Vec<TokenRecord>,
}

#[derive(Deserialize)]
pub struct DecisionRequest {
    pub id: String,
    #[serde(alias = "decision")]
    pub outcome: Decision,
}

#[derive(Deserialize)]
pub struct ApprovalQuery {
    pub id: String,
}

#[derive(Serialize)]
pub struct PendingResponse {
    pub pending: Vec<ApprovalRequest>,
}

/// Require `admin` and charge the token's rate limits.
fn admin(state: &AppState, token: &TokenRecord) -> Result<(), AppError> {
    rbac::require_admin(token)?;
    state.admit(token)
}

// ── Tokens ───────────────────────────────────────────────────

/// GET /tokens/list
pub async fn list_tokens(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<TokenRecord>,
) -> Result<Json<TokenListResponse>, AppError> {
    admin(&state, &caller)?;
    Ok(Json(TokenListResponse {
        tokens: state.store.list(),
    }))
}

/// POST /tokens/create
///
/// The plaintext secret is in this response and nowhere else.
pub async fn create_token(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<TokenRecord>,
    ApiJson(payload): ApiJson<NewToken>,
) -> Result<(StatusCode, Json<IssuedToken>), AppError> {
    admin(&state, &caller)?;
    let issued = state.store.create(payload)?;
    tracing::info!(
        token_id = %issued.record.token_id,
        label = %issued.record.label,
        created_by = %caller.token_id,
        "token created"
    );
    Ok((StatusCode::CREATED, Json(issued)))
}

/// POST /tokens/rotate
pub async fn rotate_token(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<TokenRecord>,
    ApiJson(payload): ApiJson<TokenIdRequest>,
) -> Result<Json<IssuedToken>, AppError> {
    admin(&state, &caller)?;
    let issued = state.store.rotate(&payload.token_id)?;
    tracing::info!(token_id = %payload.token_id, rotated_by = %caller.token_id, "token rotated");
    Ok(Json(issued))
}

/// POST /tokens/disable
pub async fn disable_token(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<TokenRecord>,
    ApiJson(payload): ApiJson<TokenIdRequest>,
) -> Result<Json<TokenRecord>, AppError> {
    admin(&state, &caller)?;
    let record = state.store.disable(&payload.token_id)?;
    tracing::info!(token_id = %payload.token_id, disabled_by = %caller.token_id, "token disabled");
    Ok(Json(record))
}

// ── Approvals ────────────────────────────────────────────────

/// GET /approval/pending
pub async fn list_pending_approvals(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<TokenRecord>,
) -> Result<Json<PendingResponse>, AppError> {
    admin(&state, &caller)?;
    Ok(Json(PendingResponse {
        pending: state.approvals.list_pending(),
    }))
}

/// POST /approval/decide
pub async fn decide_approval(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<TokenRecord>,
    ApiJson(payload): ApiJson<DecisionRequest>,
) -> Result<Json<ApprovalRequest>, AppError> {
    admin(&state, &caller)?;
    let request = state
        .approvals
        .decide(&payload.id, payload.outcome, &caller.token_id)?;
    Ok(Json(request))
}

/// GET /approval/status?id=
///
/// Visible to admins and to the token that raised the request. Anyone else
/// gets `not_found` so ids cannot be probed.
pub async fn approval_status(
    State(state): State<Arc<AppState>>,
    Extension(token): Extension<TokenRecord>,
    ApiQuery(q): ApiQuery<ApprovalQuery>,
) -> Result<Json<ApprovalRequest>, AppError> {
    state.admit(&token)?;
    let request = state.approvals.get(&q.id)?;
    if !token.is_admin() && request.token_id != token.token_id {
        return Err(AppError::NotFound(format!(
            "approval request '{}' not found",
            q.id
        )));
    }
    Ok(Json(request))
}
