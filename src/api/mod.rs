use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Request, State},
    http::{HeaderValue, StatusCode},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::errors::AppError;
use crate::AppState;

pub mod extract;
pub mod handlers;
pub mod ops;

/// Request bodies carry file contents for `/fs/write`.
const MAX_BODY_BYTES: usize = 25 * 1024 * 1024;

/// Build the full HTTP surface. Every route except `/health` sits behind
/// [`auth_middleware`], which runs before any body or query is parsed.
pub fn router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        // Filesystem
        .route("/fs/ls", get(ops::fs_ls))
        .route("/fs/read", get(ops::fs_read))
        .route("/fs/write", post(ops::fs_write))
        .route("/fs/mkdir", post(ops::fs_mkdir))
        .route("/fs/rm", post(ops::fs_rm))
        // Commands
        .route("/exec", post(ops::exec))
        // Token administration
        .route("/tokens/list", get(handlers::list_tokens))
        .route("/tokens/create", post(handlers::create_token))
        .route("/tokens/rotate", post(handlers::rotate_token))
        .route("/tokens/disable", post(handlers::disable_token))
        // Approvals
        .route("/approval/pending", get(handlers::list_pending_approvals))
        .route("/approval/decide", post(handlers::decide_approval))
        .route("/approval/status", get(handlers::approval_status))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .fallback(fallback_404)
        .with_state(state)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(request_id_middleware))
        .layer(middleware::from_fn(security_headers_middleware))
}

async fn health() -> &'static str {
    "ok"
}

async fn fallback_404() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// Middleware: resolves the bearer token and stores its [`TokenRecord`] in
/// the request extensions for handlers to pick up.
///
/// [`TokenRecord`]: crate::models::token::TokenRecord
async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = state.authenticate(req.headers())?;
    req.extensions_mut().insert(token);
    Ok(next.run(req).await)
}

/// Middleware: injects a unique X-Request-Id into every response.
/// This allows clients to correlate errors with gateway logs.
async fn request_id_middleware(req: Request, next: Next) -> Response {
    let req_id = uuid::Uuid::new_v4().to_string();
    let mut resp = next.run(req).await;
    if let Ok(val) = HeaderValue::from_str(&req_id) {
        resp.headers_mut().insert("x-request-id", val);
    }
    resp
}

/// Middleware: injects security headers into every response.
async fn security_headers_middleware(req: Request, next: Next) -> Response {
    let mut resp = next.run(req).await;
    let headers = resp.headers_mut();

    headers.insert(
        "X-Content-Type-Options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("X-Frame-Options", HeaderValue::from_static("DENY"));
    // Responses may contain file contents and freshly issued secrets.
    headers.insert("Cache-Control", HeaderValue::from_static("no-store"));
    headers.insert("Referrer-Policy", HeaderValue::from_static("no-referrer"));
    headers.remove("Server");

    resp
}
