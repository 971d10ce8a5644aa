//! The request pipeline shared by every privileged endpoint:
//!
//! authenticate → scope → confine → policy → rate limit → (approval) → execute
//!
//! Nothing touches the host before every earlier stage has passed. The
//! command itself runs on a detached task, so a caller that disconnects
//! mid-request cannot cut process-group cleanup short.

use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, HeaderMap};
use serde::Serialize;

use crate::errors::AppError;
use crate::middleware::rbac;
use crate::models::approval::ApprovalStatus;
use crate::models::operation::Operation;
use crate::models::policy::{DenyReason, PolicyDecision};
use crate::models::token::TokenRecord;
use crate::sandbox::exec::{ExecOutcome, ExecRequest};
use crate::sandbox::fs::{FileContent, Listing, MkdirResult, RemoveResult, WriteResult};
use crate::AppState;

/// Result of an executed operation, serialized as-is in the response body.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum OpOutput {
    Listing(Listing),
    Content(FileContent),
    Written(WriteResult),
    Mkdir(MkdirResult),
    Removed(RemoveResult),
    Exec(ExecOutcome),
}

/// Extract the credential from `Authorization: Bearer <token>`.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

impl AppState {
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<TokenRecord, AppError> {
        let secret = bearer_token(headers).ok_or(AppError::Unauthenticated)?;
        Ok(self.store.validate(secret)?)
    }

    /// Charge one request against the token's rate limits.
    pub fn admit(&self, token: &TokenRecord) -> Result<(), AppError> {
        self.limiter
            .admit(&token.token_id, &token.rules.rate_limits)
            .map_err(|limit| AppError::RateLimited {
                limit: limit.max_requests,
                window_secs: limit.window_secs,
            })
    }

    /// Run every check for `op` and, if approval is required, block until a
    /// decision arrives. Returns the operation with its paths resolved.
    pub async fn authorize(
        &self,
        token: &TokenRecord,
        op: Operation,
    ) -> Result<Operation, AppError> {
        rbac::require_scope(token, op.required_scope())?;
        let op = self.confine(op)?;

        let rules = self.store.global_rules();
        match self.policy.evaluate(token, &op, &rules) {
            PolicyDecision::Deny(DenyReason::InsufficientScope { required }) => {
                Err(AppError::InsufficientScope { required })
            }
            PolicyDecision::Deny(reason) => {
                tracing::warn!(
                    token_id = %token.token_id,
                    op = %op.summary(),
                    reason = %reason,
                    "operation denied by policy"
                );
                Err(AppError::PolicyDenied {
                    reason: reason.to_string(),
                })
            }
            PolicyDecision::RequireApproval => {
                self.admit(token)?;
                self.await_approval(token, &op).await?;
                Ok(op)
            }
            PolicyDecision::Allow => {
                self.admit(token)?;
                Ok(op)
            }
        }
    }

    /// `authorize` followed by `execute`.
    pub async fn perform(&self, token: &TokenRecord, op: Operation) -> Result<OpOutput, AppError> {
        let op = self.authorize(token, op).await?;
        tracing::info!(token_id = %token.token_id, op = %op.summary(), "executing operation");
        self.execute(&op).await
    }

    async fn await_approval(&self, token: &TokenRecord, op: &Operation) -> Result<(), AppError> {
        let (request, rx) = self.approvals.enqueue(&token.token_id, op.clone());
        match self.approvals.wait(&request, rx).await {
            ApprovalStatus::Approved => Ok(()),
            ApprovalStatus::Denied => Err(AppError::ApprovalDenied { id: request.id }),
            ApprovalStatus::Expired | ApprovalStatus::Pending => {
                Err(AppError::ApprovalExpired { id: request.id })
            }
        }
    }

    fn confine(&self, mut op: Operation) -> Result<Operation, AppError> {
        let confinement = self.fs.confinement();
        let resolved = match &op {
            Operation::FsRm { path, .. } => confinement.resolve_for_removal(path)?,
            Operation::Exec { cwd, .. } => {
                let cwd = confinement.resolve(cwd)?;
                if !cwd.is_dir() {
                    return Err(AppError::InvalidRequest(format!(
                        "cwd is not a directory: {}",
                        cwd.display()
                    )));
                }
                cwd
            }
            other => confinement.resolve(other.path())?,
        };
        *op.path_mut() = resolved;
        Ok(op)
    }

    /// Carry out an operation that has already been authorized.
    pub async fn execute(&self, op: &Operation) -> Result<OpOutput, AppError> {
        match op {
            Operation::FsList { path } => self.fs.ls(path).await.map(OpOutput::Listing),
            Operation::FsRead { path } => self.fs.read(path).await.map(OpOutput::Content),
            Operation::FsWrite {
                path,
                content,
                mode,
            } => self
                .fs
                .write(path, content, *mode)
                .await
                .map(OpOutput::Written),
            Operation::FsMkdir {
                path,
                parents,
                exist_ok,
            } => self
                .fs
                .mkdir(path, *parents, *exist_ok)
                .await
                .map(OpOutput::Mkdir),
            Operation::FsRm { path, recursive } => {
                self.fs.rm(path, *recursive).await.map(OpOutput::Removed)
            }
            Operation::Exec {
                cmd,
                cwd,
                timeout_secs,
                sudo,
            } => {
                // Re-checked: an approved request may have waited a while.
                let cwd = self.fs.confinement().resolve(cwd)?;
                let request = ExecRequest {
                    argv: cmd.clone(),
                    cwd,
                    timeout: Duration::from_secs(*timeout_secs),
                    sudo: *sudo,
                };
                let runner = Arc::clone(&self.runner);
                let outcome = tokio::spawn(async move { runner.run(request).await })
                    .await
                    .map_err(|e| AppError::Internal(anyhow::anyhow!("exec task failed: {}", e)))??;

                tracing::info!(
                    rc = outcome.rc,
                    timed_out = outcome.timed_out,
                    duration_ms = outcome.duration_ms,
                    "command finished"
                );
                Ok(OpOutput::Exec(outcome))
            }
        }
    }
}
