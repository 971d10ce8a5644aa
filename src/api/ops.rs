//! Filesystem and exec endpoints. Each handler only builds an
//! [`Operation`]; authorization and execution go through
//! [`AppState::perform`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, Extension, Json};
use serde::Deserialize;

use super::extract::{ApiJson, ApiQuery};
use crate::config::Config;
use crate::errors::AppError;
use crate::gateway::OpOutput;
use crate::models::operation::{Operation, WriteMode};
use crate::models::token::TokenRecord;
use crate::AppState;

// ── Request DTOs ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct PathQuery {
    pub path: PathBuf,
}

#[derive(Deserialize)]
pub struct WriteRequest {
    pub path: PathBuf,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub mode: WriteMode,
}

#[derive(Deserialize)]
pub struct MkdirRequest {
    pub path: PathBuf,
    #[serde(default)]
    pub parents: bool,
    #[serde(default)]
    pub exist_ok: bool,
}

#[derive(Deserialize)]
pub struct RmRequest {
    pub path: PathBuf,
    #[serde(default)]
    pub recursive: bool,
}

#[derive(Deserialize)]
pub struct ExecBody {
    pub cmd: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Seconds.
    pub timeout: Option<u64>,
    #[serde(default)]
    pub sudo: bool,
}

impl ExecBody {
    /// Apply defaults and clamp the timeout.
    pub fn into_operation(self, config: &Config) -> Result<Operation, AppError> {
        if self.cmd.is_empty() || self.cmd[0].trim().is_empty() {
            return Err(AppError::InvalidRequest("cmd must not be empty".into()));
        }
        let default = config.exec_default_timeout;
        let requested = self.timeout.map(Duration::from_secs).unwrap_or(default);
        let timeout_secs = requested
            .clamp(Duration::from_secs(1), config.exec_max_timeout.max(Duration::from_secs(1)))
            .as_secs();

        Ok(Operation::Exec {
            cmd: self.cmd,
            cwd: self.cwd.unwrap_or_else(|| config.base_dir.clone()),
            timeout_secs,
            sudo: self.sudo,
        })
    }
}

// ── Handlers ─────────────────────────────────────────────────

/// GET /fs/ls?path=
pub async fn fs_ls(
    State(state): State<Arc<AppState>>,
    Extension(token): Extension<TokenRecord>,
    ApiQuery(q): ApiQuery<PathQuery>,
) -> Result<Json<OpOutput>, AppError> {
    run(&state, &token, Operation::FsList { path: q.path }).await
}

/// GET /fs/read?path=
pub async fn fs_read(
    State(state): State<Arc<AppState>>,
    Extension(token): Extension<TokenRecord>,
    ApiQuery(q): ApiQuery<PathQuery>,
) -> Result<Json<OpOutput>, AppError> {
    run(&state, &token, Operation::FsRead { path: q.path }).await
}

/// POST /fs/write
pub async fn fs_write(
    State(state): State<Arc<AppState>>,
    Extension(token): Extension<TokenRecord>,
    ApiJson(body): ApiJson<WriteRequest>,
) -> Result<Json<OpOutput>, AppError> {
    let op = Operation::FsWrite {
        path: body.path,
        content: body.content,
        mode: body.mode,
    };
    run(&state, &token, op).await
}

/// POST /fs/mkdir
pub async fn fs_mkdir(
    State(state): State<Arc<AppState>>,
    Extension(token): Extension<TokenRecord>,
    ApiJson(body): ApiJson<MkdirRequest>,
) -> Result<Json<OpOutput>, AppError> {
    let op = Operation::FsMkdir {
        path: body.path,
        parents: body.parents,
        exist_ok: body.exist_ok,
    };
    run(&state, &token, op).await
}

/// POST /fs/rm
pub async fn fs_rm(
    State(state): State<Arc<AppState>>,
    Extension(token): Extension<TokenRecord>,
    ApiJson(body): ApiJson<RmRequest>,
) -> Result<Json<OpOutput>, AppError> {
    let op = Operation::FsRm {
        path: body.path,
        recursive: body.recursive,
    };
    run(&state, &token, op).await
}

/// POST /exec
///
/// A timed-out or failing command is still a 200: the outcome carries `rc`
/// and `timed_out`.
pub async fn exec(
    State(state): State<Arc<AppState>>,
    Extension(token): Extension<TokenRecord>,
    ApiJson(body): ApiJson<ExecBody>,
) -> Result<Json<OpOutput>, AppError> {
    let op = body.into_operation(&state.config)?;
    run(&state, &token, op).await
}

async fn run(
    state: &AppState,
    token: &TokenRecord,
    op: Operation,
) -> Result<Json<OpOutput>, AppError> {
    Ok(Json(state.perform(token, op).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(cmd: &[&str], timeout: Option<u64>) -> ExecBody {
        ExecBody {
            cmd: cmd.iter().map(|s| s.to_string()).collect(),
            cwd: None,
            timeout,
            sudo: false,
        }
    }

    #[test]
    fn test_exec_defaults_and_clamp() {
        let config = Config::default();
        match body(&["ls"], None).into_operation(&config).unwrap() {
            Operation::Exec {
                timeout_secs, cwd, ..
            } => {
                assert_eq!(timeout_secs, config.exec_default_timeout.as_secs());
                assert_eq!(cwd, config.base_dir);
            }
            other => panic!("unexpected {:?}", other),
        }
        match body(&["ls"], Some(100_000)).into_operation(&config).unwrap() {
            Operation::Exec { timeout_secs, .. } => {
                assert_eq!(timeout_secs, config.exec_max_timeout.as_secs())
            }
            other => panic!("unexpected {:?}", other),
        }
        match body(&["ls"], Some(0)).into_operation(&config).unwrap() {
            Operation::Exec { timeout_secs, .. } => assert_eq!(timeout_secs, 1),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_empty_cmd_rejected() {
        let config = Config::default();
        assert!(matches!(
            body(&[], None).into_operation(&config),
            Err(AppError::InvalidRequest(_))
        ));
        assert!(matches!(
            body(&[" "], None).into_operation(&config),
            Err(AppError::InvalidRequest(_))
        ));
    }
}
