//! Shared harness for integration tests: an isolated gateway rooted in a
//! temp directory, plus a one-shot HTTP client over the axum router.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, HeaderMap, Method, Request, StatusCode};
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

use hostgate::config::Config;
use hostgate::models::token::NewToken;
use hostgate::sandbox::exec::{CommandRunner, ExecError, ExecOutcome, ExecRequest, ProcessGroupRunner};
use hostgate::store::TokenStore;
use hostgate::{api, AppState};

/// Records every request instead of spawning anything.
#[derive(Default)]
pub struct CountingRunner {
    pub calls: AtomicUsize,
}

impl CountingRunner {
    pub fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CommandRunner for CountingRunner {
    async fn run(&self, req: ExecRequest) -> Result<ExecOutcome, ExecError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ExecOutcome {
            rc: 0,
            stdout: req.command_line().join(" "),
            stderr: String::new(),
            duration_ms: 0,
            timed_out: false,
            truncated: false,
        })
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub state: Arc<AppState>,
    pub runner: Arc<CountingRunner>,
    /// Secret of the bootstrap admin token.
    pub admin: String,
}

pub struct Reply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

impl Reply {
    pub fn code(&self) -> &str {
        self.body["error"]["code"].as_str().unwrap_or("")
    }
}

pub fn test_config(dir: &TempDir) -> Config {
    let base = dir.path().join("base");
    std::fs::create_dir_all(&base).unwrap();
    Config {
        token_file: dir.path().join("state").join("tokens.json"),
        base_dir: base,
        approval_wait: Duration::from_secs(5),
        exec_default_timeout: Duration::from_secs(5),
        kill_grace: Duration::from_millis(200),
        ..Config::default()
    }
}

pub fn harness() -> Harness {
    harness_with(|_| {})
}

/// Gateway with a counting runner; nothing is ever spawned.
pub fn harness_with(tweak: impl FnOnce(&mut Config)) -> Harness {
    let runner = Arc::new(CountingRunner::default());
    build(runner.clone(), runner, tweak)
}

/// Gateway that really runs commands in process groups.
pub fn harness_real(tweak: impl FnOnce(&mut Config)) -> Harness {
    let unused = Arc::new(CountingRunner::default());
    let real = Arc::new(ProcessGroupRunner::new(Duration::from_millis(200), 64 * 1024));
    build(unused, real, tweak)
}

fn build(
    runner: Arc<CountingRunner>,
    active: Arc<dyn CommandRunner>,
    tweak: impl FnOnce(&mut Config),
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    tweak(&mut config);
    let store = TokenStore::open(&config.token_file, config.save_interval).unwrap();
    let state = Arc::new(AppState::with_parts(config, store, active).unwrap());
    let admin = state.store.bootstrap_admin().unwrap().unwrap().token;
    Harness {
        dir,
        state,
        runner,
        admin,
    }
}

impl Harness {
    pub fn base(&self) -> PathBuf {
        self.state.fs.confinement().base_dir().to_path_buf()
    }

    /// Issue a token with the given scopes; returns its secret.
    pub fn token(&self, label: &str, scopes: &[&str]) -> String {
        self.token_with(NewToken {
            label: label.into(),
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        })
    }

    pub fn token_with(&self, new: NewToken) -> String {
        self.state.store.create(new).unwrap().token
    }

    pub async fn get(&self, uri: &str, token: Option<&str>) -> Reply {
        send(
            self.state.clone(),
            Method::GET,
            uri.to_string(),
            token.map(str::to_string),
            None,
        )
        .await
    }

    pub async fn post(&self, uri: &str, token: Option<&str>, body: Value) -> Reply {
        send(
            self.state.clone(),
            Method::POST,
            uri.to_string(),
            token.map(str::to_string),
            Some(body),
        )
        .await
    }
}

/// Owned arguments so the future can be handed to `tokio::spawn`.
pub async fn send(
    state: Arc<AppState>,
    method: Method,
    uri: String,
    token: Option<String>,
    body: Option<Value>,
) -> Reply {
    let mut builder = Request::builder().method(method).uri(uri.as_str());
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    let request = match body {
        Some(json) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = api::router(state).oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = serde_json::from_slice(&bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
    Reply {
        status,
        headers,
        body,
    }
}

/// Percent-encode a path for a query string.
pub fn q(path: &std::path::Path) -> String {
    path.display()
        .to_string()
        .bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                (b as char).to_string()
            }
            _ => format!("%{:02X}", b),
        })
        .collect()
}
