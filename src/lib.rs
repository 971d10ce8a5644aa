//! hostgate: library crate shared by the binary and the integration tests.
//!
//! A local gateway that exposes filesystem and command execution over HTTP
//! to bearer-token holders, behind scopes, a policy engine, rate limits and
//! human approval.

use std::sync::Arc;

use anyhow::Context;

pub mod api;
pub mod config;
pub mod errors;
pub mod gateway;
pub mod jobs;
pub mod middleware;
pub mod models;
pub mod sandbox;
pub mod store;

use middleware::hitl::ApprovalQueue;
use middleware::policy::PolicyEngine;
use middleware::rate_limit::RateLimiter;
use sandbox::confine::Confinement;
use sandbox::exec::{CommandRunner, ProcessGroupRunner};
use sandbox::fs::FsGateway;
use store::TokenStore;

/// Shared application state passed to handlers and background jobs.
///
/// Every registry is owned here and injected into the router, so tests can
/// build isolated instances side by side.
pub struct AppState {
    pub config: config::Config,
    pub store: TokenStore,
    pub policy: PolicyEngine,
    pub limiter: RateLimiter,
    pub approvals: ApprovalQueue,
    pub fs: FsGateway,
    pub runner: Arc<dyn CommandRunner>,
}

impl AppState {
    /// Open the token store named by `config` and wire the default runner.
    pub fn new(config: config::Config) -> anyhow::Result<Self> {
        let store = TokenStore::open(&config.token_file, config.save_interval)
            .with_context(|| format!("opening token store {}", config.token_file.display()))?;
        let runner = Arc::new(ProcessGroupRunner::new(
            config.kill_grace,
            config.max_output_bytes,
        ));
        Self::with_parts(config, store, runner)
    }

    pub fn with_parts(
        config: config::Config,
        store: TokenStore,
        runner: Arc<dyn CommandRunner>,
    ) -> anyhow::Result<Self> {
        let confinement = Confinement::new(&config.base_dir, config.allow_absolute)
            .with_context(|| format!("base directory {}", config.base_dir.display()))?;
        Ok(Self {
            policy: PolicyEngine::new(config.allow_sudo),
            limiter: RateLimiter::new(config.rate_limit),
            approvals: ApprovalQueue::new(config.approval_wait),
            fs: FsGateway::new(confinement),
            store,
            runner,
            config,
        })
    }
}
