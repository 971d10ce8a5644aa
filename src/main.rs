use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use hostgate::models::policy::GlobalRules;
use hostgate::models::token::NewToken;
use hostgate::store::{self, TokenStore};
use hostgate::{api, config, jobs, AppState};

mod cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::load()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("hostgate=info,tower_http=info"));
    let registry = tracing_subscriber::registry().with(filter);
    if cfg.log_json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    let args = cli::Cli::parse();

    let result = match args.command {
        Some(cli::Commands::Serve { port }) => {
            let port = port.unwrap_or(cfg.port);
            run_server(cfg, port).await
        }
        Some(cli::Commands::Token { command }) => handle_token_command(command, &cfg),
        Some(cli::Commands::Init) => handle_init(&cfg),
        Some(cli::Commands::Migrate { tokens, token_file }) => {
            handle_migrate(&cfg, tokens.as_deref(), token_file.as_deref())
        }
        None => {
            let port = cfg.port;
            run_server(cfg, port).await
        }
    };

    if let Err(ref e) = result {
        eprintln!("Error: {:?}", e);
    }
    result
}

async fn run_server(cfg: config::Config, port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::new(cfg.bind, port);
    let state = Arc::new(AppState::new(cfg)?);

    if let Some(issued) = state.store.bootstrap_admin()? {
        // Printed once; only the digest is stored.
        eprintln!("No tokens found; generated an admin token:");
        eprintln!("  ID:     {}", issued.record.token_id);
        eprintln!("  Secret: {}", issued.token);
        eprintln!("  Use:    Authorization: Bearer <secret>");
        tracing::warn!(token_id = %issued.record.token_id, "bootstrap admin token created");
    }

    tracing::info!(
        base_dir = %state.fs.confinement().base_dir().display(),
        allow_absolute = state.config.allow_absolute,
        allow_sudo = state.config.allow_sudo,
        "sandbox configured"
    );

    let flush_job = jobs::flush::spawn(state.clone());
    let sweep_job = jobs::approvals::spawn(state.clone());

    let app = api::router(state.clone());

    tracing::info!("hostgate listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    flush_job.abort();
    sweep_job.abort();

    match state.store.flush() {
        Ok(true) => tracing::info!("token state flushed on shutdown"),
        Ok(false) => {}
        Err(e) => tracing::error!("final token flush failed: {}", e),
    }
    tracing::info!("hostgate stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received, draining connections");
}

fn open_store(cfg: &config::Config) -> anyhow::Result<TokenStore> {
    // CLI commands write synchronously; no debounce needed.
    TokenStore::open(&cfg.token_file, Duration::ZERO)
        .with_context(|| format!("opening token store {}", cfg.token_file.display()))
}

fn handle_token_command(cmd: cli::TokenCommands, cfg: &config::Config) -> anyhow::Result<()> {
    let store = open_store(cfg)?;
    match cmd {
        cli::TokenCommands::Create {
            label,
            scopes,
            expires_in_days,
            rate_limits,
        } => {
            let mut new_token = NewToken {
                label,
                scopes,
                expires_in_days,
                ..Default::default()
            };
            for raw in rate_limits {
                let limit = hostgate::middleware::rate_limit::parse_limit(&raw)
                    .ok_or_else(|| anyhow::anyhow!("Invalid rate limit: {} (try 100/1m)", raw))?;
                new_token.rules.rate_limits.push(limit);
            }

            let issued = store.create(new_token)?;
            println!(
                "Token created:\n  ID:     {}\n  Scopes: {}\n  Secret: {}\n  Use:    Authorization: Bearer <secret>",
                issued.record.token_id,
                issued.record.scopes.iter().cloned().collect::<Vec<_>>().join(","),
                issued.token
            );
        }
        cli::TokenCommands::List => {
            let tokens = store.list();
            if tokens.is_empty() {
                println!("No tokens found.");
            } else {
                println!(
                    "{:<22} {:<24} {:<28} {:<8} {:<20}",
                    "ID", "LABEL", "SCOPES", "ENABLED", "LAST USED"
                );
                for t in tokens {
                    let last_used = t
                        .last_used
                        .map(|ts| ts.format("%Y-%m-%d %H:%M:%S").to_string())
                        .unwrap_or_else(|| "never".into());
                    println!(
                        "{:<22} {:<24} {:<28} {:<8} {:<20}",
                        t.token_id,
                        t.label,
                        t.scopes.iter().cloned().collect::<Vec<_>>().join(","),
                        t.enabled,
                        last_used
                    );
                }
            }
        }
        cli::TokenCommands::Rotate { token_id } => {
            let issued = store.rotate(&token_id)?;
            println!(
                "Token rotated:\n  ID:     {}\n  Secret: {}",
                issued.record.token_id, issued.token
            );
        }
        cli::TokenCommands::Disable { token_id } => {
            store.disable(&token_id)?;
            println!("Token disabled.");
        }
    }
    Ok(())
}

fn handle_init(cfg: &config::Config) -> anyhow::Result<()> {
    if cfg.token_file.exists() {
        anyhow::bail!(
            "{} already exists; refusing to overwrite",
            cfg.token_file.display()
        );
    }
    let store = open_store(cfg)?;
    store.set_global_rules(GlobalRules::example())?;
    let issued = store
        .bootstrap_admin()?
        .context("fresh store unexpectedly contains tokens")?;

    println!("Wrote {}", cfg.token_file.display());
    println!(
        "Admin token:\n  ID:     {}\n  Secret: {}",
        issued.record.token_id, issued.token
    );
    Ok(())
}

fn handle_migrate(
    cfg: &config::Config,
    inline: Option<&str>,
    file: Option<&std::path::Path>,
) -> anyhow::Result<()> {
    let secrets = store::read_legacy_secrets(inline, file).context("reading legacy tokens")?;
    if secrets.is_empty() {
        println!("No legacy tokens supplied (set HOSTGATE_LEGACY_TOKENS or HOSTGATE_LEGACY_TOKEN_FILE).");
        return Ok(());
    }

    let store = open_store(cfg)?;
    let mut imported = 0;
    for secret in &secrets {
        match store.import(secret, "Migrated legacy token")? {
            Some(record) => {
                imported += 1;
                println!("Imported {} (fingerprint {})", record.token_id, store::fingerprint(secret));
            }
            None => println!("Skipped already-known token (fingerprint {})", store::fingerprint(secret)),
        }
    }
    println!("{} of {} legacy tokens imported.", imported, secrets.len());
    Ok(())
}
