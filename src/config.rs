use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use crate::models::token::RateLimit;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: IpAddr,
    pub port: u16,
    /// Token/policy snapshot. The backup and temp files live next to it.
    pub token_file: PathBuf,
    /// Confinement root for filesystem and exec operations.
    pub base_dir: PathBuf,
    /// Permit paths outside `base_dir` (still subject to the denylists).
    pub allow_absolute: bool,
    /// Honor `sudo: true` on exec requests. Independent of token scope.
    pub allow_sudo: bool,
    /// Minimum interval between debounced `last_used` flushes.
    /// Set via HOSTGATE_SAVE_INTERVAL_SECS. Default: 60.
    pub save_interval: Duration,
    /// Default per-token limit, used when a token has no limits of its own.
    pub rate_limit: RateLimit,
    /// How long a request blocks waiting for a human decision.
    pub approval_wait: Duration,
    /// How long decided/expired approval requests stay queryable.
    pub approval_retention: Duration,
    pub exec_default_timeout: Duration,
    pub exec_max_timeout: Duration,
    /// Delay between SIGTERM and SIGKILL when a command times out.
    pub kill_grace: Duration,
    /// Per-stream capture limit for stdout/stderr.
    pub max_output_bytes: usize,
    pub log_json: bool,
}

impl Default for Config {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 8080,
            token_file: home.join(".hostgate").join("tokens.json"),
            base_dir: home,
            allow_absolute: false,
            allow_sudo: false,
            save_interval: Duration::from_secs(60),
            rate_limit: RateLimit {
                max_requests: 120,
                window_secs: 60,
            },
            approval_wait: Duration::from_secs(30),
            approval_retention: Duration::from_secs(3600),
            exec_default_timeout: Duration::from_secs(60),
            exec_max_timeout: Duration::from_secs(600),
            kill_grace: Duration::from_millis(2000),
            max_output_bytes: 1024 * 1024,
            log_json: false,
        }
    }
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();

    let defaults = Config::default();

    let bind = match std::env::var("HOSTGATE_BIND") {
        Ok(raw) => raw
            .parse()
            .map_err(|_| anyhow::anyhow!("HOSTGATE_BIND is not an IP address: {}", raw))?,
        Err(_) => defaults.bind,
    };

    let rate_limit = RateLimit {
        max_requests: env_parse("HOSTGATE_RATE_LIMIT").unwrap_or(defaults.rate_limit.max_requests),
        window_secs: env_parse("HOSTGATE_RATE_LIMIT_WINDOW_SECS")
            .unwrap_or(defaults.rate_limit.window_secs),
    };
    if rate_limit.max_requests == 0 || rate_limit.window_secs == 0 {
        anyhow::bail!("HOSTGATE_RATE_LIMIT and HOSTGATE_RATE_LIMIT_WINDOW_SECS must be non-zero");
    }

    let exec_default_timeout = env_secs("HOSTGATE_EXEC_TIMEOUT_SECS", defaults.exec_default_timeout);
    let exec_max_timeout = env_secs("HOSTGATE_EXEC_MAX_TIMEOUT_SECS", defaults.exec_max_timeout);
    if exec_default_timeout > exec_max_timeout {
        anyhow::bail!("HOSTGATE_EXEC_TIMEOUT_SECS exceeds HOSTGATE_EXEC_MAX_TIMEOUT_SECS");
    }

    Ok(Config {
        bind,
        port: env_parse("HOSTGATE_PORT").unwrap_or(defaults.port),
        token_file: std::env::var("HOSTGATE_TOKEN_FILE")
            .map(PathBuf::from)
            .unwrap_or(defaults.token_file),
        base_dir: std::env::var("HOSTGATE_BASE_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.base_dir),
        allow_absolute: env_flag("HOSTGATE_ALLOW_ABSOLUTE").unwrap_or(defaults.allow_absolute),
        allow_sudo: env_flag("HOSTGATE_ALLOW_SUDO").unwrap_or(defaults.allow_sudo),
        save_interval: env_secs("HOSTGATE_SAVE_INTERVAL_SECS", defaults.save_interval),
        rate_limit,
        approval_wait: env_secs("HOSTGATE_APPROVAL_WAIT_SECS", defaults.approval_wait),
        approval_retention: env_secs(
            "HOSTGATE_APPROVAL_RETENTION_SECS",
            defaults.approval_retention,
        ),
        exec_default_timeout,
        exec_max_timeout,
        kill_grace: env_parse("HOSTGATE_KILL_GRACE_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.kill_grace),
        max_output_bytes: env_parse("HOSTGATE_MAX_OUTPUT_BYTES")
            .unwrap_or(defaults.max_output_bytes),
        log_json: std::env::var("HOSTGATE_LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(defaults.log_json),
    })
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_secs(key: &str, default: Duration) -> Duration {
    env_parse::<u64>(key)
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key).ok().map(|v| parse_flag(&v))
}

fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag("1"));
        assert!(parse_flag("TRUE"));
        assert!(parse_flag(" yes "));
        assert!(parse_flag("on"));
        assert!(!parse_flag("0"));
        assert!(!parse_flag("false"));
        assert!(!parse_flag("garbage"));
    }

    #[test]
    fn test_defaults_fail_closed() {
        let cfg = Config::default();
        assert!(!cfg.allow_absolute);
        assert!(!cfg.allow_sudo);
        assert_eq!(cfg.save_interval, Duration::from_secs(60));
        assert!(cfg.exec_default_timeout <= cfg.exec_max_timeout);
        assert_eq!(cfg.token_file.file_name().unwrap(), "tokens.json");
    }
}
