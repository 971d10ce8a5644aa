use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::models::token::RateLimit;

/// In-memory sliding-window rate limiter.
///
/// Each token owns one log of request instants per configured window. A
/// request is admitted only if every window has room, and is then recorded
/// in all of them. All windows of a token live in one map entry, so the
/// check-then-record step happens under a single shard lock.
pub struct RateLimiter {
    windows: DashMap<String, HashMap<RateLimit, VecDeque<Instant>>>,
    default_limit: RateLimit,
}

impl RateLimiter {
    pub fn new(default_limit: RateLimit) -> Self {
        Self {
            windows: DashMap::new(),
            default_limit,
        }
    }

    /// Admit one request for `token_id`. `limits` are the token's own
    /// limits; an empty slice falls back to the configured default.
    /// On rejection, returns the limit that was exceeded.
    pub fn admit(&self, token_id: &str, limits: &[RateLimit]) -> Result<(), RateLimit> {
        self.admit_at(token_id, limits, Instant::now())
    }

    pub fn admit_at(
        &self,
        token_id: &str,
        limits: &[RateLimit],
        now: Instant,
    ) -> Result<(), RateLimit> {
        let limits = if limits.is_empty() {
            std::slice::from_ref(&self.default_limit)
        } else {
            limits
        };

        let mut entry = self.windows.entry(token_id.to_string()).or_default();
        let log = entry.value_mut();

        for limit in limits {
            let hits = log.entry(*limit).or_default();
            evict(hits, *limit, now);
            if hits.len() >= limit.max_requests as usize {
                tracing::warn!(
                    token_id = token_id,
                    limit = limit.max_requests,
                    window_secs = limit.window_secs,
                    "rate limit exceeded"
                );
                return Err(*limit);
            }
        }
        for limit in limits {
            log.entry(*limit).or_default().push_back(now);
        }
        Ok(())
    }

    /// Drop expired hits and empty windows. Returns the number of tokens
    /// still tracked.
    pub fn prune(&self, now: Instant) -> usize {
        self.windows.retain(|_, log| {
            log.retain(|limit, hits| {
                evict(hits, *limit, now);
                !hits.is_empty()
            });
            !log.is_empty()
        });
        self.windows.len()
    }
}

fn evict(hits: &mut VecDeque<Instant>, limit: RateLimit, now: Instant) {
    let window = Duration::from_secs(limit.window_secs);
    while let Some(front) = hits.front() {
        if now.saturating_duration_since(*front) >= window {
            hits.pop_front();
        } else {
            break;
        }
    }
}

/// Parse `"<max>/<window>"`, e.g. `"100/1m"`, into a limit.
///
/// Supported window formats: "1s", "1m", "1h", "1d".
pub fn parse_limit(s: &str) -> Option<RateLimit> {
    let (max, window) = s.split_once('/')?;
    let max_requests: u32 = max.trim().parse().ok()?;
    let window_secs = parse_window(window)?;
    if max_requests == 0 || window_secs == 0 {
        return None;
    }
    Some(RateLimit {
        max_requests,
        window_secs,
    })
}

fn parse_window(s: &str) -> Option<u64> {
    let s = s.trim();
    if let Some(val) = s.strip_suffix('s') {
        val.parse().ok()
    } else if let Some(val) = s.strip_suffix('m') {
        val.parse::<u64>().ok().and_then(|v| v.checked_mul(60))
    } else if let Some(val) = s.strip_suffix('h') {
        val.parse::<u64>().ok().and_then(|v| v.checked_mul(3600))
    } else if let Some(val) = s.strip_suffix('d') {
        val.parse::<u64>().ok().and_then(|v| v.checked_mul(86400))
    } else {
        None
    }
}
