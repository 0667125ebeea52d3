//! Per-user sliding-window rate limiting.
//!
//! Two independent limits are tracked per user identity:
//! - requests per minute, checked when a job is admitted
//! - tokens per hour, checked before every token-consuming call
//!
//! # Scope
//!
//! Limiter state is process-local. Each worker enforces the configured limits
//! on the traffic it sees, so a fleet of N workers admits up to N times the
//! configured rate in aggregate. Jobs never depend on limiter state for
//! progress, so losing it on restart only resets the windows.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

/// Configured limits.
#[derive(Debug, Clone, Copy)]
pub struct RateLimits {
    pub requests_per_minute: u32,
    pub tokens_per_hour: u64,
}

/// Which limit was exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitType {
    RequestsPerMinute,
    TokensPerHour,
}

impl std::fmt::Display for LimitType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LimitType::RequestsPerMinute => write!(f, "requests-per-minute"),
            LimitType::TokensPerHour => write!(f, "tokens-per-hour"),
        }
    }
}

/// Result of a rate limit check.
#[derive(Debug, Clone, PartialEq)]
pub enum RateLimitResult {
    Allowed {
        remaining: u64,
    },
    Limited {
        /// Time until the oldest entry leaves the window.
        retry_after: Duration,
        limit_type: LimitType,
    },
}

impl RateLimitResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitResult::Allowed { .. })
    }
}

#[derive(Debug, Default)]
struct UserWindows {
    requests: VecDeque<Instant>,
    tokens: VecDeque<(Instant, u64)>,
}

impl UserWindows {
    fn prune(&mut self, now: Instant) {
        while self
            .requests
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= MINUTE)
        {
            self.requests.pop_front();
        }
        while self
            .tokens
            .front()
            .is_some_and(|(t, _)| now.saturating_duration_since(*t) >= HOUR)
        {
            self.tokens.pop_front();
        }
    }

    fn tokens_in_window(&self) -> u64 {
        self.tokens.iter().map(|(_, n)| n).sum()
    }
}

/// In-memory sliding-window limiter keyed by user id.
pub struct RateLimiter {
    limits: RateLimits,
    users: Mutex<HashMap<String, UserWindows>>,
}

impl RateLimiter {
    pub fn new(limits: RateLimits) -> Self {
        Self {
            limits,
            users: Mutex::new(HashMap::new()),
        }
    }

    pub fn limits(&self) -> RateLimits {
        self.limits
    }

    /// Admit one job request for `user_id`, recording it if allowed.
    pub fn admit(&self, user_id: &str) -> RateLimitResult {
        self.admit_at(user_id, Instant::now())
    }

    pub fn admit_at(&self, user_id: &str, now: Instant) -> RateLimitResult {
        let mut users = self.users.lock();
        let windows = users.entry(user_id.to_string()).or_default();
        windows.prune(now);

        let limit = self.limits.requests_per_minute as usize;
        if windows.requests.len() >= limit {
            let retry_after = windows
                .requests
                .front()
                .map(|t| MINUTE.saturating_sub(now.saturating_duration_since(*t)))
                .unwrap_or(MINUTE);
            return RateLimitResult::Limited {
                retry_after,
                limit_type: LimitType::RequestsPerMinute,
            };
        }

        windows.requests.push_back(now);
        RateLimitResult::Allowed {
            remaining: (limit - windows.requests.len()) as u64,
        }
    }

    /// Check whether `user_id` may make another token-consuming call.
    pub fn check_tokens(&self, user_id: &str) -> RateLimitResult {
        self.check_tokens_at(user_id, Instant::now())
    }

    pub fn check_tokens_at(&self, user_id: &str, now: Instant) -> RateLimitResult {
        let mut users = self.users.lock();
        let windows = users.entry(user_id.to_string()).or_default();
        windows.prune(now);

        let used = windows.tokens_in_window();
        if used >= self.limits.tokens_per_hour {
            let retry_after = windows
                .tokens
                .front()
                .map(|(t, _)| HOUR.saturating_sub(now.saturating_duration_since(*t)))
                .unwrap_or(HOUR);
            return RateLimitResult::Limited {
                retry_after,
                limit_type: LimitType::TokensPerHour,
            };
        }

        RateLimitResult::Allowed {
            remaining: self.limits.tokens_per_hour - used,
        }
    }

    /// Record tokens consumed by `user_id`.
    pub fn record_tokens(&self, user_id: &str, tokens: u64) {
        self.record_tokens_at(user_id, tokens, Instant::now());
    }

    pub fn record_tokens_at(&self, user_id: &str, tokens: u64, now: Instant) {
        if tokens == 0 {
            return;
        }
        let mut users = self.users.lock();
        let windows = users.entry(user_id.to_string()).or_default();
        windows.prune(now);
        windows.tokens.push_back((now, tokens));
    }
}
