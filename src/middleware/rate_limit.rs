//! Ingress rate limiting
//!
//! Sliding-window limiter keyed by caller identity (bearer token or peer
//! address). Applied by the dispatch endpoint when the global pool is
//! saturated; an accepted task is treated as authorized by the core.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tetora_core::config::RateLimitConfig;
use tokio::sync::RwLock;

/// Result of a rate limit check
#[derive(Debug, Clone, Copy)]
pub struct RateLimitResult {
    /// Whether the request is allowed
    pub allowed: bool,
    /// Remaining requests in the current window
    pub remaining: u32,
    /// Seconds until the oldest request leaves the window
    pub retry_after_secs: u64,
}

/// In-memory sliding-window rate limiter
pub struct RateLimiter {
    config: RateLimitConfig,
    requests: Arc<RwLock<HashMap<String, Vec<Instant>>>>,
}

impl RateLimiter {
    /// Create a limiter
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            requests: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Check (and count) one request for the given key
    pub async fn check(&self, key: &str) -> RateLimitResult {
        if !self.config.enabled {
            return RateLimitResult {
                allowed: true,
                remaining: self.config.max_requests,
                retry_after_secs: 0,
            };
        }

        let window = Duration::from_secs(self.config.window_secs);
        let now = Instant::now();
        let mut requests = self.requests.write().await;
        let timestamps = requests.entry(key.to_string()).or_default();
        timestamps.retain(|t| now.duration_since(*t) < window);

        if timestamps.len() >= self.config.max_requests as usize {
            let oldest = timestamps.first().copied().unwrap_or(now);
            let retry_after = window.saturating_sub(now.duration_since(oldest));
            return RateLimitResult {
                allowed: false,
                remaining: 0,
                retry_after_secs: retry_after.as_secs().max(1),
            };
        }

        timestamps.push(now);
        RateLimitResult {
            allowed: true,
            remaining: self.config.max_requests - timestamps.len() as u32,
            retry_after_secs: 0,
        }
    }

    /// Drop windows with no recent requests
    pub async fn prune(&self) {
        let window = Duration::from_secs(self.config.window_secs);
        let now = Instant::now();
        let mut requests = self.requests.write().await;
        requests.retain(|_, timestamps| {
            timestamps.retain(|t| now.duration_since(*t) < window);
            !timestamps.is_empty()
        });
    }
}
