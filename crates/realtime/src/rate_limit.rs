// Fixed-window limiter for WebSocket upgrade attempts, keyed by
// `roomId:clientIp`. Bursts at window boundaries are accepted in exchange for
// O(1) bookkeeping per key.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

const DEFAULT_MAX_REQUESTS: u32 = 100;
const DEFAULT_WINDOW: Duration = Duration::from_secs(60);
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
    pub sweep_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: DEFAULT_MAX_REQUESTS,
            window: DEFAULT_WINDOW,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    /// Time left in the current window; set only when the request was rejected.
    pub retry_after_ms: Option<u64>,
}

impl RateLimitDecision {
    /// `Retry-After` header value: whole seconds, rounded up, at least 1.
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.retry_after_ms.map(|ms| ms.div_ceil(1000).max(1))
    }
}

#[derive(Debug, Clone, Copy)]
struct RateLimitWindow {
    count: u32,
    reset_at: Instant,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Mutex<HashMap<String, RateLimitWindow>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self { config, windows: Mutex::new(HashMap::new()) }
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    pub fn check_rate_limit(&self, room_id: &str, client_ip: &str) -> RateLimitDecision {
        let now = Instant::now();
        let cap = self.config.max_requests;
        let mut windows = self.windows.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let window = windows
            .entry(format!("{room_id}:{client_ip}"))
            .or_insert(RateLimitWindow { count: 0, reset_at: now + self.config.window });

        if now > window.reset_at {
            *window = RateLimitWindow { count: 0, reset_at: now + self.config.window };
        }

        if window.count < cap {
            window.count += 1;
            return RateLimitDecision {
                allowed: true,
                remaining: cap - window.count,
                retry_after_ms: None,
            };
        }

        let left = window.reset_at.saturating_duration_since(now).as_millis() as u64;
        RateLimitDecision { allowed: false, remaining: 0, retry_after_ms: Some(left.max(1)) }
    }

    /// Drops every window whose reset time has passed. Returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = windows.len();
        windows.retain(|_, window| now <= window.reset_at);
        before - windows.len()
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }

    /// Runs [`RateLimiter::evict_expired`] every `sweep_interval`. Abort the
    /// handle on shutdown.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        let period = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let removed = limiter.evict_expired();
                if removed > 0 {
                    debug!(removed, remaining = limiter.tracked_keys(), "rate limit windows swept");
                }
            }
        })
    }
}
