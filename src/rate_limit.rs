use std::{collections::HashMap, time::Duration};

use tokio::{sync::Mutex, time::Instant};

#[derive(Debug, Clone)]
pub struct RateLimitHeaders {
    pub limit: u32,
    pub remaining: u32,
    pub reset_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub retry_after: Duration,
    pub headers: RateLimitHeaders,
}

impl RateLimitDecision {
    /// Whole seconds a rejected caller should wait, never less than one.
    pub fn retry_after_secs(&self) -> u64 {
        ceil_secs(self.retry_after).max(1)
    }
}

#[derive(Debug)]
struct WindowState {
    count: u32,
    reset_at: Instant,
}

/// Fixed-window request counter keyed by client identity.
#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    limit: u32,
    windows: Mutex<HashMap<String, WindowState>>,
}

impl RateLimiter {
    pub fn new(window: Duration, limit: u32) -> Self {
        Self {
            window: window.max(Duration::from_millis(1)),
            limit: limit.max(1),
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub async fn check(&self, key: &str) -> RateLimitDecision {
        let now = Instant::now();
        let mut guard = self.windows.lock().await;

        let state = guard.entry(key.to_string()).or_insert(WindowState {
            count: 0,
            reset_at: now,
        });
        if state.reset_at <= now {
            state.count = 0;
            state.reset_at = now + self.window;
        }

        let until_reset = state.reset_at.saturating_duration_since(now);
        if state.count >= self.limit {
            return RateLimitDecision {
                allowed: false,
                retry_after: until_reset,
                headers: RateLimitHeaders {
                    limit: self.limit,
                    remaining: 0,
                    reset_seconds: ceil_secs(until_reset),
                },
            };
        }

        state.count += 1;
        RateLimitDecision {
            allowed: true,
            retry_after: Duration::ZERO,
            headers: RateLimitHeaders {
                limit: self.limit,
                remaining: self.limit - state.count,
                reset_seconds: ceil_secs(until_reset),
            },
        }
    }

    /// Drops windows that have already reset; returns how many were removed.
    pub async fn prune(&self) -> usize {
        let now = Instant::now();
        let mut guard = self.windows.lock().await;
        let before = guard.len();
        guard.retain(|_, state| state.reset_at > now);
        before - guard.len()
    }
}

fn ceil_secs(duration: Duration) -> u64 {
    let millis = duration.as_millis() as u64;
    millis.div_ceil(1000)
}
