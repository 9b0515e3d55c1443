//! In-memory fixed-window rate limiter
//!
//! Injected through application state rather than living in a module-level
//! map. The store is bounded: once `max_entries` keys are tracked, expired
//! windows are purged and, if that is not enough, the oldest window is
//! evicted to make room.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Requests allowed per key within one window
    pub max_requests: u32,
    pub window: Duration,
    /// Upper bound on tracked keys
    pub max_entries: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 5,
            window: Duration::from_secs(60),
            max_entries: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub remaining: u32,
    /// Seconds until the current window resets (only set when rejected)
    pub retry_after_seconds: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

#[derive(Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Arc<Mutex<HashMap<String, Window>>>,
}

impl RateLimiter {
    pub fn new_in_memory() -> Self {
        Self::with_config(RateLimitConfig::default())
    }

    pub fn with_config(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Count one request against `key`.
    pub async fn check(&self, key: &str) -> RateLimitResult {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;

        if !windows.contains_key(key) && windows.len() >= self.config.max_entries {
            self.make_room(&mut windows, now);
        }

        let window = windows.entry(key.to_string()).or_insert(Window {
            started: now,
            count: 0,
        });

        if now.duration_since(window.started) >= self.config.window {
            window.started = now;
            window.count = 0;
        }

        if window.count >= self.config.max_requests {
            let elapsed = now.duration_since(window.started);
            let retry_after = self.config.window.saturating_sub(elapsed).as_secs().max(1);
            return RateLimitResult {
                allowed: false,
                remaining: 0,
                retry_after_seconds: Some(retry_after),
            };
        }

        window.count += 1;
        RateLimitResult {
            allowed: true,
            remaining: self.config.max_requests - window.count,
            retry_after_seconds: None,
        }
    }

    /// Drop windows that have expired.
    pub async fn cleanup(&self) {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;
        let before = windows.len();
        windows.retain(|_, w| now.duration_since(w.started) < self.config.window);
        let removed = before - windows.len();
        if removed > 0 {
            tracing::debug!(removed = removed, "Rate limiter cleanup");
        }
    }

    pub async fn tracked_keys(&self) -> usize {
        self.windows.lock().await.len()
    }

    fn make_room(&self, windows: &mut HashMap<String, Window>, now: Instant) {
        windows.retain(|_, w| now.duration_since(w.started) < self.config.window);

        while windows.len() >= self.config.max_entries {
            let oldest = windows
                .iter()
                .min_by_key(|(_, w)| w.started)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(key) => {
                    windows.remove(&key);
                }
                None => break,
            }
        }
    }
}
