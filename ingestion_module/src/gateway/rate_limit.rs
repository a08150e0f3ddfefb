use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::warn;

const PRUNE_THRESHOLD: usize = 10_000;

/// Fixed-window request counter keyed by channel id.
#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    max_requests: u32,
    windows: Mutex<HashMap<String, (Instant, u32)>>,
}

impl RateLimiter {
    /// `max_requests == 0` disables limiting.
    pub fn new(window: Duration, max_requests: u32) -> Self {
        Self {
            window,
            max_requests,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Counts one request for `key`; `false` once the window is exhausted.
    pub fn check(&self, key: &str) -> bool {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: &str, now: Instant) -> bool {
        if self.max_requests == 0 {
            return true;
        }
        let Ok(mut windows) = self.windows.lock() else {
            warn!("rate limiter lock poisoned, allowing request key={}", key);
            return true;
        };
        if windows.len() > PRUNE_THRESHOLD {
            let window = self.window;
            windows.retain(|_, (started, _)| now.duration_since(*started) < window);
        }

        let slot = windows.entry(key.to_string()).or_insert((now, 0));
        if now.duration_since(slot.0) >= self.window {
            *slot = (now, 0);
        }
        if slot.1 >= self.max_requests {
            return false;
        }
        slot.1 += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_after_budget_until_next_window() {
        let limiter = RateLimiter::new(Duration::from_secs(10), 2);
        let start = Instant::now();
        assert!(limiter.check_at("c1", start));
        assert!(limiter.check_at("c1", start + Duration::from_secs(1)));
        assert!(!limiter.check_at("c1", start + Duration::from_secs(2)));
        // other channels have their own budget
        assert!(limiter.check_at("c2", start + Duration::from_secs(2)));
        assert!(limiter.check_at("c1", start + Duration::from_secs(10)));
    }

    #[test]
    fn zero_budget_disables_limiting() {
        let limiter = RateLimiter::new(Duration::from_secs(1), 0);
        assert!((0..100).all(|_| limiter.check("c1")));
    }
}
