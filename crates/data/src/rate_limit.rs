use coinpulse_core::RateLimitConfig;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// Sliding window over a log of acquisition timestamps.
#[derive(Debug)]
struct RateWindow {
    window: Duration,
    max_requests: usize,
    timestamps: VecDeque<Instant>,
}

impl RateWindow {
    fn new(config: &RateLimitConfig) -> Self {
        Self {
            window: config.window(),
            max_requests: config.max_requests,
            timestamps: VecDeque::with_capacity(config.max_requests),
        }
    }

    /// Drop timestamps that have left the trailing window.
    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.timestamps.front() {
            if now.duration_since(oldest) >= self.window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    fn try_acquire(&mut self, now: Instant) -> bool {
        self.prune(now);
        if self.timestamps.len() < self.max_requests {
            self.timestamps.push_back(now);
            true
        } else {
            false
        }
    }
}

/// Bounds outbound upstream calls per request class.
///
/// Each class owns an independent window; exhausting one never affects
/// another. Classes with no configured budget are not limited.
#[derive(Debug)]
pub struct RateLimiter {
    windows: Mutex<HashMap<String, RateWindow>>,
}

impl RateLimiter {
    pub fn new(limits: &BTreeMap<String, RateLimitConfig>) -> Self {
        let windows = limits
            .iter()
            .map(|(class, cfg)| (class.clone(), RateWindow::new(cfg)))
            .collect();
        Self {
            windows: Mutex::new(windows),
        }
    }

    /// Record an acquisition for `class` if its window has room.
    pub fn try_acquire(&self, class: &str) -> bool {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        match windows.get_mut(class) {
            Some(window) => {
                let allowed = window.try_acquire(now);
                if !allowed {
                    warn!(
                        class,
                        max = window.max_requests,
                        window_ms = window.window.as_millis() as u64,
                        "Rate limit exhausted"
                    );
                }
                allowed
            }
            None => true,
        }
    }

    /// Acquisitions still available in the current window, or `None` for an
    /// unlimited class.
    pub fn remaining(&self, class: &str) -> Option<usize> {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        windows.get_mut(class).map(|w| {
            w.prune(now);
            w.max_requests - w.timestamps.len()
        })
    }
}
