//! Fixed-window action ceiling, one per session.

use crate::config::RateLimitConfig;
use std::time::Duration;
use tokio::time::Instant;

/// Counts actions inside the current window.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    window: Duration,
    max_actions: u32,
    window_start: Option<Instant>,
    used: u32,
}

impl RateLimiter {
    /// Create a limiter admitting `max_actions` per `window`.
    pub fn new(window: Duration, max_actions: u32) -> Self {
        Self {
            window,
            max_actions,
            window_start: None,
            used: 0,
        }
    }

    /// Create a limiter from configuration.
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.window(), config.max_actions)
    }

    /// Admit one action at `now`, or refuse it without queueing.
    pub fn admit(&mut self, now: Instant) -> bool {
        let expired = self
            .window_start
            .map_or(true, |start| now.saturating_duration_since(start) >= self.window);
        if expired {
            self.window_start = Some(now);
            self.used = 0;
        }
        if self.used >= self.max_actions {
            return false;
        }
        self.used += 1;
        true
    }

    /// Actions left in the current window.
    pub fn remaining(&self) -> u32 {
        self.max_actions.saturating_sub(self.used)
    }
}
