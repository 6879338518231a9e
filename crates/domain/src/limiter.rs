//! Sliding-window rate limiter.
//!
//! Tracks timestamped costs inside a rolling window. Used per session for
//! user-message, audio-byte, and tool-call throttling.

use std::collections::VecDeque;

/// Outcome of a [`RateLimiter::check`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// When denied, how long until the oldest tracked event leaves the
    /// window. Zero when allowed.
    pub retry_after_ms: i64,
}

/// A sliding-window limiter admitting up to `max_tokens` total cost per
/// `window_ms` milliseconds. `max_tokens <= 0` disables the limiter.
#[derive(Debug)]
pub struct RateLimiter {
    max_tokens: i64,
    window_ms: i64,
    events: VecDeque<(i64, i64)>,
    total_cost: i64,
}

impl RateLimiter {
    pub fn new(max_tokens: i64, window_ms: i64) -> Self {
        Self {
            max_tokens,
            window_ms,
            events: VecDeque::new(),
            total_cost: 0,
        }
    }

    /// Check (and record, when admitted) an event of the given cost at `now`
    /// milliseconds. Taking the clock as a parameter keeps the limiter
    /// deterministic under test.
    pub fn check(&mut self, cost: i64, now: i64) -> RateDecision {
        if self.max_tokens <= 0 {
            return RateDecision {
                allowed: true,
                retry_after_ms: 0,
            };
        }

        // Drop events that have left the window.
        while let Some(&(ts, c)) = self.events.front() {
            if ts <= now - self.window_ms {
                self.events.pop_front();
                self.total_cost -= c;
            } else {
                break;
            }
        }

        if self.total_cost + cost <= self.max_tokens {
            self.events.push_back((now, cost));
            self.total_cost += cost;
            return RateDecision {
                allowed: true,
                retry_after_ms: 0,
            };
        }

        let retry_after_ms = self
            .events
            .front()
            .map(|&(ts, _)| (ts + self.window_ms - now).max(0))
            .unwrap_or(0);
        RateDecision {
            allowed: false,
            retry_after_ms,
        }
    }

    /// Check against the wall clock.
    pub fn check_now(&mut self, cost: i64) -> RateDecision {
        self.check(cost, chrono::Utc::now().timestamp_millis())
    }
}
