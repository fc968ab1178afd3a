// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::time::{Duration, Instant};

/// Enforces a minimum interval between the starts of successive iterations
/// of a processing loop. It only bounds local CPU use; nothing is signalled
/// upstream.
///
/// The arithmetic is separate from the sleeping so that the limiter can be
/// driven by a thread, an event loop, or a scheduler tick alike.
#[derive(Clone, Copy, Debug)]
pub struct RateLimiter {
    // Zero means no throttling.
    period: Duration,
}

impl RateLimiter {
    // A non-positive or non-finite `max_rate_hz` disables throttling.
    pub fn new(max_rate_hz: f64) -> Self {
        let period = if max_rate_hz.is_finite() && max_rate_hz > 0.0 {
            Duration::from_secs_f64(1.0 / max_rate_hz)
        } else {
            Duration::ZERO
        };
        RateLimiter{period}
    }

    pub fn unlimited() -> Self {
        RateLimiter{period: Duration::ZERO}
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// How long to wait, as of `now`, before an iteration that started at
    /// `iteration_start` may be followed by the next one.
    pub fn remaining(&self, iteration_start: Instant, now: Instant) -> Duration {
        let elapsed = now.saturating_duration_since(iteration_start);
        self.period.saturating_sub(elapsed)
    }

    /// Suspends for whatever is left of the current period.
    pub async fn throttle(&self, iteration_start: Instant) {
        let remaining = self.remaining(iteration_start, Instant::now());
        if !remaining.is_zero() {
            tokio::time::sleep(remaining).await;
        }
    }
}

// mod tests.
