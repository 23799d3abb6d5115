//! Exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::config::BackoffConfig;

/// Stateful delay schedule. Never gives up; callers decide when to stop.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    current: Duration,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        let current = config.initial_interval;
        Self { config, current }
    }

    /// Delay to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let grown = self.current.mul_f64(self.config.multiplier.max(1.0));
        self.current = grown.min(self.config.max_interval);
        jitter(delay, self.config.randomization_factor)
    }

    pub fn reset(&mut self) {
        self.current = self.config.initial_interval;
    }
}

fn jitter(delay: Duration, factor: f64) -> Duration {
    if factor <= 0.0 || delay.is_zero() {
        return delay;
    }
    let secs = delay.as_secs_f64();
    let delta = secs * factor.min(1.0);
    Duration::from_secs_f64(rand::thread_rng().gen_range((secs - delta)..=(secs + delta)))
}

/// Sleep for `delay` unless `token` is cancelled first.
///
/// Returns `false` if cancelled.
pub async fn sleep_or_cancel(token: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
