//! Retry policy for transient source failures (rate limits, dropped connections).

use rand::Rng;
use std::thread;
use std::time::{Duration, Instant};
use tracing::warn;

/// Backoff schedule plus the budget that bounds it.
///
/// With both `max_attempts` and `max_elapsed` unset the policy retries forever.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: Option<u32>,
    pub max_elapsed: Option<Duration>,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub jitter_pct: f64,
}

impl RetryPolicy {
    /// Same delay before every retry.
    pub fn fixed(delay: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            max_attempts,
            max_elapsed: None,
            base_delay: delay,
            multiplier: 1.0,
            max_delay: delay,
            jitter_pct: 0.0,
        }
    }

    /// Doubling backoff from `base` up to `max`, with ±`jitter_pct` spread.
    pub fn exponential(base: Duration, max: Duration, jitter_pct: f64, max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts.max(1)),
            max_elapsed: None,
            base_delay: base,
            multiplier: 2.0,
            max_delay: max.max(base),
            jitter_pct: jitter_pct.clamp(0.0, 1.0),
        }
    }

    /// No waiting between attempts. Meant for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::fixed(Duration::ZERO, Some(max_attempts.max(1)))
    }

    pub fn with_max_elapsed(mut self, budget: Duration) -> Self {
        self.max_elapsed = Some(budget);
        self
    }

    /// Whether another attempt may start after `attempts_made` failures.
    pub fn allows(&self, attempts_made: u32, elapsed: Duration) -> bool {
        self.max_attempts.map_or(true, |m| attempts_made < m)
            && self.max_elapsed.map_or(true, |b| elapsed < b)
    }

    /// Wait before retry number `retry` (0-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(retry.min(63) as i32);
        let raw = self.base_delay.as_secs_f64() * factor;
        let capped = raw.min(self.max_delay.as_secs_f64());
        let jittered = if self.jitter_pct > 0.0 && capped > 0.0 {
            let spread = capped * self.jitter_pct;
            capped + rand::thread_rng().gen_range(-spread..=spread)
        } else {
            capped
        };
        Duration::from_secs_f64(jittered.max(0.0))
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// budget runs out. `op` receives the 0-based attempt number.
    pub fn run<T, E, F, R>(&self, mut op: F, mut retryable: R) -> Result<T, E>
    where
        F: FnMut(u32) -> Result<T, E>,
        R: FnMut(&E) -> bool,
        E: std::fmt::Display,
    {
        let started = Instant::now();
        let mut attempt = 0u32;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempt += 1;
                    if !retryable(&err) || !self.allows(attempt, started.elapsed()) {
                        return Err(err);
                    }
                    let delay = self.delay_for(attempt - 1);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying");
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    /// One-second fixed delay, at most 120 attempts.
    fn default() -> Self {
        Self::fixed(Duration::from_secs(1), Some(120))
    }
}
