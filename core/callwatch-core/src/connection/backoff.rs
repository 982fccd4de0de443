use std::cmp;
use std::time::Duration;

use rand::Rng;

/// Largest shift applied to the base delay; keeps the multiplication in range.
const MAX_DOUBLINGS: u32 = 16;

/// Exponential reconnect delay with subtractive jitter.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    base_ms: u64,
    max_ms: u64,
    failures: u32,
    jitter: bool,
}

impl ReconnectBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        let base_ms = duration_ms(base).max(1);
        Self {
            base_ms,
            max_ms: cmp::max(duration_ms(max), base_ms),
            failures: 0,
            jitter: true,
        }
    }

    /// Deterministic delays, for tests and tooling.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Records one more consecutive failure and returns the delay before the
    /// next attempt.
    pub fn next_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let ceiling = compute_backoff(self.failures, self.base_ms, self.max_ms);
        if !self.jitter || ceiling < 2 {
            return Duration::from_millis(ceiling);
        }
        let jitter = rand::thread_rng().gen_range(0..=ceiling / 2);
        Duration::from_millis(ceiling - jitter)
    }
}

/// Delay ceiling in milliseconds for the `failures`-th consecutive failure.
fn compute_backoff(failures: u32, base_ms: u64, max_ms: u64) -> u64 {
    if failures == 0 {
        return 0;
    }
    let shift = cmp::min(failures - 1, MAX_DOUBLINGS);
    let delay = base_ms.saturating_mul(1u64 << shift);
    cmp::min(delay, max_ms)
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
