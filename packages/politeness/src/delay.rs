//! Delay computation for outbound requests.
//!
//! The base delay comes from robots crawl-delay when present, otherwise
//! a uniform draw from the configured range. Retries widen the base
//! exponentially; jitter is added on top so workers do not fall into
//! lockstep against one host.

use std::time::Duration;

/// Delay policy for a worker process.
#[derive(Debug, Clone)]
pub struct DelayPolicy {
    /// Lower bound of the default delay range (no robots crawl-delay).
    pub min_delay: Duration,
    /// Upper bound of the default delay range.
    pub max_delay: Duration,
    /// Maximum jitter added to every computed delay.
    pub jitter: Duration,
    /// Hard cap on the backoff base, whatever the attempt count.
    pub max_backoff: Duration,
}

impl Default for DelayPolicy {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(6),
            jitter: Duration::from_millis(1_500),
            max_backoff: Duration::from_secs(120),
        }
    }
}

impl DelayPolicy {
    /// Base delay before backoff: robots crawl-delay when present,
    /// otherwise a uniform draw from `[min_delay, max_delay]`.
    pub fn base(&self, crawl_delay: Option<Duration>) -> Duration {
        match crawl_delay {
            Some(d) => d,
            None => uniform_between(self.min_delay, self.max_delay),
        }
    }

    /// Backoff base for a given attempt: `base * 2^attempt`, capped.
    ///
    /// Deterministic so it can be reasoned about (and tested) apart
    /// from jitter; non-decreasing in `attempt`.
    pub fn backoff(&self, base: Duration, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        base.saturating_mul(factor).min(self.max_backoff)
    }

    /// Full delay for one request: backoff base plus uniform jitter.
    pub fn delay_for(&self, crawl_delay: Option<Duration>, attempt: u32) -> Duration {
        let base = self.backoff(self.base(crawl_delay), attempt);
        base + uniform_between(Duration::ZERO, self.jitter)
    }
}

fn uniform_between(low: Duration, high: Duration) -> Duration {
    if high <= low {
        return low;
    }
    let span = (high - low).as_millis() as u64;
    low + Duration::from_millis(fastrand::u64(0..=span))
}
