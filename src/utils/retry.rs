//! Retry utilities: backoff builders for broker reconnection.
//!
//! Reconnects use linear backoff (`n × base` before attempt `n`) capped at a
//! fixed number of attempts, expressed as a `backon` builder so it composes
//! with the rest of the `backon` ecosystem.

use std::time::Duration;

use backon::BackoffBuilder;

/// Default delay unit between reconnect attempts.
pub const DEFAULT_BASE_INTERVAL: Duration = Duration::from_secs(5);
/// Default number of reconnect attempts before giving up.
pub const DEFAULT_MAX_RETRIES: usize = 10;

/// Builder for linear backoff.
///
/// - Attempt 1 waits `base`, attempt 2 waits `2 × base`, ...
/// - Yields exactly `max_times` delays, then stops
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearBuilder {
    base: Duration,
    max_times: usize,
}

impl Default for LinearBuilder {
    fn default() -> Self {
        Self {
            base: DEFAULT_BASE_INTERVAL,
            max_times: DEFAULT_MAX_RETRIES,
        }
    }
}

impl LinearBuilder {
    pub fn with_base(mut self, base: Duration) -> Self {
        self.base = base;
        self
    }

    pub fn with_max_times(mut self, max_times: usize) -> Self {
        self.max_times = max_times;
        self
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max_times(&self) -> usize {
        self.max_times
    }
}

impl BackoffBuilder for LinearBuilder {
    type Backoff = LinearBackoff;

    fn build(self) -> Self::Backoff {
        LinearBackoff {
            base: self.base,
            max_times: self.max_times,
            attempt: 0,
        }
    }
}

/// Iterator of linear delays produced by `LinearBuilder`.
#[derive(Debug, Clone)]
pub struct LinearBackoff {
    base: Duration,
    max_times: usize,
    attempt: usize,
}

impl LinearBackoff {
    /// Number of delays handed out so far.
    pub fn attempt(&self) -> usize {
        self.attempt
    }
}

impl Iterator for LinearBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_times {
            return None;
        }
        self.attempt += 1;
        let factor = u32::try_from(self.attempt).unwrap_or(u32::MAX);
        Some(self.base.saturating_mul(factor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schedule() {
        let delays: Vec<u64> = LinearBuilder::default()
            .build()
            .map(|d| d.as_secs())
            .collect();

        assert_eq!(delays, vec![5, 10, 15, 20, 25, 30, 35, 40, 45, 50]);
    }

    #[test]
    fn test_fresh_build_restarts_counter() {
        let builder = LinearBuilder::default()
            .with_base(Duration::from_millis(100))
            .with_max_times(3);

        let mut first = builder.build();
        first.next();
        first.next();
        assert_eq!(first.attempt(), 2);

        let mut second = builder.build();
        assert_eq!(second.next(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_zero_max_times_yields_nothing() {
        let mut backoff = LinearBuilder::default().with_max_times(0).build();
        assert_eq!(backoff.next(), None);
    }
}
