use super::RetryPolicy;
use crate::error::LbError;
use std::time::Duration;

/// 指数退避重试策略
///
/// 也用于注册中心 watch 失败后的重连退避
#[derive(Debug, Clone)]
pub struct ExponentialBackoffPolicy {
    max_attempts: usize,
    base_delay: Duration,
    max_delay: Duration,
}

impl ExponentialBackoffPolicy {
    pub fn new(max_attempts: usize, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }
}

impl Default for ExponentialBackoffPolicy {
    fn default() -> Self {
        Self::new(usize::MAX, Duration::from_millis(10), Duration::from_secs(60))
    }
}

impl RetryPolicy for ExponentialBackoffPolicy {
    fn should_retry(&self, attempt: usize, error: &LbError) -> bool {
        if attempt >= self.max_attempts {
            return false;
        }

        error.is_retryable()
    }

    fn backoff_duration(&self, attempt: usize) -> Duration {
        let base_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        let delay_ms = base_ms.saturating_mul(1u64 << attempt.min(16));
        Duration::from_millis(delay_ms).min(self.max_delay)
    }

    fn max_attempts(&self) -> usize {
        self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy =
            ExponentialBackoffPolicy::new(10, Duration::from_millis(10), Duration::from_millis(100));
        assert_eq!(policy.backoff_duration(0), Duration::from_millis(10));
        assert_eq!(policy.backoff_duration(1), Duration::from_millis(20));
        assert_eq!(policy.backoff_duration(3), Duration::from_millis(80));
        assert_eq!(policy.backoff_duration(4), Duration::from_millis(100));
        assert_eq!(policy.backoff_duration(60), Duration::from_millis(100));
    }

    #[test]
    fn test_huge_base_delay_saturates() {
        let policy = ExponentialBackoffPolicy::new(
            10,
            Duration::from_secs(u64::MAX / 1000),
            Duration::from_secs(3600),
        );
        assert_eq!(policy.backoff_duration(16), Duration::from_secs(3600));

        let uncapped = ExponentialBackoffPolicy::new(10, Duration::MAX, Duration::MAX);
        assert_eq!(uncapped.backoff_duration(3), Duration::from_millis(u64::MAX));
    }
}
