use super::RetryPolicy;
use crate::error::LbError;
use std::time::Duration;

/// 固定延迟重试策略
#[derive(Debug, Clone)]
pub struct FixedRetryPolicy {
    max_attempts: usize,
    delay: Duration,
}

impl FixedRetryPolicy {
    /// `max_attempts` 至少为 1
    pub fn new(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// 不等待，立即换下一个端点重试
    pub fn immediate(max_attempts: usize) -> Self {
        Self::new(max_attempts, Duration::ZERO)
    }
}

impl RetryPolicy for FixedRetryPolicy {
    fn should_retry(&self, attempt: usize, error: &LbError) -> bool {
        if attempt >= self.max_attempts {
            return false;
        }

        error.is_retryable()
    }

    fn backoff_duration(&self, _attempt: usize) -> Duration {
        self.delay
    }

    fn max_attempts(&self) -> usize {
        self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stops_at_max_attempts() {
        let policy = FixedRetryPolicy::immediate(3);
        let err = LbError::transport("reset");
        assert!(policy.should_retry(1, &err));
        assert!(policy.should_retry(2, &err));
        assert!(!policy.should_retry(3, &err));
        assert_eq!(policy.backoff_duration(1), Duration::ZERO);
    }

    #[test]
    fn test_zero_attempts_clamped() {
        assert_eq!(FixedRetryPolicy::immediate(0).max_attempts(), 1);
    }

    #[test]
    fn test_non_retryable_error() {
        let policy = FixedRetryPolicy::new(5, Duration::from_millis(10));
        assert!(!policy.should_retry(1, &LbError::config("bad")));
    }
}
