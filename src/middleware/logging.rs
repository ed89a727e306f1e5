use std::time::Instant;

use async_trait::async_trait;
use tracing::info;

use crate::service::{StringService, StringServiceError};

/// 日志中间件
pub struct LoggingMiddleware<S> {
    next: S,
}

impl<S> LoggingMiddleware<S> {
    pub fn new(next: S) -> Self {
        Self { next }
    }
}

#[async_trait]
impl<S> StringService for LoggingMiddleware<S>
where
    S: StringService,
{
    async fn uppercase(&self, s: &str) -> Result<String, StringServiceError> {
        let start = Instant::now();
        let result = self.next.uppercase(s).await;
        info!(
            method = "uppercase",
            input = %s,
            output = result.as_deref().unwrap_or(""),
            err = result.as_ref().err().map(|e| e.to_string()).as_deref(),
            took_us = start.elapsed().as_micros() as u64,
            "Handled request"
        );
        result
    }

    async fn count(&self, s: &str) -> usize {
        let start = Instant::now();
        let n = self.next.count(s).await;
        info!(
            method = "count",
            input = %s,
            n,
            took_us = start.elapsed().as_micros() as u64,
            "Handled request"
        );
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::BasicStringService;

    #[tokio::test]
    async fn test_passes_results_through() {
        let svc = LoggingMiddleware::new(BasicStringService);
        assert_eq!(svc.uppercase("abc").await.unwrap(), "ABC");
        assert!(svc.uppercase("").await.is_err());
        assert_eq!(svc.count("abcd").await, 4);
    }
}
