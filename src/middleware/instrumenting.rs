use std::time::Instant;

use async_trait::async_trait;

use crate::metrics::ServiceMetrics;
use crate::service::{StringService, StringServiceError};

/// 指标中间件：请求数、请求耗时（微秒）以及 count 的结果分布
pub struct InstrumentingMiddleware<S> {
    metrics: ServiceMetrics,
    next: S,
}

impl<S> InstrumentingMiddleware<S> {
    pub fn new(metrics: ServiceMetrics, next: S) -> Self {
        Self { metrics, next }
    }
}

#[async_trait]
impl<S> StringService for InstrumentingMiddleware<S>
where
    S: StringService,
{
    async fn uppercase(&self, s: &str) -> Result<String, StringServiceError> {
        let start = Instant::now();
        let result = self.next.uppercase(s).await;
        self.metrics.record_request(
            "uppercase",
            result.is_err(),
            start.elapsed().as_micros() as f64,
        );
        result
    }

    async fn count(&self, s: &str) -> usize {
        let start = Instant::now();
        let n = self.next.count(s).await;
        self.metrics
            .record_request("count", false, start.elapsed().as_micros() as f64);
        self.metrics.count_result.observe(n as f64);
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::BasicStringService;

    #[tokio::test]
    async fn test_counts_requests_by_method_and_error() {
        let metrics = ServiceMetrics::new().unwrap();
        let svc = InstrumentingMiddleware::new(metrics.clone(), BasicStringService);

        svc.uppercase("a").await.unwrap();
        svc.uppercase("").await.unwrap_err();
        svc.count("abc").await;

        let count = |method: &str, error: &str| {
            metrics
                .request_count
                .with_label_values(&[method, error])
                .get()
        };
        assert_eq!(count("uppercase", "false"), 1);
        assert_eq!(count("uppercase", "true"), 1);
        assert_eq!(count("count", "false"), 1);
        assert_eq!(metrics.count_result.get_sample_count(), 1);
        assert_eq!(metrics.count_result.get_sample_sum(), 3.0);
    }
}
