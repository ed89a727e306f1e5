//! 指标收集模块
//!
//! 使用 prometheus 注册字符串服务的指标，`/metrics` 以文本格式导出。

use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};

use crate::error::{LbError, Result};

const NAMESPACE: &str = "my_group";
const SUBSYSTEM: &str = "string_service";

/// 字符串服务指标
#[derive(Clone)]
pub struct ServiceMetrics {
    registry: Registry,
    pub request_count: IntCounterVec,
    pub request_latency: HistogramVec,
    pub count_result: Histogram,
}

impl ServiceMetrics {
    /// 在独立的 Registry 中创建全部指标
    pub fn new() -> Result<Self> {
        Self::with_registry(Registry::new())
    }

    pub fn with_registry(registry: Registry) -> Result<Self> {
        let field_keys = &["method", "error"];

        let request_count = IntCounterVec::new(
            Opts::new("request_count", "Number of requests received.")
                .namespace(NAMESPACE)
                .subsystem(SUBSYSTEM),
            field_keys,
        )
        .map_err(metrics_error)?;

        let request_latency = HistogramVec::new(
            HistogramOpts::new(
                "request_latency_microseconds",
                "Total duration of requests in microseconds.",
            )
            .namespace(NAMESPACE)
            .subsystem(SUBSYSTEM)
            .buckets(vec![
                10.0, 50.0, 100.0, 500.0, 1_000.0, 5_000.0, 10_000.0, 50_000.0, 100_000.0,
            ]),
            field_keys,
        )
        .map_err(metrics_error)?;

        let count_result = Histogram::with_opts(
            HistogramOpts::new("count_result", "The result of each count method.")
                .namespace(NAMESPACE)
                .subsystem(SUBSYSTEM)
                .buckets(vec![0.0, 1.0, 4.0, 16.0, 64.0, 256.0, 1_024.0]),
        )
        .map_err(metrics_error)?;

        registry
            .register(Box::new(request_count.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(request_latency.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(count_result.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            request_count,
            request_latency,
            count_result,
        })
    }

    /// 记录一次请求
    pub fn record_request(&self, method: &str, failed: bool, micros: f64) {
        let error = if failed { "true" } else { "false" };
        self.request_count
            .with_label_values(&[method, error])
            .inc();
        self.request_latency
            .with_label_values(&[method, error])
            .observe(micros);
    }

    /// 以 Prometheus 文本格式导出
    pub fn encode(&self) -> Result<String> {
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&families, &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(metrics_error)
    }
}

fn metrics_error(err: impl std::fmt::Display) -> LbError {
    LbError::config(format!("metrics: {}", err))
}
