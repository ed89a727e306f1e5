//! 字符串服务中间件
//!
//! 每个中间件都是包装另一个 [`StringService`](crate::service::StringService) 的装饰器，
//! 构建时固定顺序：基础实现 → 日志 → 指标。

pub mod instrumenting;
pub mod logging;

pub use instrumenting::InstrumentingMiddleware;
pub use logging::LoggingMiddleware;
