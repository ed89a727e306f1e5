//! 错误处理模块
//!
//! 统一的分发层错误类型。注册中心故障、单个端点创建失败、单次调用失败都属于
//! 层内可恢复的数据，不会导致进程崩溃；调用方只会看到
//! [`LbError::NoHealthyEndpoints`] 和 [`LbError::RetriesExhausted`]。

pub mod code;

pub use code::ErrorCode;

use std::time::Duration;
use thiserror::Error;

/// 传输层 / 工厂返回的通用错误
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// 分发层统一结果类型
pub type Result<T> = std::result::Result<T, LbError>;

/// 分发层统一错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LbError {
    /// 无法访问注册中心（watch 或注册调用失败）
    #[error("registry unavailable: {0}")]
    RegistryUnavailable(String),

    /// 为某个地址创建端点失败
    #[error("failed to create endpoint for {instance}: {reason}")]
    EndpointCreationFailed { instance: String, reason: String },

    /// 当前没有可用端点
    #[error("no healthy endpoints available")]
    NoHealthyEndpoints,

    /// 单次调用失败
    #[error("attempt {attempt} against {instance} failed: {reason}")]
    AttemptFailed {
        attempt: usize,
        instance: String,
        reason: String,
    },

    /// 整体截止时间已过
    #[error("deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    /// 重试耗尽（终态聚合错误）
    #[error("retries exhausted after {attempts} attempt(s) in {elapsed:?}: {last}")]
    RetriesExhausted {
        attempts: usize,
        elapsed: Duration,
        last: Box<LbError>,
    },

    /// 传输层错误（编解码、地址解析等）
    #[error("transport error: {0}")]
    Transport(String),

    /// 配置错误
    #[error("configuration error: {0}")]
    Config(String),
}

impl LbError {
    pub fn registry_unavailable(reason: impl std::fmt::Display) -> Self {
        LbError::RegistryUnavailable(reason.to_string())
    }

    pub fn transport(reason: impl std::fmt::Display) -> Self {
        LbError::Transport(reason.to_string())
    }

    pub fn config(reason: impl Into<String>) -> Self {
        LbError::Config(reason.into())
    }

    /// 错误代码
    pub fn code(&self) -> ErrorCode {
        match self {
            LbError::RegistryUnavailable(_) => ErrorCode::RegistryUnavailable,
            LbError::EndpointCreationFailed { .. } => ErrorCode::EndpointCreationFailed,
            LbError::NoHealthyEndpoints => ErrorCode::NoHealthyEndpoints,
            LbError::AttemptFailed { .. } => ErrorCode::AttemptFailed,
            LbError::DeadlineExceeded(_) => ErrorCode::DeadlineExceeded,
            LbError::RetriesExhausted { .. } => ErrorCode::RetriesExhausted,
            LbError::Transport(_) => ErrorCode::TransportError,
            LbError::Config(_) => ErrorCode::ConfigError,
        }
    }

    /// 是否值得换一个端点再试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LbError::AttemptFailed { .. }
                | LbError::NoHealthyEndpoints
                | LbError::Transport(_)
                | LbError::RegistryUnavailable(_)
        )
    }

    /// 终态错误中记录的尝试次数
    pub fn attempts(&self) -> Option<usize> {
        match self {
            LbError::RetriesExhausted { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for LbError {
    fn from(err: reqwest::Error) -> Self {
        LbError::Transport(err.to_string())
    }
}

impl From<toml::de::Error> for LbError {
    fn from(err: toml::de::Error) -> Self {
        LbError::Config(err.to_string())
    }
}
