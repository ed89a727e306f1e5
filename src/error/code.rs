//! 错误代码定义
//!
//! 错误代码按类别分组：
//! - 1000-1999: 注册中心 / 服务发现
//! - 2000-2999: 端点与调用
//! - 9000-9999: 通用错误

use serde::{Deserialize, Serialize};
use std::fmt;

/// 错误代码枚举
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u32)]
pub enum ErrorCode {
    // ============================================================
    // 注册中心相关错误 (1000-1999)
    // ============================================================
    RegistryUnavailable = 1000,
    EndpointCreationFailed = 1001,

    // ============================================================
    // 调用相关错误 (2000-2999)
    // ============================================================
    NoHealthyEndpoints = 2000,
    AttemptFailed = 2001,
    DeadlineExceeded = 2002,
    RetriesExhausted = 2003,
    TransportError = 2004,

    // ============================================================
    // 通用错误 (9000-9999)
    // ============================================================
    ConfigError = 9000,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl ErrorCode {
    /// 获取错误代码的数字值
    #[inline]
    pub fn as_u32(&self) -> u32 {
        *self as u32
    }

    /// 获取错误代码的英文标识符
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::RegistryUnavailable => "REGISTRY_UNAVAILABLE",
            ErrorCode::EndpointCreationFailed => "ENDPOINT_CREATION_FAILED",
            ErrorCode::NoHealthyEndpoints => "NO_HEALTHY_ENDPOINTS",
            ErrorCode::AttemptFailed => "ATTEMPT_FAILED",
            ErrorCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
            ErrorCode::RetriesExhausted => "RETRIES_EXHAUSTED",
            ErrorCode::TransportError => "TRANSPORT_ERROR",
            ErrorCode::ConfigError => "CONFIG_ERROR",
        }
    }

    /// 对外暴露时使用的 HTTP 状态码
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorCode::NoHealthyEndpoints | ErrorCode::RegistryUnavailable => 503,
            ErrorCode::DeadlineExceeded => 504,
            ErrorCode::RetriesExhausted
            | ErrorCode::AttemptFailed
            | ErrorCode::TransportError
            | ErrorCode::EndpointCreationFailed => 502,
            ErrorCode::ConfigError => 500,
        }
    }
}
