//! 字符串服务
//!
//! 分发层之上的业务示例：服务端实现 [`StringService`]，
//! 日志与指标以装饰器的形式在构建时按固定顺序叠加。

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

/// 业务错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StringServiceError {
    #[error("empty string")]
    Empty,
}

/// 字符串服务能力
#[async_trait]
pub trait StringService: Send + Sync {
    async fn uppercase(&self, s: &str) -> Result<String, StringServiceError>;
    async fn count(&self, s: &str) -> usize;
}

#[async_trait]
impl<T> StringService for Arc<T>
where
    T: StringService + ?Sized,
{
    async fn uppercase(&self, s: &str) -> Result<String, StringServiceError> {
        (**self).uppercase(s).await
    }

    async fn count(&self, s: &str) -> usize {
        (**self).count(s).await
    }
}

/// 基础实现
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicStringService;

#[async_trait]
impl StringService for BasicStringService {
    async fn uppercase(&self, s: &str) -> Result<String, StringServiceError> {
        if s.is_empty() {
            return Err(StringServiceError::Empty);
        }
        Ok(s.to_uppercase())
    }

    async fn count(&self, s: &str) -> usize {
        s.len()
    }
}
