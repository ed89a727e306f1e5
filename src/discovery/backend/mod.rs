//! 注册中心后端抽象和实现

pub mod consul;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;

use crate::discovery::instance::Instance;
use crate::discovery::registrar::Registration;
use crate::error::Result;

pub use consul::ConsulRegistry;
pub use memory::MemoryRegistry;

/// 一次 watch 的查询条件
#[derive(Debug, Clone)]
pub struct WatchQuery {
    /// 服务名称
    pub service: String,
    /// 实例必须同时带有的标签
    pub tags: Vec<String>,
    /// 只返回健康检查通过的实例
    pub passing_only: bool,
    /// 长轮询等待时间（服务端超时）
    pub wait: Duration,
}

impl WatchQuery {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            tags: Vec::new(),
            passing_only: true,
            wait: Duration::from_secs(30),
        }
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_passing_only(mut self, passing_only: bool) -> Self {
        self.passing_only = passing_only;
        self
    }

    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }
}

/// 一次 watch 的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchResult {
    /// 当前满足条件的实例
    pub instances: Vec<Instance>,
    /// 注册中心的 watch 索引
    pub index: u64,
}

/// 注册中心客户端 trait
///
/// 所有注册中心后端都需要实现这个 trait。
/// 注意：由于需要动态分发（dyn），使用 async-trait
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// 长轮询监听服务实例
    ///
    /// 当服务状态相对 `last_index` 发生变化，或服务端等待超时时返回。
    /// `last_index` 为 0 时立即返回当前状态。
    async fn watch(&self, query: &WatchQuery, last_index: u64) -> Result<WatchResult>;

    /// 注册服务实例
    async fn register(&self, registration: &Registration) -> Result<()>;

    /// 注销服务实例（实例不存在时视为成功）
    async fn deregister(&self, id: &str) -> Result<()>;
}
