//! 服务发现驱动的负载均衡与重试调用
//!
//! 调用链：注册中心 → [`Instancer`](discovery::Instancer) →
//! [`Endpointer`](discovery::Endpointer) → [`Balancer`](lb::Balancer) →
//! [`Retry`](lb::Retry)。服务端通过 [`Registrar`](discovery::Registrar)
//! 在注册中心登记自身。
//!
//! 附带一个字符串服务（`uppercase` / `count`）作为端到端示例：
//! [`server`] 提供服务端路由，[`client`] 提供基于服务发现的客户端与代理。

pub mod client;
pub mod config;
pub mod discovery;
pub mod error;
pub mod lb;
pub mod metrics;
pub mod middleware;
pub mod retry;
pub mod runtime;
pub mod server;
pub mod service;
pub mod transport;
pub mod types;
pub mod utils;

// Re-exports
pub use client::{StringClient, proxy_router};
pub use config::{ClientConfig, DispatchConfig, RegistryConfig, ServerConfig};
pub use discovery::{
    ConsulRegistry, Endpoint, EndpointFactory, EndpointHandle, Endpointer, Instance, InstanceSet,
    Instancer, MemoryRegistry, Registrar, Registration, RegistryClient, StalePolicy, WatchQuery,
};
pub use error::{ErrorCode, LbError, Result};
pub use lb::{Balancer, EmptyEndpoints, LoadBalanceStrategy, Random, Retry, RoundRobin};
pub use retry::{ExponentialBackoffPolicy, FixedRetryPolicy, RetryPolicy};
pub use runtime::{RuntimeConfig, ServiceRuntime};
pub use transport::HttpFactory;
