//! 配置
//!
//! 所有配置既可以从 TOML 文件加载，也可以从环境变量读取：
//!
//! | 变量            | 作用                         |
//! |-----------------|------------------------------|
//! | `CONSUL_SERVER` | 注册中心地址                 |
//! | `SERVICE`       | 服务名称                     |
//! | `HOST`          | 服务端对外通告的主机名       |
//! | `LISTEN`        | 监听地址，如 `:8080`         |
//! | `PREFIX`        | 路由前缀，如 `/api`          |

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::discovery::{HealthCheck, InstancerConfig, Registration, StalePolicy, WatchQuery};
use crate::error::{LbError, Result};
use crate::lb::LoadBalanceStrategy;
use crate::retry::ExponentialBackoffPolicy;
use crate::utils::join_path;

fn env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn load_toml<T: serde::de::DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .map_err(|e| LbError::config(format!("failed to read {}: {}", path.display(), e)))?;
    Ok(toml::from_str(&content)?)
}

/// 从 `:8080` / `0.0.0.0:8080` 形式中解析端口
fn listen_port(listen: &str) -> Result<u16> {
    let port = listen
        .rsplit_once(':')
        .map(|(_, port)| port)
        .unwrap_or(listen);
    port.parse::<u16>()
        .map_err(|e| LbError::config(format!("invalid listen address '{}': {}", listen, e)))
}

/// `:8080` 监听所有地址
fn listen_addr(listen: &str) -> Result<SocketAddr> {
    let listen = if listen.starts_with(':') {
        format!("0.0.0.0{}", listen)
    } else {
        listen.to_string()
    };
    listen
        .parse()
        .map_err(|e| LbError::config(format!("invalid listen address '{}': {}", listen, e)))
}

fn default_listen() -> String {
    ":8080".to_string()
}

fn default_host() -> String {
    "localhost".to_string()
}

/// 注册中心配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RegistryConfig {
    /// Consul 地址，为空时使用 `http://localhost:8500`
    #[serde(default)]
    pub url: String,
    /// 服务名称
    pub service: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_passing_only")]
    pub passing_only: bool,
    /// 长轮询等待时间（秒）
    #[serde(default = "default_wait_secs")]
    pub wait_secs: u64,
    /// 每个订阅者的待处理队列长度
    #[serde(default = "default_listener_buffer")]
    pub listener_buffer: usize,
}

fn default_passing_only() -> bool {
    true
}

fn default_wait_secs() -> u64 {
    30
}

fn default_listener_buffer() -> usize {
    16
}

impl RegistryConfig {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            url: String::new(),
            service: service.into(),
            tags: Vec::new(),
            passing_only: default_passing_only(),
            wait_secs: default_wait_secs(),
            listener_buffer: default_listener_buffer(),
        }
    }

    pub fn from_env() -> Self {
        let mut config = Self::new(env("SERVICE").unwrap_or_default());
        if let Some(url) = env("CONSUL_SERVER") {
            config.url = url;
        }
        config
    }

    pub fn validate(&self) -> Result<()> {
        if self.service.trim().is_empty() {
            return Err(LbError::config("service name is empty"));
        }
        if self.wait_secs == 0 {
            return Err(LbError::config("registry wait must be at least 1 second"));
        }
        Ok(())
    }

    pub fn watch_query(&self) -> WatchQuery {
        WatchQuery::new(self.service.clone())
            .with_tags(self.tags.clone())
            .with_passing_only(self.passing_only)
            .with_wait(Duration::from_secs(self.wait_secs))
    }

    pub fn instancer_config(&self) -> InstancerConfig {
        InstancerConfig {
            listener_buffer: self.listener_buffer.max(1),
            backoff: ExponentialBackoffPolicy::default(),
        }
    }
}

/// 分发配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DispatchConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    /// 整体截止时间（毫秒）
    #[serde(default = "default_max_elapsed_ms")]
    pub max_elapsed_ms: u64,
    #[serde(default)]
    pub strategy: LoadBalanceStrategy,
    /// `serve_stale` / `fail_closed` / `invalidate_after`
    #[serde(default = "default_stale_policy")]
    pub stale_policy: String,
    /// `invalidate_after` 的宽限期（毫秒）
    #[serde(default)]
    pub invalidate_after_ms: Option<u64>,
}

fn default_max_attempts() -> usize {
    3
}

fn default_max_elapsed_ms() -> u64 {
    3_000
}

fn default_stale_policy() -> String {
    "serve_stale".to_string()
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            max_elapsed_ms: default_max_elapsed_ms(),
            strategy: LoadBalanceStrategy::default(),
            stale_policy: default_stale_policy(),
            invalidate_after_ms: None,
        }
    }
}

impl DispatchConfig {
    pub fn max_elapsed(&self) -> Duration {
        Duration::from_millis(self.max_elapsed_ms)
    }

    pub fn stale_policy(&self) -> Result<StalePolicy> {
        match self.stale_policy.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "serve_stale" => Ok(StalePolicy::ServeStale),
            "fail_closed" => Ok(StalePolicy::FailClosed),
            "invalidate_after" => {
                let ms = self.invalidate_after_ms.ok_or_else(|| {
                    LbError::config("invalidate_after requires invalidate_after_ms")
                })?;
                Ok(StalePolicy::InvalidateAfter(Duration::from_millis(ms)))
            }
            other => Err(LbError::config(format!("unknown stale policy '{}'", other))),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(LbError::config("max_attempts must be at least 1"));
        }
        if self.max_elapsed_ms == 0 {
            return Err(LbError::config("max_elapsed_ms must be positive"));
        }
        self.stale_policy().map(|_| ())
    }
}

/// 代理（客户端）配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub prefix: String,
    pub registry: RegistryConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

impl ClientConfig {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = load_toml(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self> {
        let config = Self {
            listen: env("LISTEN").unwrap_or_else(default_listen),
            prefix: env("PREFIX").unwrap_or_default(),
            registry: RegistryConfig::from_env(),
            dispatch: DispatchConfig::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.registry.validate()?;
        self.dispatch.validate()?;
        self.bind_addr().map(|_| ())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        listen_addr(&self.listen)
    }
}

/// 服务端配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// 注册到注册中心的主机名
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub prefix: String,
    pub registry: RegistryConfig,
}

impl ServerConfig {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = load_toml(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self> {
        let config = Self {
            host: env("HOST").unwrap_or_else(default_host),
            listen: env("LISTEN").unwrap_or_else(default_listen),
            prefix: env("PREFIX").unwrap_or_default(),
            registry: RegistryConfig::from_env(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.registry.validate()?;
        if self.host.trim().is_empty() {
            return Err(LbError::config("host is empty"));
        }
        self.bind_addr().map(|_| ())
    }

    pub fn port(&self) -> Result<u16> {
        listen_port(&self.listen)
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        listen_addr(&self.listen)
    }

    /// 注册记录，ID 为 `host:port/prefix`，同一主机上不同端口或前缀的进程互不冲突
    ///
    /// 附带对 `{prefix}/metrics` 的 HTTP 健康检查，进程异常退出未注销时由注册中心摘除。
    pub fn registration(&self) -> Result<Registration> {
        let port = self.port()?;
        let id = format!("{}:{}/{}", self.host, port, self.prefix.trim_matches('/'));
        let check_url = format!(
            "http://{}:{}{}",
            self.host,
            port,
            join_path(&self.prefix, "metrics")
        );
        Ok(Registration::new(self.registry.service.clone(), self.host.clone(), port)
            .with_id(id)
            .with_tags(self.registry.tags.clone())
            .with_check(HealthCheck::http(check_url)))
    }
}
