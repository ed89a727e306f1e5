//! 服务注册器
//!
//! 启动时把本进程注册到注册中心，关闭时保证注销：
//! - 正常退出 / 信号退出：由运行时显式调用 [`Registrar::deregister`]
//! - 忘记调用：`Drop` 中尝试异步注销
//!
//! 如果进程未注销就退出，注册中心最终会通过自身的健康检查超时把实例标记为
//! 不健康，但这只是降级兜底。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::discovery::backend::RegistryClient;
use crate::discovery::instance::Instance;
use crate::error::Result;

/// 注册记录
///
/// `id` 在同一服务的所有实例中必须唯一，否则注册中心会把两个进程混为一个。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub id: String,
    pub service_name: String,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub check: Option<HealthCheck>,
}

/// 注册中心执行的 HTTP 健康检查
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub http: String,
    pub interval: String,
    pub timeout: String,
    pub deregister_critical_service_after: String,
}

impl HealthCheck {
    pub fn http(url: impl Into<String>) -> Self {
        Self {
            http: url.into(),
            interval: "10s".to_string(),
            timeout: "5s".to_string(),
            deregister_critical_service_after: "90s".to_string(),
        }
    }
}

impl Registration {
    /// 创建注册记录，默认 ID 为 `address:port`
    pub fn new(service_name: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        let address = address.into();
        Self {
            id: Instance::new(address.clone(), port).to_string(),
            service_name: service_name.into(),
            address,
            port,
            tags: Vec::new(),
            check: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// 在 ID 后追加随机后缀，用于同一地址上运行多个进程的场景
    pub fn with_unique_suffix(mut self) -> Self {
        self.id = format!("{}-{}", self.id, uuid::Uuid::new_v4());
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_check(mut self, check: HealthCheck) -> Self {
        self.check = Some(check);
        self
    }

    /// 该记录对应的实例地址
    pub fn instance(&self) -> Instance {
        Instance::new(self.address.clone(), self.port)
    }
}

/// 服务注册器
pub struct Registrar {
    client: Arc<dyn RegistryClient>,
    registration: Registration,
    registered: AtomicBool,
}

impl Registrar {
    pub fn new(client: Arc<dyn RegistryClient>, registration: Registration) -> Self {
        Self {
            client,
            registration,
            registered: AtomicBool::new(false),
        }
    }

    pub fn registration(&self) -> &Registration {
        &self.registration
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    /// 注册服务实例
    pub async fn register(&self) -> Result<()> {
        self.client.register(&self.registration).await?;
        self.registered.store(true, Ordering::Release);
        info!(
            service = %self.registration.service_name,
            instance_id = %self.registration.id,
            "Service registered"
        );
        Ok(())
    }

    /// 注销服务实例
    ///
    /// 幂等：未注册或已注销时直接返回成功
    pub async fn deregister(&self) -> Result<()> {
        if !self.registered.swap(false, Ordering::AcqRel) {
            debug!(instance_id = %self.registration.id, "Service not registered, skip deregister");
            return Ok(());
        }

        match self.client.deregister(&self.registration.id).await {
            Ok(()) => {
                info!(instance_id = %self.registration.id, "Service deregistered");
                Ok(())
            }
            Err(e) => {
                // 保留注册标记，允许调用方或 Drop 再次尝试
                self.registered.store(true, Ordering::Release);
                warn!(
                    instance_id = %self.registration.id,
                    error = %e,
                    "Failed to deregister service"
                );
                Err(e)
            }
        }
    }
}

impl Drop for Registrar {
    fn drop(&mut self) {
        if !self.registered.swap(false, Ordering::AcqRel) {
            return;
        }

        let instance_id = self.registration.id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let client = self.client.clone();
                handle.spawn(async move {
                    match client.deregister(&instance_id).await {
                        Ok(()) => {
                            info!(instance_id = %instance_id, "Service deregistered (from Drop)");
                        }
                        Err(e) => {
                            warn!(
                                instance_id = %instance_id,
                                error = %e,
                                "Failed to deregister service (from Drop)"
                            );
                        }
                    }
                });
            }
            Err(_) => {
                warn!(
                    instance_id = %instance_id,
                    "Cannot deregister service: tokio runtime not available"
                );
            }
        }
    }
}
