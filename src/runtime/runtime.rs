//! 服务运行时实现
//!
//! 启动顺序：启动服务任务 → 等待端口可连接 → 注册 → 等待关闭信号。
//! 关闭顺序：取消服务任务 → 等待其退出（带超时）→ 注销。

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use anyhow::Result;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::discovery::Registrar;
use crate::runtime::config::RuntimeConfig;

/// 等待进程关闭信号（Ctrl+C，unix 下还包括 SIGTERM）
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Shutdown signal received (Ctrl+C)"),
        _ = terminate => info!("Shutdown signal received (SIGTERM)"),
    }
}

/// 服务运行时
///
/// 管理单个服务端任务的生命周期，并保证注册发生在服务可以接受连接之后，
/// 注销发生在服务停止之后。
pub struct ServiceRuntime {
    service_name: String,
    service_address: SocketAddr,
    config: RuntimeConfig,
}

impl ServiceRuntime {
    /// # 参数
    /// * `service_name` - 服务名称（用于日志）
    /// * `service_address` - 服务监听地址（用于就绪检查）
    pub fn new(service_name: impl Into<String>, service_address: SocketAddr) -> Self {
        Self {
            service_name: service_name.into(),
            service_address,
            config: RuntimeConfig::default(),
        }
    }

    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// 运行服务直到收到进程关闭信号
    pub async fn run_with_registration<F, Fut>(self, registrar: &Registrar, serve: F) -> Result<()>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.run_until(registrar, serve, shutdown_signal()).await
    }

    /// 运行服务直到 `shutdown` 完成或服务任务自行退出
    ///
    /// `serve` 接收一个取消令牌，令牌被取消后应尽快停止服务。
    /// 注册失败时服务会被停止并返回错误；无论服务如何退出，都会尝试注销。
    pub async fn run_until<F, Fut, S>(
        self,
        registrar: &Registrar,
        serve: F,
        shutdown: S,
    ) -> Result<()>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
        S: Future<Output = ()>,
    {
        info!(
            service_name = %self.service_name,
            address = %self.service_address,
            instance_id = %registrar.registration().id,
            "Starting service runtime with registration"
        );

        let cancel = CancellationToken::new();
        let mut join_set = JoinSet::new();
        join_set.spawn(serve(cancel.clone()));

        if let Err(e) = self.wait_for_ready().await {
            error!(error = %e, "Service not ready, shutting down");
            cancel.cancel();
            self.wait_for_shutdown(&mut join_set).await;
            return Err(e);
        }

        if let Err(e) = registrar.register().await {
            error!(error = %e, "Service registration failed, shutting down service");
            cancel.cancel();
            self.wait_for_shutdown(&mut join_set).await;
            return Err(anyhow::anyhow!("Service registration failed: {}", e));
        }

        let server_result = self.wait_for_exit(&mut join_set, shutdown).await;

        cancel.cancel();
        self.wait_for_shutdown(&mut join_set).await;

        if let Err(e) = registrar.deregister().await {
            warn!(error = %e, "Failed to deregister service gracefully");
        }

        info!(service_name = %self.service_name, "Service runtime stopped");
        server_result
    }

    /// 运行不需要注册的服务（如代理）直到收到进程关闭信号
    pub async fn run<F, Fut>(self, serve: F) -> Result<()>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.run_without_registration(serve, shutdown_signal()).await
    }

    /// 运行服务直到 `shutdown` 完成或服务任务自行退出，不访问注册中心
    pub async fn run_without_registration<F, Fut, S>(self, serve: F, shutdown: S) -> Result<()>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
        S: Future<Output = ()>,
    {
        info!(
            service_name = %self.service_name,
            address = %self.service_address,
            "Starting service runtime"
        );

        let cancel = CancellationToken::new();
        let mut join_set = JoinSet::new();
        join_set.spawn(serve(cancel.clone()));

        let server_result = self.wait_for_exit(&mut join_set, shutdown).await;

        cancel.cancel();
        self.wait_for_shutdown(&mut join_set).await;

        info!(service_name = %self.service_name, "Service runtime stopped");
        server_result
    }

    /// 等待关闭信号或服务任务退出，返回服务任务的结果
    async fn wait_for_exit<S>(&self, join_set: &mut JoinSet<Result<()>>, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        tokio::select! {
            _ = shutdown => Ok(()),
            joined = join_set.join_next() => match joined {
                Some(Ok(Ok(()))) => {
                    warn!("Server exited before shutdown signal");
                    Ok(())
                }
                Some(Ok(Err(e))) => {
                    error!(error = %e, "Server exited with error");
                    Err(e)
                }
                Some(Err(e)) => Err(anyhow::anyhow!("Server task panicked: {}", e)),
                None => Ok(()),
            },
        }
    }

    async fn wait_for_ready(&self) -> Result<()> {
        let address = ready_check_address(self.service_address);
        match tokio::time::timeout(
            self.config.ready_check_timeout,
            crate::utils::wait_for_server_ready(address),
        )
        .await
        {
            Ok(Ok(())) => {
                info!(address = %address, "Service is ready");
                Ok(())
            }
            Ok(Err(e)) => Err(anyhow::anyhow!(
                "Failed to wait for service to be ready: {}",
                e
            )),
            Err(_) => Err(anyhow::anyhow!(
                "Service ready check timeout after {:?}",
                self.config.ready_check_timeout
            )),
        }
    }

    async fn wait_for_shutdown(&self, join_set: &mut JoinSet<Result<()>>) {
        let drained = tokio::time::timeout(self.config.shutdown_timeout, async {
            while let Some(result) = join_set.join_next().await {
                match result {
                    Ok(Ok(())) => info!("Server stopped gracefully"),
                    Ok(Err(e)) => warn!(error = %e, "Server stopped with error"),
                    Err(e) => warn!(error = %e, "Server task join error"),
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                timeout = ?self.config.shutdown_timeout,
                "Server shutdown timeout, forcing exit"
            );
            join_set.abort_all();
        }
    }
}

/// 监听在通配地址时，改为探测本机回环地址
fn ready_check_address(address: SocketAddr) -> SocketAddr {
    if address.ip().is_unspecified() {
        let ip = match address.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(_) => IpAddr::V6(std::net::Ipv6Addr::LOCALHOST),
        };
        SocketAddr::new(ip, address.port())
    } else {
        address
    }
}
