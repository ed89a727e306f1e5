//! 字符串服务
//!
//! 配置来自环境变量（`CONSUL_SERVER`、`SERVICE`、`HOST`、`LISTEN`、`PREFIX`），
//! 或者第一个命令行参数指定的 TOML 文件。

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::info;

use lb_dispatch::config::ServerConfig;
use lb_dispatch::discovery::{ConsulRegistry, Registrar};
use lb_dispatch::metrics::ServiceMetrics;
use lb_dispatch::runtime::ServiceRuntime;
use lb_dispatch::server::{self, AppState};
use lb_dispatch::utils::init_tracing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = match std::env::args().nth(1) {
        Some(path) => ServerConfig::load_from_file(&path)
            .with_context(|| format!("failed to load config from {}", path))?,
        None => ServerConfig::from_env().context("invalid environment configuration")?,
    };
    info!(
        service = %config.registry.service,
        host = %config.host,
        listen = %config.listen,
        prefix = %config.prefix,
        consul = %config.registry.url,
        "Starting string service"
    );

    let registry = Arc::new(ConsulRegistry::new(&config.registry.url)?);
    let registrar = Registrar::new(registry, config.registration()?);

    let metrics = ServiceMetrics::new()?;
    let router = server::router(&config.prefix, AppState::new(metrics));

    let bind_addr = config.bind_addr()?;
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", bind_addr))?;
    let address = listener.local_addr()?;

    ServiceRuntime::new(config.registry.service.clone(), address)
        .run_with_registration(&registrar, move |shutdown| {
            server::serve(listener, router, shutdown)
        })
        .await
}
