//! 字符串服务代理
//!
//! 通过 Consul 发现 `stringsvc` 实例，把 `{prefix}/uppercase`、`{prefix}/count`
//! 经由轮询 + 重试转发给它们。

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::info;

use lb_dispatch::client::{StringClient, proxy_router};
use lb_dispatch::config::ClientConfig;
use lb_dispatch::discovery::{ConsulRegistry, Instancer};
use lb_dispatch::runtime::ServiceRuntime;
use lb_dispatch::server;
use lb_dispatch::utils::init_tracing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = match std::env::args().nth(1) {
        Some(path) => ClientConfig::load_from_file(&path)
            .with_context(|| format!("failed to load config from {}", path))?,
        None => ClientConfig::from_env().context("invalid environment configuration")?,
    };
    info!(
        service = %config.registry.service,
        listen = %config.listen,
        prefix = %config.prefix,
        consul = %config.registry.url,
        "Starting string service proxy"
    );

    let registry = Arc::new(ConsulRegistry::new(&config.registry.url)?);
    let instancer = Arc::new(
        Instancer::connect_with_config(
            registry,
            config.registry.watch_query(),
            config.registry.instancer_config(),
        )
        .await,
    );
    let client = Arc::new(StringClient::new(
        instancer,
        &config.prefix,
        &config.dispatch,
        reqwest::Client::new(),
    )?);

    let bind_addr = config.bind_addr()?;
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", bind_addr))?;

    let address = listener.local_addr()?;
    let router = proxy_router(&config.prefix, client.clone());

    let result = ServiceRuntime::new("stringsvc-proxy", address)
        .run(move |shutdown| server::serve(listener, router, shutdown))
        .await;

    client.close().await;
    info!("String service proxy stopped");
    result
}
