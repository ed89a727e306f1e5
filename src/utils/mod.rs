//! 工具函数模块

use std::net::SocketAddr;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use crate::error::BoxError;

/// 初始化日志
///
/// 级别由 `RUST_LOG` 控制（默认 `info`），`LOG_FORMAT=json` 时输出 JSON。
/// 重复调用是安全的，只有第一次生效。
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

/// 拼接路由前缀与路径：`join_path("/api/", "count") == "/api/count"`
pub fn join_path(prefix: &str, name: &str) -> String {
    let prefix = prefix.trim().trim_end_matches('/');
    let name = name.trim_start_matches('/');
    if prefix.is_empty() {
        format!("/{}", name)
    } else if prefix.starts_with('/') {
        format!("{}/{}", prefix, name)
    } else {
        format!("/{}/{}", prefix, name)
    }
}

/// 等待服务启动就绪（通过 TCP 连接重试）
///
/// 使用指数退避重试连接，直到服务真正可以接受连接，之后才应该向注册中心注册。
pub async fn wait_for_server_ready(address: SocketAddr) -> Result<(), BoxError> {
    use tokio::net::TcpStream;
    use tokio::time::{sleep, timeout};
    use tracing::debug;

    const MAX_RETRIES: u32 = 30;
    const INITIAL_DELAY_MS: u64 = 50;
    const MAX_DELAY_MS: u64 = 500;
    const TOTAL_TIMEOUT_SECS: u64 = 10;

    let start = std::time::Instant::now();
    let mut delay_ms = INITIAL_DELAY_MS;

    for attempt in 1..=MAX_RETRIES {
        if start.elapsed().as_secs() > TOTAL_TIMEOUT_SECS {
            return Err(format!(
                "Server readiness check timeout after {} seconds",
                TOTAL_TIMEOUT_SECS
            )
            .into());
        }

        match timeout(Duration::from_millis(100), TcpStream::connect(address)).await {
            Ok(Ok(_)) => {
                debug!(
                    address = %address,
                    attempts = attempt,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Server is ready"
                );
                return Ok(());
            }
            Ok(Err(e)) => {
                debug!(
                    address = %address,
                    attempt = attempt,
                    error = %e,
                    "Connection attempt failed, retrying..."
                );
            }
            Err(_) => {
                debug!(
                    address = %address,
                    attempt = attempt,
                    "Connection attempt timed out, retrying..."
                );
            }
        }

        sleep(Duration::from_millis(delay_ms)).await;
        delay_ms = (delay_ms * 2).min(MAX_DELAY_MS);
    }

    Err(format!("Server readiness check failed after {} attempts", MAX_RETRIES).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("", "uppercase"), "/uppercase");
        assert_eq!(join_path("/api", "count"), "/api/count");
        assert_eq!(join_path("/api/", "/count"), "/api/count");
        assert_eq!(join_path("api", "metrics"), "/api/metrics");
    }

    #[tokio::test]
    async fn test_wait_for_bound_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        wait_for_server_ready(addr).await.unwrap();
    }

    #[test]
    fn test_init_tracing_twice() {
        init_tracing();
        init_tracing();
    }
}
