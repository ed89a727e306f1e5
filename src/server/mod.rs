//! 字符串服务 HTTP 服务端
//!
//! 路由：`{prefix}/uppercase`、`{prefix}/count`、`{prefix}/metrics`。

use std::sync::Arc;

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::metrics::ServiceMetrics;
use crate::middleware::{InstrumentingMiddleware, LoggingMiddleware};
use crate::service::{BasicStringService, StringService};
use crate::types::{CountRequest, CountResponse, UppercaseRequest, UppercaseResponse};
use crate::utils::join_path;

/// 服务端共享状态
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<dyn StringService>,
    pub metrics: ServiceMetrics,
}

impl AppState {
    /// 基础实现 → 日志 → 指标
    pub fn new(metrics: ServiceMetrics) -> Self {
        let service = BasicStringService;
        let service = LoggingMiddleware::new(service);
        let service = InstrumentingMiddleware::new(metrics.clone(), service);
        Self {
            service: Arc::new(service),
            metrics,
        }
    }
}

/// 构建服务端路由
pub fn router(prefix: &str, state: AppState) -> Router {
    Router::new()
        .route(&join_path(prefix, "uppercase"), post(uppercase))
        .route(&join_path(prefix, "count"), post(count))
        .route(&join_path(prefix, "metrics"), get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn uppercase(
    State(state): State<AppState>,
    Json(req): Json<UppercaseRequest>,
) -> Json<UppercaseResponse> {
    // 业务错误放在响应体里，HTTP 状态仍为 200
    let resp = match state.service.uppercase(&req.s).await {
        Ok(v) => UppercaseResponse { v, err: None },
        Err(e) => UppercaseResponse {
            v: String::new(),
            err: Some(e.to_string()),
        },
    };
    Json(resp)
}

async fn count(State(state): State<AppState>, Json(req): Json<CountRequest>) -> Json<CountResponse> {
    Json(CountResponse {
        v: state.service.count(&req.s).await,
    })
}

async fn metrics(State(state): State<AppState>) -> Response {
    match state.metrics.encode() {
        Ok(text) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// 在已绑定的监听器上运行，直到 `shutdown` 被取消
pub async fn serve(listener: TcpListener, router: Router, shutdown: CancellationToken) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    info!(address = %addr, "HTTP server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!(address = %addr, "HTTP server stopped");
    Ok(())
}
