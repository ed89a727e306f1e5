//! 字符串服务客户端与代理
//!
//! 每个逻辑操作各自拥有一条 `Endpointer → Balancer → Retry` 链，
//! 共享同一个 [`Instancer`]。代理把 HTTP 请求经由这些链转发到后端实例。

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use reqwest::{Client as HttpClient, Method};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::DispatchConfig;
use crate::discovery::{Endpointer, Instance, Instancer};
use crate::error::{LbError, Result};
use crate::lb::Retry;
use crate::transport::HttpFactory;
use crate::types::{CountRequest, CountResponse, UppercaseRequest, UppercaseResponse};
use crate::utils::join_path;

/// 字符串服务客户端
pub struct StringClient {
    instancer: Arc<Instancer>,
    uppercase_endpoints: Arc<Endpointer<UppercaseRequest, UppercaseResponse>>,
    count_endpoints: Arc<Endpointer<CountRequest, CountResponse>>,
    uppercase: Retry<UppercaseRequest, UppercaseResponse>,
    count: Retry<CountRequest, CountResponse>,
}

impl StringClient {
    pub fn new(
        instancer: Arc<Instancer>,
        prefix: &str,
        dispatch: &DispatchConfig,
        http_client: HttpClient,
    ) -> Result<Self> {
        dispatch.validate()?;
        let policy = dispatch.stale_policy()?;

        let uppercase_path = join_path(prefix, "uppercase");
        let uppercase_endpoints = Arc::new(Endpointer::new(
            &instancer,
            HttpFactory::json(http_client.clone(), Method::POST, uppercase_path.clone()),
            policy,
        ));
        let uppercase = Retry::new(
            dispatch.max_attempts,
            dispatch.max_elapsed(),
            dispatch.strategy.build(uppercase_endpoints.clone()),
        );

        let count_path = join_path(prefix, "count");
        let count_endpoints = Arc::new(Endpointer::new(
            &instancer,
            HttpFactory::json(http_client, Method::POST, count_path.clone()),
            policy,
        ));
        let count = Retry::new(
            dispatch.max_attempts,
            dispatch.max_elapsed(),
            dispatch.strategy.build(count_endpoints.clone()),
        );

        info!(
            service = %instancer.service(),
            uppercase = %uppercase_path,
            count = %count_path,
            max_attempts = dispatch.max_attempts,
            max_elapsed_ms = dispatch.max_elapsed_ms,
            strategy = %dispatch.strategy,
            "String client ready"
        );

        Ok(Self {
            instancer,
            uppercase_endpoints,
            count_endpoints,
            uppercase,
            count,
        })
    }

    pub async fn uppercase(&self, s: impl Into<String>) -> Result<UppercaseResponse> {
        self.uppercase.call(UppercaseRequest { s: s.into() }).await
    }

    pub async fn count(&self, s: impl Into<String>) -> Result<CountResponse> {
        self.count.call(CountRequest { s: s.into() }).await
    }

    /// 当前可调用的实例
    pub fn instances(&self) -> Vec<Instance> {
        self.uppercase_endpoints.instances()
    }

    /// 释放全部端点并停止监听
    pub async fn close(&self) {
        self.uppercase_endpoints.close();
        self.count_endpoints.close();
        self.instancer.stop().await;
    }
}

/// 构建代理路由：`{prefix}/uppercase`、`{prefix}/count`
pub fn proxy_router(prefix: &str, client: Arc<StringClient>) -> Router {
    Router::new()
        .route(&join_path(prefix, "uppercase"), post(proxy_uppercase))
        .route(&join_path(prefix, "count"), post(proxy_count))
        .layer(TraceLayer::new_for_http())
        .with_state(client)
}

async fn proxy_uppercase(
    State(client): State<Arc<StringClient>>,
    Json(req): Json<UppercaseRequest>,
) -> Response {
    match client.uppercase(req.s).await {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => error_response("uppercase", e),
    }
}

async fn proxy_count(
    State(client): State<Arc<StringClient>>,
    Json(req): Json<CountRequest>,
) -> Response {
    match client.count(req.s).await {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => error_response("count", e),
    }
}

fn error_response(method: &str, err: LbError) -> Response {
    let code = err.code();
    warn!(method, code = code.as_str(), error = %err, "Proxy call failed");
    let status =
        StatusCode::from_u16(code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        Json(serde_json::json!({
            "err": err.to_string(),
            "code": code.as_u32(),
        })),
    )
        .into_response()
}
