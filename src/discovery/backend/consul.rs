//! Consul 注册中心后端
//!
//! 基于 Consul HTTP API：
//! - 监听：`GET /v1/health/service/:service`（blocking query，`X-Consul-Index`）
//! - 注册：`PUT /v1/agent/service/register`
//! - 注销：`PUT /v1/agent/service/deregister/:id`

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client as HttpClient, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{RegistryClient, WatchQuery, WatchResult};
use crate::discovery::instance::Instance;
use crate::discovery::registrar::{HealthCheck, Registration};
use crate::error::{LbError, Result};

const CONSUL_INDEX_HEADER: &str = "X-Consul-Index";
const DEFAULT_CONSUL_URL: &str = "http://localhost:8500";

/// Consul 注册中心后端
#[derive(Clone)]
pub struct ConsulRegistry {
    http_client: HttpClient,
    consul_url: String,
}

impl ConsulRegistry {
    /// 创建新的 Consul 后端
    ///
    /// `consul_url` 可以省略协议（如 `consul:8500`），为空时使用 `http://localhost:8500`
    pub fn new(consul_url: &str) -> Result<Self> {
        let consul_url = normalize_url(consul_url);
        reqwest::Url::parse(&consul_url)
            .map_err(|e| LbError::config(format!("invalid consul url '{}': {}", consul_url, e)))?;

        Ok(Self {
            http_client: HttpClient::new(),
            consul_url,
        })
    }

    /// 使用自定义 HTTP 客户端
    pub fn with_http_client(mut self, http_client: HttpClient) -> Self {
        self.http_client = http_client;
        self
    }

    pub fn url(&self) -> &str {
        &self.consul_url
    }
}

fn normalize_url(url: &str) -> String {
    let url = url.trim().trim_end_matches('/');
    if url.is_empty() {
        return DEFAULT_CONSUL_URL.to_string();
    }
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("http://{}", url)
    }
}

/// Consul 要求 wait 使用 "10s" 形式
fn consul_duration(d: Duration) -> String {
    if d.subsec_millis() == 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{}ms", d.as_millis())
    }
}

#[async_trait]
impl RegistryClient for ConsulRegistry {
    async fn watch(&self, query: &WatchQuery, last_index: u64) -> Result<WatchResult> {
        let url = format!("{}/v1/health/service/{}", self.consul_url, query.service);

        let mut params: Vec<(&str, String)> = vec![("wait", consul_duration(query.wait))];
        if last_index > 0 {
            params.push(("index", last_index.to_string()));
        }
        if query.passing_only {
            params.push(("passing", "true".to_string()));
        }
        for tag in &query.tags {
            params.push(("tag", tag.clone()));
        }

        // Consul 会把 wait 再加上最多 1/16 的抖动，留出余量
        let timeout = query.wait + query.wait / 16 + Duration::from_secs(5);

        let resp = self
            .http_client
            .get(&url)
            .query(&params)
            .timeout(timeout)
            .send()
            .await
            .map_err(LbError::registry_unavailable)?;

        if !resp.status().is_success() {
            return Err(LbError::registry_unavailable(format!(
                "consul health query for '{}' failed with status {}",
                query.service,
                resp.status()
            )));
        }

        let index = resp
            .headers()
            .get(CONSUL_INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);

        let entries: Vec<HealthEntry> = resp.json().await.map_err(|e| {
            LbError::registry_unavailable(format!("invalid consul health response: {}", e))
        })?;

        let instances = entries
            .into_iter()
            .filter(|entry| {
                query
                    .tags
                    .iter()
                    .all(|tag| entry.service.tags.iter().any(|t| t == tag))
            })
            .map(|entry| {
                // 服务未声明地址时使用节点地址
                let host = if entry.service.address.is_empty() {
                    entry.node.address
                } else {
                    entry.service.address
                };
                Instance::new(host, entry.service.port)
            })
            .collect();

        Ok(WatchResult { instances, index })
    }

    async fn register(&self, registration: &Registration) -> Result<()> {
        let url = format!("{}/v1/agent/service/register", self.consul_url);
        let payload = AgentServiceRegistration::from(registration);

        let resp = self
            .http_client
            .put(&url)
            .json(&payload)
            .send()
            .await
            .map_err(LbError::registry_unavailable)?;

        if !resp.status().is_success() {
            return Err(LbError::registry_unavailable(format!(
                "consul register of '{}' failed with status {}",
                registration.id,
                resp.status()
            )));
        }

        info!(
            service = %registration.service_name,
            instance_id = %registration.id,
            address = %registration.address,
            port = registration.port,
            "Service registered with Consul"
        );
        Ok(())
    }

    async fn deregister(&self, id: &str) -> Result<()> {
        let url = format!("{}/v1/agent/service/deregister/{}", self.consul_url, id);

        let resp = self
            .http_client
            .put(&url)
            .send()
            .await
            .map_err(LbError::registry_unavailable)?;

        match resp.status() {
            status if status.is_success() => {
                info!(instance_id = %id, "Service deregistered from Consul");
                Ok(())
            }
            StatusCode::NOT_FOUND => {
                debug!(instance_id = %id, "Service already absent from Consul");
                Ok(())
            }
            status => Err(LbError::registry_unavailable(format!(
                "consul deregister of '{}' failed with status {}",
                id, status
            ))),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthEntry {
    node: HealthNode,
    service: HealthService,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthNode {
    #[serde(default)]
    address: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthService {
    #[serde(default)]
    address: String,
    port: u16,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct AgentServiceRegistration<'a> {
    #[serde(rename = "ID")]
    id: &'a str,
    name: &'a str,
    tags: &'a [String],
    address: &'a str,
    port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    check: Option<AgentServiceCheck<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct AgentServiceCheck<'a> {
    #[serde(rename = "HTTP")]
    http: &'a str,
    interval: &'a str,
    timeout: &'a str,
    deregister_critical_service_after: &'a str,
}

impl<'a> From<&'a Registration> for AgentServiceRegistration<'a> {
    fn from(registration: &'a Registration) -> Self {
        Self {
            id: &registration.id,
            name: &registration.service_name,
            tags: &registration.tags,
            address: &registration.address,
            port: registration.port,
            check: registration.check.as_ref().map(AgentServiceCheck::from),
        }
    }
}

impl<'a> From<&'a HealthCheck> for AgentServiceCheck<'a> {
    fn from(check: &'a HealthCheck) -> Self {
        Self {
            http: &check.http,
            interval: &check.interval,
            timeout: &check.timeout,
            deregister_critical_service_after: &check.deregister_critical_service_after,
        }
    }
}
