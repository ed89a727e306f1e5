//! HTTP/JSON 端点
//!
//! 给定路径、方法和编解码函数，为每个实例构建 `http://host:port{path}` 端点。
//! 连接复用交给共享的 reqwest 客户端，端点本身不持有连接。

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client as HttpClient, Method, Url};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::discovery::{Created, Endpoint, EndpointFactory, Instance};
use crate::error::BoxError;

/// 请求编码函数
pub type EncodeFn<Req> = fn(&Req) -> Result<Vec<u8>, BoxError>;
/// 响应解码函数
pub type DecodeFn<Resp> = fn(&[u8]) -> Result<Resp, BoxError>;

pub fn encode_json<T: Serialize>(value: &T) -> Result<Vec<u8>, BoxError> {
    Ok(serde_json::to_vec(value)?)
}

pub fn decode_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, BoxError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// HTTP 端点工厂
pub struct HttpFactory<Req, Resp> {
    client: HttpClient,
    method: Method,
    path: String,
    timeout: Option<Duration>,
    encode: EncodeFn<Req>,
    decode: DecodeFn<Resp>,
}

impl<Req, Resp> Clone for HttpFactory<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            method: self.method.clone(),
            path: self.path.clone(),
            timeout: self.timeout,
            encode: self.encode,
            decode: self.decode,
        }
    }
}

impl<Req, Resp> fmt::Debug for HttpFactory<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpFactory")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl<Req, Resp> HttpFactory<Req, Resp> {
    pub fn new(
        client: HttpClient,
        method: Method,
        path: impl Into<String>,
        encode: EncodeFn<Req>,
        decode: DecodeFn<Resp>,
    ) -> Self {
        Self {
            client,
            method,
            path: path.into(),
            timeout: None,
            encode,
            decode,
        }
    }

    /// 单次调用超时（整体截止时间由重试分发器控制）
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl<Req, Resp> HttpFactory<Req, Resp>
where
    Req: Serialize,
    Resp: DeserializeOwned,
{
    /// JSON 编解码的工厂
    pub fn json(client: HttpClient, method: Method, path: impl Into<String>) -> Self {
        Self::new(client, method, path, encode_json::<Req>, decode_json::<Resp>)
    }
}

impl<Req, Resp> EndpointFactory<Req, Resp> for HttpFactory<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn create(&self, instance: &Instance) -> Result<Created<Req, Resp>, BoxError> {
        let mut url = Url::parse(&instance.to_http_url())?;
        url.set_path(&self.path);

        debug!(instance = %instance, url = %url, method = %self.method, "Building HTTP endpoint");

        let endpoint: Arc<dyn Endpoint<Req, Resp>> = Arc::new(HttpEndpoint {
            client: self.client.clone(),
            method: self.method.clone(),
            url,
            timeout: self.timeout,
            encode: self.encode,
            decode: self.decode,
        });
        Ok((endpoint, None))
    }
}

/// 指向单个实例的 HTTP 端点
pub struct HttpEndpoint<Req, Resp> {
    client: HttpClient,
    method: Method,
    url: Url,
    timeout: Option<Duration>,
    encode: EncodeFn<Req>,
    decode: DecodeFn<Resp>,
}

impl<Req, Resp> HttpEndpoint<Req, Resp> {
    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl<Req, Resp> Endpoint<Req, Resp> for HttpEndpoint<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    async fn call(&self, request: Req) -> Result<Resp, BoxError> {
        let body = (self.encode)(&request)?;

        let mut builder = self
            .client
            .request(self.method.clone(), self.url.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }

        let resp = builder.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(format!("{} {} returned status {}", self.method, self.url, status).into());
        }

        let bytes = resp.bytes().await?;
        (self.decode)(&bytes)
    }
}
