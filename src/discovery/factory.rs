//! 端点与端点工厂
//!
//! 端点工厂是一个显式的策略值：`(instance) -> Result<(Endpoint, Option<Closer>)>`，
//! 在构建 [`Endpointer`](crate::discovery::Endpointer) 时注入。

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::discovery::instance::Instance;
use crate::error::BoxError;

/// 可调用的端点：一次调用对应一次网络往返
#[async_trait]
pub trait Endpoint<Req, Resp>: Send + Sync
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    async fn call(&self, request: Req) -> Result<Resp, BoxError>;
}

/// 端点释放动作（如关闭持有的连接）
pub trait Closer: Send + Sync {
    fn close(&self);
}

impl<F> Closer for F
where
    F: Fn() + Send + Sync,
{
    fn close(&self) {
        self()
    }
}

/// 工厂创建结果
pub type Created<Req, Resp> = (Arc<dyn Endpoint<Req, Resp>>, Option<Box<dyn Closer>>);

/// 端点工厂
pub trait EndpointFactory<Req, Resp>: Send + Sync
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn create(&self, instance: &Instance) -> Result<Created<Req, Resp>, BoxError>;
}

impl<Req, Resp, F> EndpointFactory<Req, Resp> for F
where
    Req: Send + 'static,
    Resp: Send + 'static,
    F: Fn(&Instance) -> Result<Created<Req, Resp>, BoxError> + Send + Sync,
{
    fn create(&self, instance: &Instance) -> Result<Created<Req, Resp>, BoxError> {
        self(instance)
    }
}

/// 闭包端点
pub struct FnEndpoint<F>(F);

impl<F> FnEndpoint<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<Req, Resp, F, Fut> Endpoint<Req, Resp> for FnEndpoint<F>
where
    Req: Send + 'static,
    Resp: Send + 'static,
    F: Fn(Req) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Resp, BoxError>> + Send + 'static,
{
    async fn call(&self, request: Req) -> Result<Resp, BoxError> {
        (self.0)(request).await
    }
}

/// 端点句柄
///
/// 由 Endpointer 独占创建，均衡器与分发器只在一次调用期间借用（克隆 `Arc`）。
/// 最后一个持有者释放时执行 release 动作，因此正在进行的调用不会因为
/// 实例被移除而中断。
pub struct EndpointHandle<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    instance: Instance,
    endpoint: Arc<dyn Endpoint<Req, Resp>>,
    closer: Option<Box<dyn Closer>>,
}

impl<Req, Resp> EndpointHandle<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    pub fn new(
        instance: Instance,
        endpoint: Arc<dyn Endpoint<Req, Resp>>,
        closer: Option<Box<dyn Closer>>,
    ) -> Self {
        Self {
            instance,
            endpoint,
            closer,
        }
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    pub async fn call(&self, request: Req) -> Result<Resp, BoxError> {
        self.endpoint.call(request).await
    }
}

impl<Req, Resp> fmt::Debug for EndpointHandle<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointHandle")
            .field("instance", &self.instance)
            .field("has_closer", &self.closer.is_some())
            .finish()
    }
}

impl<Req, Resp> Drop for EndpointHandle<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn drop(&mut self) {
        if let Some(closer) = self.closer.take() {
            debug!(instance = %self.instance, "Releasing endpoint");
            closer.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_fn_endpoint_and_release_on_last_drop() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();

        let endpoint: Arc<dyn Endpoint<String, usize>> =
            Arc::new(FnEndpoint::new(|s: String| async move { Ok::<_, BoxError>(s.len()) }));
        let handle = Arc::new(EndpointHandle::new(
            Instance::new("a", 1),
            endpoint,
            Some(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        ));

        let borrowed = handle.clone();
        drop(handle);
        assert_eq!(released.load(Ordering::SeqCst), 0);

        assert_eq!(borrowed.call("hello".to_string()).await.unwrap(), 5);
        drop(borrowed);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_closure_factory() {
        let factory = |instance: &Instance| -> Result<Created<String, String>, BoxError> {
            if instance.port() == 0 {
                return Err("port 0".into());
            }
            let endpoint: Arc<dyn Endpoint<String, String>> =
                Arc::new(FnEndpoint::new(|s: String| async move { Ok::<_, BoxError>(s) }));
            Ok((endpoint, None))
        };

        assert!(factory.create(&Instance::new("a", 1)).is_ok());
        assert!(factory.create(&Instance::new("a", 0)).is_err());
    }
}
