//! 端点缓存
//!
//! 订阅 [`Instancer`]，把实例集合的每次变化转换成端点表的增量更新：
//! 新增实例调用工厂创建端点，移除的实例释放端点，未变化的实例保留原句柄。
//! 更新完成后整体替换对外快照，读者不会观察到更新到一半的端点表。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::discovery::factory::{EndpointFactory, EndpointHandle};
use crate::discovery::instance::{Instance, InstanceSet};
use crate::discovery::instancer::Instancer;

/// 当前可用端点列表
pub type Endpoints<Req, Resp> = Arc<[Arc<EndpointHandle<Req, Resp>>]>;

/// 注册中心报错时的端点策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StalePolicy {
    /// 继续使用最后一次已知的端点
    #[default]
    ServeStale,
    /// 释放全部端点，调用立即失败
    FailClosed,
    /// 报错后继续使用旧端点一段时间，超时后视为没有端点
    InvalidateAfter(Duration),
}

struct Snapshot<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    endpoints: Endpoints<Req, Resp>,
    invalid_after: Option<Instant>,
}

impl<Req, Resp> Snapshot<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn empty() -> Self {
        Self {
            endpoints: Arc::from(Vec::new()),
            invalid_after: None,
        }
    }
}

/// 端点快照读取器，可廉价克隆并在任意线程并发读取
pub struct EndpointReader<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    snapshot: Arc<ArcSwap<Snapshot<Req, Resp>>>,
}

impl<Req, Resp> Clone for EndpointReader<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn clone(&self) -> Self {
        Self {
            snapshot: self.snapshot.clone(),
        }
    }
}

impl<Req, Resp> EndpointReader<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    /// 当前端点（按实例排序）
    pub fn endpoints(&self) -> Endpoints<Req, Resp> {
        let snapshot = self.snapshot.load();
        match snapshot.invalid_after {
            Some(deadline) if Instant::now() >= deadline => Arc::from(Vec::new()),
            _ => snapshot.endpoints.clone(),
        }
    }
}

/// 端点表
///
/// 由单一更新者持有；读者通过 [`EndpointReader`] 访问快照。
pub struct EndpointCache<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    factory: Arc<dyn EndpointFactory<Req, Resp>>,
    policy: StalePolicy,
    table: BTreeMap<Instance, Arc<EndpointHandle<Req, Resp>>>,
    error_since: Option<Instant>,
    closed: bool,
    snapshot: Arc<ArcSwap<Snapshot<Req, Resp>>>,
}

impl<Req, Resp> EndpointCache<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    pub fn new(factory: Arc<dyn EndpointFactory<Req, Resp>>, policy: StalePolicy) -> Self {
        Self {
            factory,
            policy,
            table: BTreeMap::new(),
            error_since: None,
            closed: false,
            snapshot: Arc::new(ArcSwap::from_pointee(Snapshot::empty())),
        }
    }

    pub fn reader(&self) -> EndpointReader<Req, Resp> {
        EndpointReader {
            snapshot: self.snapshot.clone(),
        }
    }

    /// 端点表当前的键
    pub fn instances(&self) -> Vec<Instance> {
        self.table.keys().cloned().collect()
    }

    /// 应用一个新的实例集合
    pub fn update(&mut self, set: &InstanceSet) {
        if self.closed {
            return;
        }

        let Some(err) = set.error() else {
            self.error_since = None;
            self.apply(set);
            self.publish(None);
            return;
        };

        warn!(
            error = %err,
            instances = set.len(),
            policy = ?self.policy,
            "Instance set carries a registry error"
        );

        match self.policy {
            StalePolicy::ServeStale => {
                if !set.is_empty() {
                    self.apply(set);
                }
                self.publish(None);
            }
            StalePolicy::FailClosed => {
                self.table.clear();
                self.publish(None);
            }
            StalePolicy::InvalidateAfter(grace) => {
                if !set.is_empty() {
                    self.apply(set);
                }
                let since = *self.error_since.get_or_insert_with(Instant::now);
                self.publish(Some(since + grace));
            }
        }
    }

    /// 释放全部端点，之后的更新都会被忽略
    pub fn close(&mut self) {
        self.closed = true;
        self.table.clear();
        self.publish(None);
    }

    fn apply(&mut self, set: &InstanceSet) {
        self.table.retain(|instance, _| {
            let keep = set.contains(instance);
            if !keep {
                debug!(instance = %instance, "Removing endpoint");
            }
            keep
        });

        for instance in set.instances() {
            if self.table.contains_key(instance) {
                continue;
            }
            match self.factory.create(instance) {
                Ok((endpoint, closer)) => {
                    debug!(instance = %instance, "Created endpoint");
                    self.table.insert(
                        instance.clone(),
                        Arc::new(EndpointHandle::new(instance.clone(), endpoint, closer)),
                    );
                }
                Err(e) => {
                    // 不加入端点表，下一次包含该实例的集合会重新尝试
                    warn!(instance = %instance, error = %e, "Failed to create endpoint");
                }
            }
        }
    }

    fn publish(&self, invalid_after: Option<Instant>) {
        let endpoints: Vec<_> = self.table.values().cloned().collect();
        self.snapshot.store(Arc::new(Snapshot {
            endpoints: Arc::from(endpoints),
            invalid_after,
        }));
    }
}

/// 端点来源：均衡器从这里读取当前端点
pub trait EndpointSource<Req, Resp>: Send + Sync
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn endpoints(&self) -> Endpoints<Req, Resp>;
}

impl<Req, Resp> EndpointSource<Req, Resp> for EndpointReader<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn endpoints(&self) -> Endpoints<Req, Resp> {
        EndpointReader::endpoints(self)
    }
}

impl<Req, Resp, T> EndpointSource<Req, Resp> for Arc<T>
where
    Req: Send + 'static,
    Resp: Send + 'static,
    T: EndpointSource<Req, Resp> + ?Sized,
{
    fn endpoints(&self) -> Endpoints<Req, Resp> {
        (**self).endpoints()
    }
}

/// 端点管理器
///
/// 持有一个后台更新任务，串行处理 Instancer 的通知。
/// Drop 时停止更新任务；端点在最后一个借用者释放后才执行 release。
pub struct Endpointer<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    cache: Arc<Mutex<EndpointCache<Req, Resp>>>,
    reader: EndpointReader<Req, Resp>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<Req, Resp> Endpointer<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    /// 订阅 Instancer 并启动更新任务
    ///
    /// 返回时已经应用了 Instancer 的当前快照。
    pub fn new<F>(instancer: &Instancer, factory: F, policy: StalePolicy) -> Self
    where
        F: EndpointFactory<Req, Resp> + 'static,
    {
        let mut subscription = instancer.subscribe();
        let mut cache = EndpointCache::new(Arc::new(factory), policy);
        if let Some(initial) = subscription.take_initial() {
            cache.update(&initial);
        }

        let reader = cache.reader();
        let cache = Arc::new(Mutex::new(cache));
        let cancel = CancellationToken::new();

        let task = {
            let cache = cache.clone();
            let cancel = cancel.clone();
            let service = instancer.service().to_string();
            tokio::spawn(async move {
                loop {
                    let next = tokio::select! {
                        _ = cancel.cancelled() => break,
                        next = subscription.next() => next,
                    };
                    match next {
                        Some(set) => cache.lock().update(&set),
                        None => break,
                    }
                }
                debug!(service = %service, "Endpointer update loop exited");
            })
        };

        info!(service = %instancer.service(), policy = ?policy, "Endpointer started");

        Self {
            cache,
            reader,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    /// 当前端点
    pub fn endpoints(&self) -> Endpoints<Req, Resp> {
        self.reader.endpoints()
    }

    pub fn reader(&self) -> EndpointReader<Req, Resp> {
        self.reader.clone()
    }

    /// 端点表当前的键
    pub fn instances(&self) -> Vec<Instance> {
        self.cache.lock().instances()
    }

    /// 停止更新并释放全部端点
    pub fn close(&self) {
        self.cancel.cancel();
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.cache.lock().close();
    }
}

impl<Req, Resp> EndpointSource<Req, Resp> for Endpointer<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn endpoints(&self) -> Endpoints<Req, Resp> {
        Endpointer::endpoints(self)
    }
}

impl<Req, Resp> Drop for Endpointer<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}
