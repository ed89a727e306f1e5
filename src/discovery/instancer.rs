//! 实例监听器
//!
//! 每个 Instancer 拥有一个后台 watch 任务，对注册中心发起长轮询，
//! 每次变化生成新的 [`InstanceSet`] 并广播给所有订阅者。
//!
//! - 订阅者通过有界广播队列解耦，队列满时丢弃最旧的更新（新鲜度优先）
//! - watch 失败时发布带错误的快照（保留最后一次正常的实例），随后指数退避重试
//! - 索引为 0 或回退时不发布，同样退避后重新查询
//! - `stop()` 返回后不会再向任何订阅者投递通知

use std::sync::Arc;
use std::time::Duration;

use async_broadcast::{InactiveReceiver, Receiver, RecvError, Sender, TrySendError};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::discovery::backend::{RegistryClient, WatchQuery};
use crate::discovery::instance::{Instance, InstanceSet};
use crate::retry::{ExponentialBackoffPolicy, RetryPolicy};

/// Instancer 配置
#[derive(Debug, Clone)]
pub struct InstancerConfig {
    /// 每个订阅者的待处理队列长度
    pub listener_buffer: usize,
    /// watch 失败后的重连退避
    pub backoff: ExponentialBackoffPolicy,
}

impl Default for InstancerConfig {
    fn default() -> Self {
        Self {
            listener_buffer: 16,
            backoff: ExponentialBackoffPolicy::default(),
        }
    }
}

struct Published {
    current: InstanceSet,
    sender: Sender<InstanceSet>,
    // 保持通道开启，没有活跃订阅者时也不会关闭
    inactive: InactiveReceiver<InstanceSet>,
}

struct Shared {
    published: Mutex<Published>,
    stopped: CancellationToken,
}

impl Shared {
    fn new(listener_buffer: usize, initial: InstanceSet) -> Self {
        let (mut sender, receiver) = async_broadcast::broadcast(listener_buffer.max(1));
        sender.set_overflow(true);

        Self {
            published: Mutex::new(Published {
                current: initial,
                sender,
                inactive: receiver.deactivate(),
            }),
            stopped: CancellationToken::new(),
        }
    }

    fn current(&self) -> InstanceSet {
        self.published.lock().current.clone()
    }

    fn subscribe(&self) -> Subscription {
        let published = self.published.lock();
        Subscription {
            initial: Some(published.current.clone()),
            receiver: published.inactive.activate_cloned(),
            stopped: self.stopped.clone(),
        }
    }

    fn publish(&self, set: InstanceSet) {
        let mut published = self.published.lock();
        published.current = set.clone();
        match published.sender.try_broadcast(set) {
            Ok(Some(_)) => debug!("Listener queue full, dropped oldest instance set"),
            Ok(None) => {}
            Err(TrySendError::Inactive(_)) => {}
            Err(TrySendError::Closed(_)) => debug!("Instance set published after close"),
            Err(TrySendError::Full(_)) => {}
        }
    }

    fn close(&self) {
        self.stopped.cancel();
        self.published.lock().sender.close();
    }
}

/// 实例集合订阅
///
/// 首先返回订阅时刻的当前快照，之后按注册中心产生的顺序返回每次更新。
pub struct Subscription {
    initial: Option<InstanceSet>,
    receiver: Receiver<InstanceSet>,
    stopped: CancellationToken,
}

impl Subscription {
    /// 等待下一个快照；Instancer 停止后返回 `None`
    pub async fn next(&mut self) -> Option<InstanceSet> {
        if self.stopped.is_cancelled() {
            return None;
        }
        if let Some(initial) = self.initial.take() {
            return Some(initial);
        }

        loop {
            let received = tokio::select! {
                biased;
                _ = self.stopped.cancelled() => return None,
                received = self.receiver.recv() => received,
            };

            match received {
                Ok(set) if !self.stopped.is_cancelled() => return Some(set),
                Ok(_) => return None,
                Err(RecvError::Overflowed(skipped)) => {
                    debug!(skipped, "Subscriber lagging, skipped stale instance sets");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// 取出订阅时刻的快照（不等待）
    pub(crate) fn take_initial(&mut self) -> Option<InstanceSet> {
        self.initial.take()
    }
}

/// 实例监听器
pub struct Instancer {
    service: String,
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Instancer {
    /// 创建并启动 watch 任务（需要在 tokio 运行时中调用）
    pub fn new(client: Arc<dyn RegistryClient>, query: WatchQuery) -> Self {
        Self::with_config(client, query, InstancerConfig::default())
    }

    pub fn with_config(
        client: Arc<dyn RegistryClient>,
        query: WatchQuery,
        config: InstancerConfig,
    ) -> Self {
        Self::start(client, query, config, InstanceSet::default(), 0)
    }

    /// 先同步查询一次注册中心再启动 watch 任务
    ///
    /// 返回时 `current()` 已经是注册中心的当前状态；首次查询失败时快照带有该错误。
    pub async fn connect(client: Arc<dyn RegistryClient>, query: WatchQuery) -> Self {
        Self::connect_with_config(client, query, InstancerConfig::default()).await
    }

    pub async fn connect_with_config(
        client: Arc<dyn RegistryClient>,
        query: WatchQuery,
        config: InstancerConfig,
    ) -> Self {
        let (initial, index) = match client.watch(&query, 0).await {
            Ok(watched) => {
                info!(
                    service = %query.service,
                    instances = watched.instances.len(),
                    index = watched.index,
                    "Initial instance set loaded"
                );
                (InstanceSet::new(watched.instances), watched.index)
            }
            Err(e) => {
                warn!(service = %query.service, error = %e, "Initial registry query failed");
                (InstanceSet::failed(&InstanceSet::default(), e), 0)
            }
        };
        Self::start(client, query, config, initial, index)
    }

    fn start(
        client: Arc<dyn RegistryClient>,
        query: WatchQuery,
        config: InstancerConfig,
        initial: InstanceSet,
        index: u64,
    ) -> Self {
        let service = query.service.clone();
        let shared = Arc::new(Shared::new(config.listener_buffer, initial));

        info!(service = %service, tags = ?query.tags, "Starting instancer watch");
        let task = tokio::spawn(watch_loop(
            client,
            query,
            config.backoff,
            shared.clone(),
            index,
        ));

        Self {
            service,
            shared,
            task: Mutex::new(Some(task)),
        }
    }

    /// 固定实例集合，不访问注册中心
    pub fn fixed(service: impl Into<String>, instances: impl IntoIterator<Item = Instance>) -> Self {
        Self {
            service: service.into(),
            shared: Arc::new(Shared::new(1, InstanceSet::new(instances))),
            task: Mutex::new(None),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// 当前快照
    pub fn current(&self) -> InstanceSet {
        self.shared.current()
    }

    /// 订阅快照变化
    pub fn subscribe(&self) -> Subscription {
        self.shared.subscribe()
    }

    /// 停止 watch 并释放所有订阅
    pub async fn stop(&self) {
        self.shared.close();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(service = %self.service, error = %e, "Instancer watch task failed");
                }
            }
            info!(service = %self.service, "Instancer stopped");
        }
    }
}

impl Drop for Instancer {
    fn drop(&mut self) {
        self.shared.close();
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

async fn watch_loop(
    client: Arc<dyn RegistryClient>,
    query: WatchQuery,
    backoff: ExponentialBackoffPolicy,
    shared: Arc<Shared>,
    mut index: u64,
) {
    let mut failures = 0usize;

    loop {
        let result = tokio::select! {
            _ = shared.stopped.cancelled() => break,
            result = client.watch(&query, index) => result,
        };

        match result {
            Ok(watched) if watched.index == 0 => {
                // 索引为 0 说明响应不可信，不发布，退避后重新查询
                warn!(service = %query.service, "Registry returned zero watch index");
            }
            Ok(watched) if watched.index < index => {
                warn!(
                    service = %query.service,
                    previous = index,
                    index = watched.index,
                    "Watch index went backwards, resetting"
                );
                index = 0;
            }
            Ok(watched) => {
                failures = 0;
                index = watched.index;

                let current = shared.current();
                let next = InstanceSet::new(watched.instances);
                if current.is_err() || !current.same_instances(&next) {
                    debug!(
                        service = %query.service,
                        index,
                        instances = next.len(),
                        "Instance set changed"
                    );
                    shared.publish(next);
                }
                continue;
            }
            Err(e) => {
                warn!(service = %query.service, error = %e, "Registry watch failed");
                let current = shared.current();
                shared.publish(InstanceSet::failed(&current, e));
                index = 0;
            }
        }

        let delay: Duration = backoff.backoff_duration(failures);
        failures = failures.saturating_add(1);

        tokio::select! {
            _ = shared.stopped.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    debug!(service = %query.service, "Instancer watch loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::discovery::backend::{MemoryRegistry, WatchResult};
    use crate::discovery::registrar::Registration;
    use crate::error::{LbError, Result};

    /// 按脚本返回 watch 结果，脚本用完后一直阻塞
    #[derive(Default)]
    struct ScriptedRegistry {
        script: Mutex<VecDeque<WatchResult>>,
        /// 为 true 时每次都返回索引 0
        zero_index: bool,
        seen_indexes: Mutex<Vec<u64>>,
        calls: AtomicUsize,
    }

    impl ScriptedRegistry {
        fn with_script(script: Vec<(u64, &str)>) -> Self {
            Self {
                script: Mutex::new(
                    script
                        .into_iter()
                        .map(|(index, host)| WatchResult {
                            instances: vec![Instance::new(host, 1)],
                            index,
                        })
                        .collect(),
                ),
                ..Self::default()
            }
        }

        fn zero_index() -> Self {
            Self {
                zero_index: true,
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl RegistryClient for ScriptedRegistry {
        async fn watch(&self, _query: &WatchQuery, last_index: u64) -> Result<WatchResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen_indexes.lock().push(last_index);
            if self.zero_index {
                return Ok(WatchResult {
                    instances: vec![Instance::new("a", 1)],
                    index: 0,
                });
            }
            let next = self.script.lock().pop_front();
            match next {
                Some(result) => Ok(result),
                None => std::future::pending().await,
            }
        }

        async fn register(&self, _registration: &Registration) -> Result<()> {
            Ok(())
        }

        async fn deregister(&self, _id: &str) -> Result<()> {
            Ok(())
        }
    }

    fn query() -> WatchQuery {
        WatchQuery::new("svc").with_wait(Duration::from_millis(100))
    }

    async fn next_matching(
        subscription: &mut Subscription,
        pred: impl Fn(&InstanceSet) -> bool,
    ) -> InstanceSet {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let set = subscription.next().await.expect("subscription closed");
                if pred(&set) {
                    return set;
                }
            }
        })
        .await
        .expect("timed out waiting for instance set")
    }

    #[tokio::test]
    async fn test_publishes_registry_changes() {
        let registry = Arc::new(MemoryRegistry::new());
        registry
            .register(&Registration::new("svc", "a", 1))
            .await
            .unwrap();

        let instancer = Instancer::new(registry.clone(), query());
        let mut subscription = instancer.subscribe();

        let set = next_matching(&mut subscription, |s| s.len() == 1).await;
        assert!(set.contains(&Instance::new("a", 1)));

        registry
            .register(&Registration::new("svc", "b", 2))
            .await
            .unwrap();
        let set = next_matching(&mut subscription, |s| s.len() == 2).await;
        assert!(set.contains(&Instance::new("b", 2)));
        assert_eq!(instancer.current().len(), 2);

        instancer.stop().await;
    }

    #[tokio::test]
    async fn test_registry_failure_keeps_last_good_instances() {
        let registry = Arc::new(MemoryRegistry::new());
        registry
            .register(&Registration::new("svc", "a", 1))
            .await
            .unwrap();

        let instancer = Instancer::new(registry.clone(), query());
        let mut subscription = instancer.subscribe();
        next_matching(&mut subscription, |s| s.len() == 1).await;

        registry.set_available(false).await;
        let failed = next_matching(&mut subscription, |s| s.is_err()).await;
        assert!(matches!(failed.error(), Some(LbError::RegistryUnavailable(_))));
        assert!(failed.contains(&Instance::new("a", 1)));

        registry.set_available(true).await;
        let recovered = next_matching(&mut subscription, |s| !s.is_err()).await;
        assert!(recovered.contains(&Instance::new("a", 1)));

        instancer.stop().await;
    }

    #[tokio::test]
    async fn test_no_notifications_after_stop() {
        let registry = Arc::new(MemoryRegistry::new());
        let instancer = Instancer::new(registry.clone(), query());
        let mut subscription = instancer.subscribe();

        instancer.stop().await;
        registry
            .register(&Registration::new("svc", "a", 1))
            .await
            .unwrap();

        assert!(subscription.next().await.is_none());
        assert!(instancer.subscribe().next().await.is_none());
    }

    #[tokio::test]
    async fn test_full_queue_drops_oldest() {
        let shared = Shared::new(2, InstanceSet::default());
        let mut subscription = shared.subscribe();
        assert!(subscription.next().await.unwrap().is_empty());

        for port in 1..=5 {
            shared.publish(InstanceSet::new(vec![Instance::new("a", port)]));
        }

        let first = subscription.next().await.unwrap();
        let second = subscription.next().await.unwrap();
        assert!(first.contains(&Instance::new("a", 4)));
        assert!(second.contains(&Instance::new("a", 5)));
    }

    #[tokio::test]
    async fn test_fixed_instancer() {
        let instancer = Instancer::fixed("svc", vec![Instance::new("a", 1), Instance::new("b", 1)]);
        let mut subscription = instancer.subscribe();
        assert_eq!(subscription.next().await.unwrap().len(), 2);
        assert_eq!(instancer.service(), "svc");
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_index_is_ignored_and_backed_off() {
        let registry = Arc::new(ScriptedRegistry::zero_index());
        let instancer = Instancer::new(registry.clone(), query());

        tokio::time::sleep(Duration::from_millis(100)).await;

        // 10ms 起步的指数退避：100ms 内最多 5 次查询
        let calls = registry.calls.load(Ordering::SeqCst);
        assert!(calls >= 1 && calls <= 5, "watch called {calls} times");
        assert!(instancer.current().is_empty());
        instancer.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_backwards_index_resets_without_publishing() {
        let registry = Arc::new(ScriptedRegistry::with_script(vec![
            (5, "a"),
            (3, "b"),
            (6, "c"),
        ]));
        let instancer = Instancer::new(registry.clone(), query());
        let mut subscription = instancer.subscribe();

        let first = next_matching(&mut subscription, |s| !s.is_empty()).await;
        assert!(first.contains(&Instance::new("a", 1)));
        let second = next_matching(&mut subscription, |s| !s.is_empty()).await;
        assert!(second.contains(&Instance::new("c", 1)));

        assert_eq!(*registry.seen_indexes.lock(), vec![0, 5, 0, 6]);
        instancer.stop().await;
    }

    #[tokio::test]
    async fn test_connect_loads_instances_before_returning() {
        let registry = Arc::new(MemoryRegistry::new());
        registry
            .register(&Registration::new("svc", "a", 1))
            .await
            .unwrap();

        let instancer = Instancer::connect(registry.clone(), query()).await;
        let current = instancer.current();
        assert!(!current.is_err());
        assert!(current.contains(&Instance::new("a", 1)));

        // 之后的变化照常通过 watch 任务发布
        let mut subscription = instancer.subscribe();
        registry
            .register(&Registration::new("svc", "b", 2))
            .await
            .unwrap();
        next_matching(&mut subscription, |s| s.len() == 2).await;
        instancer.stop().await;
    }

    #[tokio::test]
    async fn test_connect_records_initial_failure() {
        let registry = Arc::new(MemoryRegistry::new());
        registry.set_available(false).await;

        let instancer = Instancer::connect(registry.clone(), query()).await;
        let current = instancer.current();
        assert!(current.is_empty());
        assert!(matches!(current.error(), Some(LbError::RegistryUnavailable(_))));

        registry.set_available(true).await;
        let mut subscription = instancer.subscribe();
        next_matching(&mut subscription, |s| !s.is_err()).await;
        instancer.stop().await;
    }
}
