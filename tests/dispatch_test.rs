//! 服务发现 → 端点 → 均衡 → 重试 的端到端测试（内存注册中心）

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;

use lb_dispatch::discovery::{
    Closer, Created, Endpoint, Endpointer, FnEndpoint, Instance, Instancer, MemoryRegistry,
    Registration, RegistryClient, StalePolicy, WatchQuery,
};
use lb_dispatch::error::{BoxError, LbError};
use lb_dispatch::lb::{Retry, RoundRobin};

/// 每个实例的释放次数
type Released = Arc<Mutex<HashMap<String, usize>>>;

struct Cluster {
    registry: Arc<MemoryRegistry>,
    instancer: Instancer,
    released: Released,
}

impl Cluster {
    fn new() -> Self {
        let registry = Arc::new(MemoryRegistry::new());
        let query = WatchQuery::new("stringsvc").with_wait(Duration::from_millis(200));
        let instancer = Instancer::new(registry.clone(), query);
        Self {
            registry,
            instancer,
            released: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn register(&self, host: &str) {
        self.registry
            .register(&Registration::new("stringsvc", host, 80))
            .await
            .unwrap();
    }

    async fn deregister(&self, host: &str) {
        self.registry.deregister(&format!("{}:80", host)).await.unwrap();
    }

    fn released(&self, host: &str) -> usize {
        self.released
            .lock()
            .get(&format!("{}:80", host))
            .copied()
            .unwrap_or(0)
    }

    /// 端点返回实例名；主机名以 `bad` 开头的实例总是失败，`slow` 开头的延迟 200ms
    fn endpointer(&self) -> Arc<Endpointer<String, String>> {
        let released = self.released.clone();
        Arc::new(Endpointer::new(
            &self.instancer,
            move |instance: &Instance| -> Result<Created<String, String>, BoxError> {
                let name = instance.to_string();
                let host = instance.host().to_string();
                let endpoint: Arc<dyn Endpoint<String, String>> =
                    Arc::new(FnEndpoint::new(move |_req: String| {
                        let name = name.clone();
                        let host = host.clone();
                        async move {
                            if host.starts_with("bad") {
                                return Err::<String, BoxError>("connection refused".into());
                            }
                            if host.starts_with("slow") {
                                tokio::time::sleep(Duration::from_millis(200)).await;
                            }
                            Ok(name)
                        }
                    }));

                let released = released.clone();
                let key = instance.to_string();
                let closer: Box<dyn Closer> = Box::new(move || {
                    *released.lock().entry(key.clone()).or_insert(0) += 1;
                });
                Ok((endpoint, Some(closer)))
            },
            StalePolicy::ServeStale,
        ))
    }
}

async fn wait_for_instances(endpointer: &Endpointer<String, String>, expected: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while endpointer.endpoints().len() != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("endpointer did not converge");
}

fn dispatcher(endpointer: &Arc<Endpointer<String, String>>) -> Retry<String, String> {
    Retry::new(3, Duration::from_secs(3), RoundRobin::new(endpointer.clone()))
}

#[tokio::test]
async fn test_round_robin_over_registered_instances() {
    let cluster = Cluster::new();
    for host in ["a", "b", "c"] {
        cluster.register(host).await;
    }
    let endpointer = cluster.endpointer();
    wait_for_instances(&endpointer, 3).await;

    let retry = dispatcher(&endpointer);
    let mut hits: HashMap<String, usize> = HashMap::new();
    for _ in 0..6 {
        let name = retry.call("hi".to_string()).await.unwrap();
        *hits.entry(name).or_insert(0) += 1;
    }

    assert_eq!(hits.len(), 3);
    assert!(hits.values().all(|&n| n == 2));
}

#[tokio::test]
async fn test_failing_instance_is_retried_on_next() {
    let cluster = Cluster::new();
    cluster.register("bad").await;
    cluster.register("good").await;
    let endpointer = cluster.endpointer();
    wait_for_instances(&endpointer, 2).await;

    let retry = dispatcher(&endpointer);
    for _ in 0..4 {
        assert_eq!(retry.call("hi".to_string()).await.unwrap(), "good:80");
    }
}

#[tokio::test]
async fn test_all_instances_failing_exhausts_attempts() {
    let cluster = Cluster::new();
    cluster.register("bad-1").await;
    cluster.register("bad-2").await;
    let endpointer = cluster.endpointer();
    wait_for_instances(&endpointer, 2).await;

    let err = dispatcher(&endpointer)
        .call("hi".to_string())
        .await
        .unwrap_err();
    match err {
        LbError::RetriesExhausted { attempts, last, .. } => {
            assert_eq!(attempts, 3);
            assert!(matches!(*last, LbError::AttemptFailed { attempt: 3, .. }));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_deregistered_instance_is_released() {
    let cluster = Cluster::new();
    cluster.register("a").await;
    cluster.register("b").await;
    let endpointer = cluster.endpointer();
    wait_for_instances(&endpointer, 2).await;

    cluster.deregister("b").await;
    wait_for_instances(&endpointer, 1).await;

    assert_eq!(endpointer.instances(), vec![Instance::new("a", 80)]);
    assert_eq!(cluster.released("a"), 0);
    assert_eq!(cluster.released("b"), 1);

    let retry = dispatcher(&endpointer);
    assert_eq!(retry.call("hi".to_string()).await.unwrap(), "a:80");
}

#[tokio::test]
async fn test_in_flight_call_survives_removal() {
    let cluster = Cluster::new();
    cluster.register("slow").await;
    let endpointer = cluster.endpointer();
    wait_for_instances(&endpointer, 1).await;

    let retry = dispatcher(&endpointer);
    let in_flight = tokio::spawn(async move { retry.call("hi".to_string()).await });

    tokio::time::sleep(Duration::from_millis(20)).await;
    cluster.deregister("slow").await;
    wait_for_instances(&endpointer, 0).await;

    // 调用仍持有端点，释放要等到调用结束
    assert_eq!(cluster.released("slow"), 0);
    assert_eq!(in_flight.await.unwrap().unwrap(), "slow:80");
    assert_eq!(cluster.released("slow"), 1);
}

#[tokio::test]
async fn test_registry_outage_serves_last_known_endpoints() {
    let cluster = Cluster::new();
    cluster.register("a").await;
    let endpointer = cluster.endpointer();
    wait_for_instances(&endpointer, 1).await;

    cluster.registry.set_available(false).await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cluster.instancer.current().is_err() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let retry = dispatcher(&endpointer);
    assert_eq!(retry.call("hi".to_string()).await.unwrap(), "a:80");
    assert_eq!(cluster.released("a"), 0);
}

#[tokio::test]
async fn test_concurrent_calls_share_endpoints() {
    let cluster = Cluster::new();
    for host in ["a", "b", "c"] {
        cluster.register(host).await;
    }
    let endpointer = cluster.endpointer();
    wait_for_instances(&endpointer, 3).await;

    let retry = Arc::new(dispatcher(&endpointer));
    let calls = Arc::new(AtomicUsize::new(0));
    let results = join_all((0..30).map(|i| {
        let retry = retry.clone();
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            retry.call(format!("req-{i}")).await
        }
    }))
    .await;

    assert_eq!(calls.load(Ordering::SeqCst), 30);
    assert!(results.iter().all(|r| r.is_ok()));

    let mut hits: HashMap<String, usize> = HashMap::new();
    for name in results.into_iter().flatten() {
        *hits.entry(name).or_insert(0) += 1;
    }
    assert_eq!(hits.values().sum::<usize>(), 30);
    assert_eq!(hits.len(), 3);
}

#[tokio::test]
async fn test_first_call_after_connect_is_served() {
    let registry = Arc::new(MemoryRegistry::new());
    registry
        .register(&Registration::new("stringsvc", "a", 80))
        .await
        .unwrap();

    let query = WatchQuery::new("stringsvc").with_wait(Duration::from_millis(200));
    let instancer = Instancer::connect(registry.clone(), query).await;
    let endpointer = Arc::new(Endpointer::new(
        &instancer,
        |instance: &Instance| -> Result<Created<String, String>, BoxError> {
            let name = instance.to_string();
            let endpoint: Arc<dyn Endpoint<String, String>> =
                Arc::new(FnEndpoint::new(move |_req: String| {
                    let name = name.clone();
                    async move { Ok::<_, BoxError>(name) }
                }));
            Ok((endpoint, None))
        },
        StalePolicy::ServeStale,
    ));

    // 不等待 watch 任务，第一次调用就能找到实例
    assert_eq!(endpointer.endpoints().len(), 1);
    assert_eq!(dispatcher(&endpointer).call("hi".to_string()).await.unwrap(), "a:80");
    instancer.stop().await;
}
