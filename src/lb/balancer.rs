//! 负载均衡器
//!
//! 每次调用从端点来源的当前快照中选出一个端点。端点列表在两次选择之间可以
//! 增长或缩小，下标总是对选择时刻的长度取模。

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::discovery::{EndpointHandle, EndpointSource};
use crate::error::{LbError, Result};

/// 负载均衡器 trait
pub trait Balancer<Req, Resp>: Send + Sync
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    /// 选择一个端点；没有端点时返回 [`LbError::NoHealthyEndpoints`]
    fn endpoint(&self) -> Result<Arc<EndpointHandle<Req, Resp>>>;
}

/// 负载均衡策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    /// 轮询（Round Robin）
    #[default]
    RoundRobin,
    /// 随机（Random）
    Random,
}

impl FromStr for LoadBalanceStrategy {
    type Err = LbError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "round_robin" | "roundrobin" => Ok(Self::RoundRobin),
            "random" => Ok(Self::Random),
            other => Err(LbError::config(format!("unknown load balance strategy '{}'", other))),
        }
    }
}

impl fmt::Display for LoadBalanceStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RoundRobin => f.write_str("round_robin"),
            Self::Random => f.write_str("random"),
        }
    }
}

impl LoadBalanceStrategy {
    /// 按策略构建均衡器
    pub fn build<Req, Resp, S>(self, source: S) -> Arc<dyn Balancer<Req, Resp>>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        S: EndpointSource<Req, Resp> + 'static,
    {
        match self {
            Self::RoundRobin => Arc::new(RoundRobin::new(source)),
            Self::Random => Arc::new(Random::new(source)),
        }
    }
}

/// 轮询均衡器
///
/// 计数器原子递增，并发选择时只保证下标合法，公平性尽力而为。
pub struct RoundRobin<S> {
    source: S,
    counter: AtomicU64,
}

impl<S> RoundRobin<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            counter: AtomicU64::new(0),
        }
    }

    /// 从给定列表中选择下一个元素
    pub fn pick<T: Clone>(&self, items: &[T]) -> Result<T> {
        if items.is_empty() {
            return Err(LbError::NoHealthyEndpoints);
        }
        let index = self.counter.fetch_add(1, Ordering::Relaxed);
        Ok(items[(index % items.len() as u64) as usize].clone())
    }
}

impl<Req, Resp, S> Balancer<Req, Resp> for RoundRobin<S>
where
    Req: Send + 'static,
    Resp: Send + 'static,
    S: EndpointSource<Req, Resp>,
{
    fn endpoint(&self) -> Result<Arc<EndpointHandle<Req, Resp>>> {
        let endpoints = self.source.endpoints();
        self.pick(&endpoints)
    }
}

/// 随机均衡器
pub struct Random<S> {
    source: S,
    rng: Option<Mutex<StdRng>>,
}

impl<S> Random<S> {
    pub fn new(source: S) -> Self {
        Self { source, rng: None }
    }

    /// 使用固定种子，结果可复现
    pub fn with_seed(source: S, seed: u64) -> Self {
        Self {
            source,
            rng: Some(Mutex::new(StdRng::seed_from_u64(seed))),
        }
    }

    pub fn pick<T: Clone>(&self, items: &[T]) -> Result<T> {
        if items.is_empty() {
            return Err(LbError::NoHealthyEndpoints);
        }
        let index = match &self.rng {
            Some(rng) => rng.lock().gen_range(0..items.len()),
            None => rand::thread_rng().gen_range(0..items.len()),
        };
        Ok(items[index].clone())
    }
}

impl<Req, Resp, S> Balancer<Req, Resp> for Random<S>
where
    Req: Send + 'static,
    Resp: Send + 'static,
    S: EndpointSource<Req, Resp>,
{
    fn endpoint(&self) -> Result<Arc<EndpointHandle<Req, Resp>>> {
        let endpoints = self.source.endpoints();
        self.pick(&endpoints)
    }
}

/// 持有 Balancer 的通用包装，便于在泛型边界中使用 `Arc<dyn Balancer>`
impl<Req, Resp, B> Balancer<Req, Resp> for Arc<B>
where
    Req: Send + 'static,
    Resp: Send + 'static,
    B: Balancer<Req, Resp> + ?Sized,
{
    fn endpoint(&self) -> Result<Arc<EndpointHandle<Req, Resp>>> {
        (**self).endpoint()
    }
}

/// 静态端点列表，主要用于测试和固定拓扑
pub struct StaticEndpoints<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    endpoints: Arc<[Arc<EndpointHandle<Req, Resp>>]>,
}

impl<Req, Resp> StaticEndpoints<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    pub fn new(endpoints: Vec<Arc<EndpointHandle<Req, Resp>>>) -> Self {
        Self {
            endpoints: Arc::from(endpoints),
        }
    }
}

impl<Req, Resp> EndpointSource<Req, Resp> for StaticEndpoints<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn endpoints(&self) -> Arc<[Arc<EndpointHandle<Req, Resp>>]> {
        self.endpoints.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{Endpoint, FnEndpoint, Instance};
    use crate::error::BoxError;
    use std::collections::HashMap;

    fn handle(name: &str) -> Arc<EndpointHandle<(), String>> {
        let name = name.to_string();
        let reply = name.clone();
        let endpoint: Arc<dyn Endpoint<(), String>> = Arc::new(FnEndpoint::new(move |_: ()| {
            let reply = reply.clone();
            async move { Ok::<_, BoxError>(reply) }
        }));
        Arc::new(EndpointHandle::new(Instance::new(name, 80), endpoint, None))
    }

    fn handles(names: &[&str]) -> Vec<Arc<EndpointHandle<(), String>>> {
        names.iter().map(|name| handle(name)).collect()
    }

    #[test]
    fn test_round_robin_order() {
        let balancer = RoundRobin::new(StaticEndpoints::new(handles(&["a", "b", "c"])));
        let picked: Vec<String> = (0..6)
            .map(|_| balancer.endpoint().unwrap().instance().host().to_string())
            .collect();
        assert_eq!(picked, vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn test_round_robin_fairness() {
        let balancer = RoundRobin::new(StaticEndpoints::new(handles(&["a", "b", "c", "d"])));
        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..1003 {
            let picked = balancer.endpoint().unwrap();
            *counts.entry(picked.instance().host().to_string()).or_default() += 1;
        }

        // 1003 = 4 * 250 + 3，前三个多选一次
        assert_eq!(counts["a"], 251);
        assert_eq!(counts["b"], 251);
        assert_eq!(counts["c"], 251);
        assert_eq!(counts["d"], 250);
    }

    #[test]
    fn test_empty_pick_fails_fast() {
        let balancer = RoundRobin::new(StaticEndpoints::<(), String>::new(Vec::new()));
        assert_eq!(balancer.endpoint().unwrap_err(), LbError::NoHealthyEndpoints);

        let balancer = Random::new(StaticEndpoints::<(), String>::new(Vec::new()));
        assert_eq!(balancer.endpoint().unwrap_err(), LbError::NoHealthyEndpoints);
    }

    #[test]
    fn test_round_robin_tolerates_resizing() {
        let balancer = RoundRobin::new(());
        let long = vec![1, 2, 3, 4, 5];
        let short = vec![7];

        for _ in 0..4 {
            balancer.pick(&long).unwrap();
        }
        // 计数器为 4，新列表长度为 1
        assert_eq!(balancer.pick(&short).unwrap(), 7);
        assert_eq!(balancer.pick(&[8, 9]).unwrap(), 8);
    }

    #[test]
    fn test_seeded_random_stays_in_range() {
        let balancer = Random::with_seed(StaticEndpoints::new(handles(&["a", "b"])), 42);
        let mut seen: HashMap<String, usize> = HashMap::new();
        for _ in 0..200 {
            let picked = balancer.endpoint().unwrap();
            *seen.entry(picked.instance().host().to_string()).or_default() += 1;
        }
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn test_strategy_from_str() {
        assert_eq!(
            "round-robin".parse::<LoadBalanceStrategy>().unwrap(),
            LoadBalanceStrategy::RoundRobin
        );
        assert_eq!(
            "Random".parse::<LoadBalanceStrategy>().unwrap(),
            LoadBalanceStrategy::Random
        );
        assert!("least_conn".parse::<LoadBalanceStrategy>().is_err());
        assert_eq!(LoadBalanceStrategy::RoundRobin.to_string(), "round_robin");
    }

    #[tokio::test]
    async fn test_built_balancer_invokes_endpoint() {
        let balancer: Arc<dyn Balancer<(), String>> =
            LoadBalanceStrategy::RoundRobin.build(StaticEndpoints::new(handles(&["a", "b"])));
        let first = balancer.endpoint().unwrap();
        assert_eq!(first.call(()).await.unwrap(), "a");
    }
}
