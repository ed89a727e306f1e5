//! 内存注册中心
//!
//! 进程内实现，具备与 Consul 相同的长轮询语义，用于测试和本地运行。
//! 索引是全局的：任何服务的变化都会唤醒所有 watch。

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use tokio::sync::{RwLock, watch};
use tracing::debug;

use super::{RegistryClient, WatchQuery, WatchResult};
use crate::discovery::instance::Instance;
use crate::discovery::registrar::Registration;
use crate::error::{LbError, Result};

struct State {
    index: u64,
    available: bool,
    services: BTreeMap<String, Registration>,
    critical: HashSet<String>,
}

impl State {
    fn bump(&mut self) -> u64 {
        self.index += 1;
        self.index
    }

    fn result_for(&self, query: &WatchQuery) -> WatchResult {
        let instances = self
            .services
            .values()
            .filter(|reg| reg.service_name == query.service)
            .filter(|reg| !query.passing_only || !self.critical.contains(&reg.id))
            .filter(|reg| query.tags.iter().all(|tag| reg.tags.contains(tag)))
            .map(|reg| Instance::new(reg.address.clone(), reg.port))
            .collect();

        WatchResult {
            instances,
            index: self.index,
        }
    }
}

/// 内存注册中心
pub struct MemoryRegistry {
    state: RwLock<State>,
    changed: watch::Sender<u64>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        let (changed, _) = watch::channel(1);
        Self {
            state: RwLock::new(State {
                index: 1,
                available: true,
                services: BTreeMap::new(),
                critical: HashSet::new(),
            }),
            changed,
        }
    }

    /// 模拟注册中心不可用 / 恢复
    pub async fn set_available(&self, available: bool) {
        let mut state = self.state.write().await;
        state.available = available;
        let index = state.bump();
        self.changed.send_replace(index);
    }

    /// 模拟健康检查结果
    pub async fn set_passing(&self, id: &str, passing: bool) {
        let mut state = self.state.write().await;
        let updated = if passing {
            state.critical.remove(id)
        } else {
            state.critical.insert(id.to_string())
        };
        if updated {
            let index = state.bump();
            self.changed.send_replace(index);
        }
    }

    /// 当前注册的实例 ID
    pub async fn registered_ids(&self) -> Vec<String> {
        let state = self.state.read().await;
        state.services.keys().cloned().collect()
    }

    pub async fn contains(&self, id: &str) -> bool {
        let state = self.state.read().await;
        state.services.contains_key(id)
    }

    pub async fn index(&self) -> u64 {
        self.state.read().await.index
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RegistryClient for MemoryRegistry {
    async fn watch(&self, query: &WatchQuery, last_index: u64) -> Result<WatchResult> {
        // 先订阅再读状态，避免漏掉两者之间的变化
        let mut changed = self.changed.subscribe();
        loop {
            {
                let state = self.state.read().await;
                if !state.available {
                    return Err(LbError::registry_unavailable("memory registry is unavailable"));
                }
                if state.index != last_index {
                    return Ok(state.result_for(query));
                }
            }

            match tokio::time::timeout(query.wait, changed.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => {
                    return Err(LbError::registry_unavailable("memory registry closed"));
                }
                Err(_) => {
                    let state = self.state.read().await;
                    if !state.available {
                        return Err(LbError::registry_unavailable(
                            "memory registry is unavailable",
                        ));
                    }
                    return Ok(state.result_for(query));
                }
            }
        }
    }

    async fn register(&self, registration: &Registration) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.available {
            return Err(LbError::registry_unavailable("memory registry is unavailable"));
        }
        state
            .services
            .insert(registration.id.clone(), registration.clone());
        let index = state.bump();
        self.changed.send_replace(index);
        debug!(instance_id = %registration.id, index, "Registered in memory registry");
        Ok(())
    }

    async fn deregister(&self, id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.available {
            return Err(LbError::registry_unavailable("memory registry is unavailable"));
        }
        state.critical.remove(id);
        if state.services.remove(id).is_some() {
            let index = state.bump();
            self.changed.send_replace(index);
            debug!(instance_id = %id, index, "Deregistered from memory registry");
        }
        Ok(())
    }
}
