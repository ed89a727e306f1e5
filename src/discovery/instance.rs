//! 服务实例与实例集合定义

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::LbError;

/// 服务实例
///
/// 一个可通过网络访问的后端进程。`host:port` 形式是其规范标识，
/// 用于集合成员判断、排序和差异计算。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Instance {
    host: String,
    port: u16,
}

impl Instance {
    /// 创建新的服务实例
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// 转换为 HTTP URL
    pub fn to_http_url(&self) -> String {
        format!("http://{}", self)
    }
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Instance {
    type Err = LbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let s = s
            .strip_prefix("http://")
            .or_else(|| s.strip_prefix("https://"))
            .unwrap_or(s);

        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| LbError::config(format!("instance '{}' is not host:port", s)))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(LbError::config(format!("instance '{}' has an empty host", s)));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| LbError::config(format!("instance '{}' has an invalid port: {}", s, e)))?;

        Ok(Instance::new(host, port))
    }
}

/// 实例集合快照
///
/// 每次注册中心变化都会整体生成一个新快照，从不原地修改。
/// 如果 `err` 存在，`instances` 为最后一次已知正常的集合。
#[derive(Debug, Clone, Default)]
pub struct InstanceSet {
    instances: Arc<BTreeSet<Instance>>,
    err: Option<Arc<LbError>>,
}

impl InstanceSet {
    /// 创建健康的实例集合
    pub fn new(instances: impl IntoIterator<Item = Instance>) -> Self {
        Self {
            instances: Arc::new(instances.into_iter().collect()),
            err: None,
        }
    }

    /// 基于最后一次正常集合生成带错误的快照
    pub fn failed(last_good: &InstanceSet, err: LbError) -> Self {
        Self {
            instances: last_good.instances.clone(),
            err: Some(Arc::new(err)),
        }
    }

    pub fn instances(&self) -> &BTreeSet<Instance> {
        &self.instances
    }

    pub fn error(&self) -> Option<&LbError> {
        self.err.as_deref()
    }

    pub fn is_err(&self) -> bool {
        self.err.is_some()
    }

    pub fn contains(&self, instance: &Instance) -> bool {
        self.instances.contains(instance)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// 实例成员是否与另一个快照相同（忽略错误标记）
    pub fn same_instances(&self, other: &InstanceSet) -> bool {
        Arc::ptr_eq(&self.instances, &other.instances) || self.instances == other.instances
    }
}
