//! 服务发现模块
//!
//! 数据流：注册中心 → [`Instancer`] → [`Endpointer`] → 均衡器。
//! [`Registrar`] 独立运行，把本进程注册到注册中心供其他进程发现。

pub mod backend;
pub mod endpointer;
pub mod factory;
pub mod instance;
pub mod instancer;
pub mod registrar;

pub use backend::{ConsulRegistry, MemoryRegistry, RegistryClient, WatchQuery, WatchResult};
pub use endpointer::{EndpointCache, EndpointReader, EndpointSource, Endpointer, Endpoints, StalePolicy};
pub use factory::{Closer, Created, Endpoint, EndpointFactory, EndpointHandle, FnEndpoint};
pub use instance::{Instance, InstanceSet};
pub use instancer::{Instancer, InstancerConfig, Subscription};
pub use registrar::{HealthCheck, Registrar, Registration};
