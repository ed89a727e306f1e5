//! 服务运行时
//!
//! 统一管理服务端生命周期：启动、就绪检查、注册、等待关闭信号、优雅停机、注销。
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use lb_dispatch::discovery::{MemoryRegistry, Registrar, Registration};
//! use lb_dispatch::runtime::ServiceRuntime;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let registry = Arc::new(MemoryRegistry::new());
//! let registrar = Registrar::new(registry, Registration::new("stringsvc", "127.0.0.1", 8080));
//!
//! ServiceRuntime::new("stringsvc", "127.0.0.1:8080".parse()?)
//!     .run_with_registration(&registrar, |shutdown| async move {
//!         shutdown.cancelled().await;
//!         Ok(())
//!     })
//!     .await
//! # }
//! ```

pub mod config;
pub mod runtime;

pub use config::RuntimeConfig;
pub use runtime::{ServiceRuntime, shutdown_signal};
