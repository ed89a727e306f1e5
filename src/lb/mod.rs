//! 负载均衡与重试分发

pub mod balancer;
pub mod retry;

pub use balancer::{Balancer, LoadBalanceStrategy, Random, RoundRobin, StaticEndpoints};
pub use retry::{CallAttempt, EmptyEndpoints, FailureCheck, Retry};
