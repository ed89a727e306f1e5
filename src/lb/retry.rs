//! 重试分发器
//!
//! 每次逻辑调用：通过均衡器选择端点并调用，失败后换端点重试，直到成功、
//! 达到最大尝试次数或超过整体截止时间。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::discovery::{Endpoint, Instance};
use crate::error::{BoxError, LbError, Result};
use crate::lb::balancer::Balancer;
use crate::retry::{FixedRetryPolicy, RetryPolicy};

/// 应用层失败判断：返回 `Some(reason)` 表示该响应应视为失败
pub type FailureCheck<Resp> = Arc<dyn Fn(&Resp) -> Option<String> + Send + Sync>;

/// 没有可用端点时的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmptyEndpoints {
    /// 立即返回 [`LbError::NoHealthyEndpoints`]
    #[default]
    FailFast,
    /// 等待后重新选择，计为一次尝试
    WaitAndRetry(Duration),
}

/// 单次尝试记录
#[derive(Debug, Clone)]
pub struct CallAttempt {
    pub attempt: usize,
    pub instance: Option<Instance>,
    pub outcome: std::result::Result<(), LbError>,
}

/// 重试分发器
///
/// # 幂等性
///
/// 一次逻辑调用可能被多个不同的实例处理：第一个实例执行到一半失败后，
/// 请求会被原样发送给另一个实例。非幂等请求（如扣款）经过本分发器时，
/// 调用方需要自行保证重复执行是安全的，或者把 `max_attempts` 设为 1。
pub struct Retry<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    balancer: Arc<dyn Balancer<Req, Resp>>,
    policy: Arc<dyn RetryPolicy>,
    max_elapsed: Duration,
    empty: EmptyEndpoints,
    failure_check: Option<FailureCheck<Resp>>,
}

impl<Req, Resp> Clone for Retry<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn clone(&self) -> Self {
        Self {
            balancer: self.balancer.clone(),
            policy: self.policy.clone(),
            max_elapsed: self.max_elapsed,
            empty: self.empty,
            failure_check: self.failure_check.clone(),
        }
    }
}

impl<Req, Resp> Retry<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    /// 创建分发器，失败后立即换端点重试
    pub fn new<B>(max_attempts: usize, max_elapsed: Duration, balancer: B) -> Self
    where
        B: Balancer<Req, Resp> + 'static,
    {
        Self {
            balancer: Arc::new(balancer),
            policy: Arc::new(FixedRetryPolicy::immediate(max_attempts)),
            max_elapsed,
            empty: EmptyEndpoints::default(),
            failure_check: None,
        }
    }

    /// 自定义重试策略（决定最大尝试次数、可重试错误和退避时间）
    pub fn with_policy<P>(mut self, policy: P) -> Self
    where
        P: RetryPolicy + 'static,
    {
        self.policy = Arc::new(policy);
        self
    }

    pub fn with_empty_endpoints(mut self, empty: EmptyEndpoints) -> Self {
        self.empty = empty;
        self
    }

    pub fn with_failure_check<F>(mut self, check: F) -> Self
    where
        F: Fn(&Resp) -> Option<String> + Send + Sync + 'static,
    {
        self.failure_check = Some(Arc::new(check));
        self
    }

    pub fn max_attempts(&self) -> usize {
        self.policy.max_attempts()
    }

    pub fn max_elapsed(&self) -> Duration {
        self.max_elapsed
    }

    /// 执行一次逻辑调用
    pub async fn call(&self, request: Req) -> Result<Resp>
    where
        Req: Clone,
    {
        let start = Instant::now();
        let deadline = start + self.max_elapsed;
        let max_attempts = self.policy.max_attempts();
        let mut history: Vec<CallAttempt> = Vec::new();

        loop {
            let attempt = history.len() + 1;

            let (instance, outcome) = match self.balancer.endpoint() {
                Ok(handle) => {
                    let instance = handle.instance().clone();
                    let attempt_request = request.clone();
                    let result =
                        tokio::time::timeout_at(deadline, handle.call(attempt_request)).await;
                    let outcome = match result {
                        Err(_) => Err(LbError::DeadlineExceeded(self.max_elapsed)),
                        Ok(Err(e)) => Err(LbError::AttemptFailed {
                            attempt,
                            instance: instance.to_string(),
                            reason: e.to_string(),
                        }),
                        Ok(Ok(response)) => {
                            match self.failure_check.as_ref().and_then(|check| check(&response)) {
                                Some(reason) => Err(LbError::AttemptFailed {
                                    attempt,
                                    instance: instance.to_string(),
                                    reason,
                                }),
                                None => Ok(response),
                            }
                        }
                    };
                    (Some(instance), outcome)
                }
                Err(e) => {
                    if self.empty == EmptyEndpoints::FailFast {
                        debug!(attempt, "No endpoints available, failing fast");
                        return Err(e);
                    }
                    (None, Err(e))
                }
            };

            let record = CallAttempt {
                attempt,
                instance,
                outcome: outcome.as_ref().map(|_| ()).map_err(Clone::clone),
            };
            debug!(
                attempt = record.attempt,
                instance = ?record.instance,
                outcome = ?record.outcome,
                "Call attempt finished"
            );
            history.push(record);

            let last = match outcome {
                Ok(response) => return Ok(response),
                Err(e) => e,
            };

            if attempt >= max_attempts
                || Instant::now() >= deadline
                || !self.policy.should_retry(attempt, &last)
            {
                return Err(self.exhausted(start, history, last));
            }

            let delay = match (&last, self.empty) {
                (LbError::NoHealthyEndpoints, EmptyEndpoints::WaitAndRetry(delay)) => delay,
                _ => self.policy.backoff_duration(attempt),
            };
            if !delay.is_zero() {
                tokio::time::sleep_until((Instant::now() + delay).min(deadline)).await;
                // 不在截止时间之后开始新的尝试
                if Instant::now() >= deadline {
                    return Err(self.exhausted(start, history, last));
                }
            }
        }
    }

    fn exhausted(&self, start: Instant, history: Vec<CallAttempt>, last: LbError) -> LbError {
        let elapsed = start.elapsed();
        warn!(
            attempts = history.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            error = %last,
            "Call failed after retries"
        );
        LbError::RetriesExhausted {
            attempts: history.len(),
            elapsed,
            last: Box::new(last),
        }
    }
}

#[async_trait]
impl<Req, Resp> Endpoint<Req, Resp> for Retry<Req, Resp>
where
    Req: Clone + Send + 'static,
    Resp: Send + 'static,
{
    async fn call(&self, request: Req) -> std::result::Result<Resp, BoxError> {
        Retry::call(self, request).await.map_err(Into::into)
    }
}
