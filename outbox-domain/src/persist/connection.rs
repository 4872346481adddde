//! 连接与工作单元（Connection / UnitOfWork）
//!
//! `MessagePersistenceConnectionFactory` 屏蔽具体存储引擎，仅提供打开连接与开启工作单元。
//! 工作单元是显式传递的事务句柄：业务仓储与消息仓储在同一工作单元内写入，
//! 提交时要么全部生效、要么全部丢弃。
//!
use crate::error::DomainResult;
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// 工作单元：未提交即丢弃（Drop 等同回滚）
#[async_trait]
pub trait UnitOfWork: Send + Sized {
    async fn commit(self) -> DomainResult<()>;

    async fn rollback(self) -> DomainResult<()>;
}

/// 存储连接工厂
#[async_trait]
pub trait MessagePersistenceConnectionFactory: Send + Sync {
    type Connection: Send;
    type UnitOfWork: UnitOfWork;

    /// 打开一个存储连接（连接级瞬时故障按重试策略退避）
    async fn open_connection(&self) -> DomainResult<Self::Connection>;

    /// 开启工作单元（连接级瞬时故障按重试策略退避）
    async fn begin_unit_of_work(&self) -> DomainResult<Self::UnitOfWork>;
}

/// 瞬时故障重试策略：有界指数退避
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransientRetryPolicy {
    /// 总尝试次数（含首次）
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for TransientRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl TransientRetryPolicy {
    /// 不重试
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// 第 `attempt` 次失败后的等待时长（从 1 开始）
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.initial_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }

    /// 执行 `op`，仅对 `TransientStore` 错误退避重试，其余错误立即返回
    pub async fn retry<T, F, Fut>(&self, operation: &str, mut op: F) -> DomainResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = DomainResult<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient store failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DomainError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> TransientRetryPolicy {
        TransientRetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[test]
    fn delay_grows_and_is_capped() {
        let p = TransientRetryPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
        };
        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(200));
        assert_eq!(p.delay_for(3), Duration::from_millis(400));
        assert_eq!(p.delay_for(4), Duration::from_millis(500));
        assert_eq!(p.delay_for(40), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let out = fast_policy(5)
            .retry("open", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(DomainError::transient("connection reset"))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();

        assert_eq!(out, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn attempts_are_bounded() {
        let calls = AtomicU32::new(0);
        let err = fast_policy(3)
            .retry("open", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(DomainError::transient("down"))
            })
            .await
            .unwrap_err();

        assert!(err.is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_transient_errors_fail_fast() {
        let calls = AtomicU32::new(0);
        let err = fast_policy(5)
            .retry("open", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(DomainError::not_found("m-1"))
            })
            .await
            .unwrap_err();

        assert!(err.is_not_found());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
