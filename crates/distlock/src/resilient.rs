//! 基础设施故障重试装饰器
//!
//! 锁实现本身遇到存储故障会立即返回 `StoreUnavailable`。
//! 本装饰器在这一层按独立的重试策略重新执行整次获取，
//! 与"锁被占用"的竞争重试（调用方传入的策略）互不干扰。

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{LockError, Result};
use crate::factory::LockFactory;
use crate::handle::LockHandle;
use crate::retry::{RetryPolicy, sleep_or_cancel};

/// 存储故障时按策略重试的锁工厂
#[derive(Debug, Clone)]
pub struct ResilientLockFactory<F> {
    inner: F,
    policy: RetryPolicy,
}

impl<F: LockFactory> ResilientLockFactory<F> {
    pub fn new(inner: F, policy: RetryPolicy) -> Result<Self> {
        policy.validate()?;
        Ok(Self { inner, policy })
    }

    pub fn inner(&self) -> &F {
        &self.inner
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl<F: LockFactory> LockFactory for ResilientLockFactory<F> {
    async fn acquire(
        &self,
        key: &str,
        ttl: Duration,
        retry: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<LockHandle> {
        let mut scheduler = self.policy.scheduler();

        loop {
            let err = match self.inner.acquire(key, ttl, retry, cancel).await {
                Ok(handle) => {
                    if scheduler.retries() > 0 {
                        info!(lock_key = key, attempt = scheduler.retries(), "获取锁在重试后成功");
                    }
                    return Ok(handle);
                }
                Err(err) => err,
            };

            if !err.is_retryable() {
                return Err(err);
            }

            let Some(delay) = scheduler.next_delay() else {
                warn!(
                    lock_key = key,
                    max_retries = self.policy.max_retries,
                    error = %err,
                    "已达最大重试次数，放弃重试"
                );
                return Err(err);
            };

            warn!(
                lock_key = key,
                attempt = scheduler.retries(),
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "锁存储不可用，将在退避后重试"
            );

            if !sleep_or_cancel(delay, cancel).await {
                return Err(LockError::Cancelled {
                    key: key.to_string(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::single::SingleStoreLock;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_store_recovers() {
        let store = Arc::new(MemoryStore::default());
        store.set_unavailable(true);
        let factory = ResilientLockFactory::new(
            SingleStoreLock::new(store.clone()),
            RetryPolicy::constant(5, Duration::from_millis(200)),
        )
        .unwrap();

        let recover = {
            let store = store.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                store.set_unavailable(false);
            })
        };

        let mut handle = factory
            .try_acquire("orders", Duration::from_secs(5))
            .await
            .unwrap();
        recover.await.unwrap();

        assert!(handle.is_acquired());
        // 0ms、200ms、400ms 失败，600ms 成功
        assert_eq!(store.set_if_absent_calls(), 4);
        handle.release().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_policy_exhausted() {
        let store = Arc::new(MemoryStore::default());
        store.set_unavailable(true);
        let factory = ResilientLockFactory::new(
            SingleStoreLock::new(store.clone()),
            RetryPolicy::constant(2, Duration::from_millis(10)),
        )
        .unwrap();

        let err = factory
            .try_acquire("orders", Duration::from_secs(5))
            .await
            .unwrap_err();

        assert!(err.is_store_unavailable());
        assert_eq!(store.set_if_absent_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_contention_is_not_an_infrastructure_retry() {
        let store = Arc::new(MemoryStore::default());
        store.put("orders", "someone-else", Duration::from_secs(60));
        let factory = ResilientLockFactory::new(
            SingleStoreLock::new(store.clone()),
            RetryPolicy::constant(5, Duration::from_millis(10)),
        )
        .unwrap();

        let handle = factory
            .try_acquire("orders", Duration::from_secs(5))
            .await
            .unwrap();

        assert!(!handle.is_acquired());
        assert_eq!(store.set_if_absent_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let store = Arc::new(MemoryStore::default());
        store.set_unavailable(true);
        let factory = ResilientLockFactory::new(
            SingleStoreLock::new(store.clone()),
            RetryPolicy::constant(10, Duration::from_secs(1)),
        )
        .unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1_500)).await;
            trigger.cancel();
        });

        let err = factory
            .acquire("orders", Duration::from_secs(5), &RetryPolicy::none(), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, LockError::Cancelled { .. }));
        assert_eq!(store.set_if_absent_calls(), 2);
    }

    #[test]
    fn test_rejects_invalid_policy() {
        let result = ResilientLockFactory::new(
            SingleStoreLock::new(Arc::new(MemoryStore::default())),
            RetryPolicy::default().with_jitter(-0.5),
        );
        assert!(result.is_err());
    }
}
