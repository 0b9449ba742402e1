//! 单实例分布式锁
//!
//! 基于一个键值存储实现：`set_if_absent` 抢锁，`compare_and_delete` 按 token 释放。
//! key 被占用时按重试策略等待；存储通信失败立即以 `StoreUnavailable` 返回，
//! 是否对基础设施故障重试由上层（如 [`crate::ResilientLockFactory`]）决定。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::error::{LockError, Result};
use crate::factory::{LockFactory, acquire_with_retry};
use crate::handle::{Lease, LeaseBackend, LockHandle};
use crate::key::{LockKey, LockToken, validate_ttl};
use crate::retry::RetryPolicy;
use crate::store::KeyValueStore;

const BACKEND: &str = "single";

/// 单实例锁工厂
#[derive(Clone)]
pub struct SingleStoreLock {
    backend: Arc<SingleStoreBackend>,
}

struct SingleStoreBackend {
    store: Arc<dyn KeyValueStore>,
}

impl SingleStoreLock {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            backend: Arc::new(SingleStoreBackend { store }),
        }
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.backend.store
    }

    /// 单次抢锁
    ///
    /// 存储调用与取消信号竞争；若调用途中被取消，写入可能已经生效，
    /// 因此用本次 token 尽力删除一次再返回 `Cancelled`。
    async fn try_once(
        &self,
        key: &LockKey,
        ttl: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<LockHandle>> {
        let store = &self.backend.store;
        let token = LockToken::generate();
        let started = Instant::now();

        let written = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                if let Err(e) = store.compare_and_delete(key.as_str(), token.as_str()).await {
                    warn!(key = %key, error = %e, "Cleanup after cancelled attempt failed");
                }
                return Err(LockError::Cancelled { key: key.to_string() });
            }
            result = store.set_if_absent(key.as_str(), token.as_str(), ttl) => {
                result.map_err(|e| LockError::unavailable(key.as_str(), e))?
            }
        };

        if !written {
            return Ok(None);
        }

        debug!(key = %key, token = %token, store = store.name(), "Lock acquired");
        let lease = Lease::new(key.clone(), token, ttl, started, ttl);
        Ok(Some(LockHandle::acquired(lease, self.backend.clone())))
    }
}

#[async_trait]
impl LockFactory for SingleStoreLock {
    #[instrument(skip(self, retry, cancel), fields(store = self.backend.store.name()))]
    async fn acquire(
        &self,
        key: &str,
        ttl: Duration,
        retry: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<LockHandle> {
        let key = LockKey::new(key)?;
        validate_ttl(ttl)?;
        retry.validate()?;

        acquire_with_retry(BACKEND, key.as_str(), retry, cancel, |_| {
            self.try_once(&key, ttl, cancel)
        })
        .await
    }
}

#[async_trait]
impl LeaseBackend for SingleStoreBackend {
    fn kind(&self) -> &'static str {
        BACKEND
    }

    async fn release(&self, lease: &Lease) -> Result<bool> {
        self.store
            .compare_and_delete(lease.key().as_str(), lease.token().as_str())
            .await
            .map_err(|e| LockError::unavailable(lease.key().as_str(), e))
    }

    async fn extend(&self, lease: &Lease, ttl: Duration) -> Result<bool> {
        let started = Instant::now();
        let extended = self
            .store
            .compare_and_extend(lease.key().as_str(), lease.token().as_str(), ttl)
            .await
            .map_err(|e| LockError::unavailable(lease.key().as_str(), e))?;

        if extended {
            lease.renew(started, ttl);
        }
        Ok(extended)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MockKeyValueStore, StoreError};
    use mockall::predicate::*;

    fn unavailable() -> StoreError {
        StoreError::Unavailable {
            store: "mock".to_string(),
            message: "connection refused".to_string(),
        }
    }

    fn mock_store() -> MockKeyValueStore {
        let mut store = MockKeyValueStore::new();
        store.expect_name().return_const("mock".to_string());
        store
    }

    #[tokio::test]
    async fn test_invalid_arguments_fail_fast() {
        // 没有设置任何 set_if_absent 期望：一旦访问存储 mock 就会 panic
        let lock = SingleStoreLock::new(Arc::new(mock_store()));
        let cancel = CancellationToken::new();
        let retry = RetryPolicy::default();

        let err = lock
            .acquire("  ", Duration::from_secs(1), &retry, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::InvalidArgument { field: "key", .. }));

        let err = lock
            .acquire("orders", Duration::ZERO, &retry, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::InvalidArgument { field: "ttl", .. }));

        let err = lock
            .acquire(
                "orders",
                Duration::from_secs(1),
                &RetryPolicy::default().with_jitter(2.0),
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::InvalidArgument { field: "retry.jitter", .. }));
    }

    #[tokio::test]
    async fn test_store_error_is_not_retried() {
        let mut store = mock_store();
        store
            .expect_set_if_absent()
            .times(1)
            .returning(|_, _, _| Err(unavailable()));

        let lock = SingleStoreLock::new(Arc::new(store));
        let err = lock
            .acquire(
                "orders",
                Duration::from_secs(1),
                &RetryPolicy::constant(5, Duration::from_millis(1)),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(err.is_store_unavailable());
        assert_eq!(err.code(), "LOCK_STORE_UNAVAILABLE");
    }

    #[tokio::test]
    async fn test_acquire_passes_key_and_ttl_to_store() {
        let mut store = mock_store();
        store
            .expect_set_if_absent()
            .with(eq("orders"), always(), eq(Duration::from_secs(7)))
            .times(1)
            .returning(|_, _, _| Ok(true));
        store
            .expect_compare_and_delete()
            .with(eq("orders"), always())
            .times(1)
            .returning(|_, _| Ok(true));

        let lock = SingleStoreLock::new(Arc::new(store));
        let mut handle = lock
            .try_acquire("orders", Duration::from_secs(7))
            .await
            .unwrap();

        assert!(handle.is_acquired());
        assert!(handle.release().await.unwrap());
    }

    #[tokio::test]
    async fn test_release_error_still_clears_ownership() {
        let mut store = mock_store();
        store.expect_set_if_absent().returning(|_, _, _| Ok(true));
        store
            .expect_compare_and_delete()
            .times(1)
            .returning(|_, _| Err(unavailable()));

        let lock = SingleStoreLock::new(Arc::new(store));
        let mut handle = lock
            .try_acquire("orders", Duration::from_secs(1))
            .await
            .unwrap();

        assert!(handle.release().await.is_err());
        assert!(!handle.is_acquired());
        // 第二次释放是空操作，不会再访问存储（times(1) 保证）
        assert!(!handle.release().await.unwrap());
    }

    #[tokio::test]
    async fn test_extend_uses_same_token() {
        let mut store = mock_store();
        store.expect_set_if_absent().returning(|_, _, _| Ok(true));
        store
            .expect_compare_and_extend()
            .with(eq("orders"), always(), eq(Duration::from_secs(30)))
            .times(1)
            .returning(|_, _, _| Ok(true));
        store.expect_compare_and_delete().returning(|_, _| Ok(true));

        let lock = SingleStoreLock::new(Arc::new(store));
        let mut handle = lock
            .try_acquire("orders", Duration::from_secs(1))
            .await
            .unwrap();

        assert!(handle.extend(Duration::from_secs(30)).await.unwrap());
        assert_eq!(handle.lease().unwrap().validity(), Duration::from_secs(30));
        handle.release().await.unwrap();
    }
}
