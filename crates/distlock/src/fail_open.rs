//! Fail-open 装饰器
//!
//! 存储不可用时不阻塞业务，而是放行一个"视为已获取"的句柄。
//! 放行期间没有任何互斥保证，只适合锁仅用于减少重复工作、
//! 重复执行本身无害的场景，因此必须显式开启。

use std::time::Duration;

use async_trait::async_trait;
use distlock_shared::observability::metrics;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::error::Result;
use crate::factory::LockFactory;
use crate::handle::LockHandle;
use crate::retry::RetryPolicy;

/// 存储故障时放行的锁工厂
#[derive(Debug, Clone)]
pub struct FailOpenLockFactory<F> {
    inner: F,
}

impl<F: LockFactory> FailOpenLockFactory<F> {
    pub fn new(inner: F) -> Self {
        warn!("Fail-open lock factory enabled: store outages will NOT provide mutual exclusion");
        Self { inner }
    }

    pub fn inner(&self) -> &F {
        &self.inner
    }
}

#[async_trait]
impl<F: LockFactory> LockFactory for FailOpenLockFactory<F> {
    async fn acquire(
        &self,
        key: &str,
        ttl: Duration,
        retry: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<LockHandle> {
        match self.inner.acquire(key, ttl, retry, cancel).await {
            Err(e) if e.is_store_unavailable() => {
                error!(
                    lock_key = key,
                    error = %e,
                    "锁存储不可用，fail-open 放行（无互斥保证）"
                );
                metrics::record_fail_open();
                Ok(LockHandle::fail_open(key))
            }
            other => other,
        }
    }
}
