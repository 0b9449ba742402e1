//! 锁工厂接口
//!
//! 所有锁实现（单实例、多数派）和装饰器（fail-open、基础设施重试）都实现同一个
//! [`LockFactory`] trait，装饰器通过组合叠加，调用方只依赖这个接口。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use distlock_shared::observability::metrics;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{LockError, Result};
use crate::handle::LockHandle;
use crate::retry::{RetryPolicy, sleep_or_cancel};

/// 锁工厂
///
/// 竞争同一个 key 的多个获取者之间没有公平性或先来先得保证，
/// 谁能拿到锁完全取决于存储端原子写入的先后。
#[async_trait]
pub trait LockFactory: Send + Sync {
    /// 获取锁
    ///
    /// - 在重试额度内拿到锁：返回 `is_acquired() == true` 的句柄
    /// - 重试用尽仍被占用：返回 `is_acquired() == false` 的句柄（正常结果）
    /// - 参数非法：`LockError::InvalidArgument`
    /// - 存储通信失败：`LockError::StoreUnavailable`，本层不重试
    /// - 等待期间被取消：`LockError::Cancelled`
    async fn acquire(
        &self,
        key: &str,
        ttl: Duration,
        retry: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<LockHandle>;

    /// 只尝试一次，不等待
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<LockHandle> {
        self.acquire(key, ttl, &RetryPolicy::none(), &CancellationToken::new())
            .await
    }
}

#[async_trait]
impl<T: LockFactory + ?Sized> LockFactory for Arc<T> {
    async fn acquire(
        &self,
        key: &str,
        ttl: Duration,
        retry: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<LockHandle> {
        (**self).acquire(key, ttl, retry, cancel).await
    }
}

/// 通用获取循环
///
/// 每轮开始前检查取消信号，调用 `attempt`（返回 `Some` 即成功、`None` 表示被占用），
/// 未成功则按策略等待后重试。错误立即返回，不重试。
pub(crate) async fn acquire_with_retry<F, Fut>(
    backend: &'static str,
    key: &str,
    retry: &RetryPolicy,
    cancel: &CancellationToken,
    mut attempt: F,
) -> Result<LockHandle>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Option<LockHandle>>>,
{
    let started = Instant::now();
    let mut scheduler = retry.scheduler();
    let mut attempts: u32 = 0;

    let outcome = loop {
        if cancel.is_cancelled() {
            break Err(LockError::Cancelled {
                key: key.to_string(),
            });
        }

        attempts += 1;
        match attempt(attempts).await {
            Ok(Some(handle)) => break Ok(handle),
            Ok(None) => {}
            Err(e) => break Err(e),
        }

        let Some(delay) = scheduler.next_delay() else {
            debug!(key, attempts, "Lock not acquired, retries exhausted");
            break Ok(LockHandle::not_acquired(key));
        };

        debug!(
            key,
            attempt = attempts,
            retry_delay_ms = delay.as_millis() as u64,
            "Lock not acquired, retrying"
        );
        if !sleep_or_cancel(delay, cancel).await {
            break Err(LockError::Cancelled {
                key: key.to_string(),
            });
        }
    };

    let label = match &outcome {
        Ok(handle) if handle.is_acquired() => "acquired",
        Ok(_) => "not_acquired",
        Err(LockError::StoreUnavailable { .. }) => "unavailable",
        Err(LockError::Cancelled { .. }) => "cancelled",
        Err(LockError::InvalidArgument { .. }) => "invalid",
    };
    metrics::record_lock_acquire(backend, label, attempts, started.elapsed().as_secs_f64());

    outcome
}
