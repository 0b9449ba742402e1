//! 多数派分布式锁（RedLock 风格）
//!
//! 在 N 个相互独立的存储实例上用同一个 token 并发抢锁：
//!
//! 1. 所有实例并发执行 `set_if_absent`，每个调用都有远小于租约的超时，
//!    慢实例或宕机实例不会拖住整轮尝试
//! 2. 统计成功数与本轮耗时；成功数达到 `N/2 + 1` 且
//!    `ttl - 耗时 - validity_margin > 0` 才算拿到锁
//! 3. 拿到锁时句柄上的有效期是扣除后的剩余时间，而不是名义 ttl
//! 4. 未达到多数派时，立即在写入成功（或结果未知）的实例上按 token 删除，
//!    避免残留的部分锁一直占到自然过期
//!
//! 释放时对全部实例执行 `compare_and_delete`，单个实例失败只记日志，TTL 兜底。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use distlock_shared::config::QuorumSettings;
use distlock_shared::observability::metrics;
use futures::future::join_all;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::{LockError, Result};
use crate::factory::{LockFactory, acquire_with_retry};
use crate::handle::{Lease, LeaseBackend, LockHandle};
use crate::key::{LockKey, LockToken, validate_ttl};
use crate::retry::RetryPolicy;
use crate::store::{KeyValueStore, StoreError};

const BACKEND: &str = "quorum";

/// 多数派锁配置
#[derive(Debug, Clone)]
pub struct QuorumConfig {
    /// 时钟漂移与网络延迟的安全余量
    pub validity_margin: Duration,
    /// 按 ttl 比例追加的漂移系数（0.01 表示 ttl 的 1%），默认不追加
    pub clock_drift_factor: f64,
    /// 单个实例的调用超时（实际使用 `min(store_timeout, ttl)`）
    pub store_timeout: Duration,
}

impl Default for QuorumConfig {
    fn default() -> Self {
        Self {
            validity_margin: Duration::from_millis(12),
            clock_drift_factor: 0.0,
            store_timeout: Duration::from_millis(50),
        }
    }
}

impl QuorumConfig {
    pub fn from_settings(settings: &QuorumSettings) -> Self {
        Self {
            validity_margin: Duration::from_millis(settings.validity_margin_ms),
            clock_drift_factor: settings.clock_drift_factor,
            store_timeout: Duration::from_millis(settings.store_timeout_ms),
        }
    }

    /// 租约 `ttl` 对应的总扣减：`validity_margin + ttl * clock_drift_factor`
    pub fn drift_for(&self, ttl: Duration) -> Duration {
        self.validity_margin + ttl.mul_f64(self.clock_drift_factor)
    }

    /// 扣除耗时和漂移后的剩余有效期，不为正时返回 None
    pub fn remaining_validity(&self, ttl: Duration, elapsed: Duration) -> Option<Duration> {
        ttl.checked_sub(elapsed)
            .and_then(|left| left.checked_sub(self.drift_for(ttl)))
            .filter(|validity| !validity.is_zero())
    }

    fn validate(&self) -> Result<()> {
        if !self.clock_drift_factor.is_finite() || !(0.0..1.0).contains(&self.clock_drift_factor) {
            return Err(LockError::invalid(
                "quorum.clock_drift_factor",
                format!("must be within [0, 1), got {}", self.clock_drift_factor),
            ));
        }
        if self.store_timeout.is_zero() {
            return Err(LockError::invalid(
                "quorum.store_timeout",
                "per-store timeout must be positive",
            ));
        }
        Ok(())
    }
}

/// 多数派阈值 `floor(N/2) + 1`
pub fn quorum_size(stores: usize) -> usize {
    stores / 2 + 1
}

/// 多数派锁工厂
#[derive(Clone)]
pub struct QuorumLock {
    backend: Arc<QuorumBackend>,
}

struct QuorumBackend {
    stores: Vec<Arc<dyn KeyValueStore>>,
    config: QuorumConfig,
}

impl QuorumLock {
    pub fn new(stores: Vec<Arc<dyn KeyValueStore>>, config: QuorumConfig) -> Result<Self> {
        if stores.is_empty() {
            return Err(LockError::invalid(
                "quorum.stores",
                "at least one store is required",
            ));
        }
        config.validate()?;

        info!(
            stores = stores.len(),
            quorum = quorum_size(stores.len()),
            validity_margin_ms = config.validity_margin.as_millis() as u64,
            store_timeout_ms = config.store_timeout.as_millis() as u64,
            "Quorum lock created"
        );

        Ok(Self {
            backend: Arc::new(QuorumBackend { stores, config }),
        })
    }

    pub fn quorum(&self) -> usize {
        quorum_size(self.backend.stores.len())
    }

    pub fn config(&self) -> &QuorumConfig {
        &self.backend.config
    }

    async fn try_once(
        &self,
        key: &LockKey,
        ttl: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<LockHandle>> {
        let backend = &self.backend;
        let token = LockToken::generate();
        let timeout = backend.store_timeout(ttl);
        let started = Instant::now();

        let results = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                // 各实例状态未知，全部尝试清理
                let all: Vec<usize> = (0..backend.stores.len()).collect();
                backend.delete_on(&all, key, &token).await;
                return Err(LockError::Cancelled { key: key.to_string() });
            }
            results = join_all(backend.stores.iter().map(|store| {
                backend.call(store, timeout, "set_if_absent", store.set_if_absent(key.as_str(), token.as_str(), ttl))
            })) => results,
        };
        let elapsed = started.elapsed();

        let mut acquired = Vec::new();
        let mut unknown = Vec::new();
        let mut errors = Vec::new();
        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok(true) => acquired.push(index),
                Ok(false) => {}
                Err(e) => {
                    // 超时的写入可能已经落地，清理时一并处理
                    if matches!(e, StoreError::Timeout { .. }) {
                        unknown.push(index);
                    }
                    errors.push(e);
                }
            }
        }

        let validity = backend.config.remaining_validity(ttl, elapsed);
        if acquired.len() >= self.quorum()
            && let Some(validity) = validity
        {
            debug!(
                key = %key,
                successes = acquired.len(),
                elapsed_ms = elapsed.as_millis() as u64,
                validity_ms = validity.as_millis() as u64,
                "Quorum lock acquired"
            );
            let lease = Lease::new(key.clone(), token, ttl, started, validity);
            return Ok(Some(LockHandle::acquired(lease, self.backend.clone())));
        }

        let cleanup: Vec<usize> = acquired.iter().chain(unknown.iter()).copied().collect();
        backend.delete_on(&cleanup, key, &token).await;

        // 没有任何实例给出答复时，这是基础设施故障而不是锁被占用
        if errors.len() == backend.stores.len()
            && let Some(e) = errors.pop()
        {
            return Err(LockError::unavailable(key.as_str(), e));
        }

        debug!(
            key = %key,
            successes = acquired.len(),
            quorum = self.quorum(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Quorum not reached"
        );
        Ok(None)
    }
}

impl QuorumBackend {
    fn store_timeout(&self, ttl: Duration) -> Duration {
        self.config.store_timeout.min(ttl)
    }

    /// 单个实例调用：加超时，失败记日志和指标
    async fn call(
        &self,
        store: &Arc<dyn KeyValueStore>,
        timeout: Duration,
        operation: &'static str,
        fut: impl Future<Output = std::result::Result<bool, StoreError>>,
    ) -> std::result::Result<bool, StoreError> {
        let result = match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout {
                store: store.name().to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        };

        if let Err(e) = &result {
            warn!(store = store.name(), operation, error = %e, "Quorum store call failed");
            metrics::record_quorum_store_failure(store.name(), operation);
        }
        result
    }

    /// 在指定实例上按 token 删除，失败只记日志
    async fn delete_on(&self, indices: &[usize], key: &LockKey, token: &LockToken) {
        if indices.is_empty() {
            return;
        }
        let timeout = self.config.store_timeout;
        join_all(indices.iter().map(|&index| {
            let store = &self.stores[index];
            self.call(
                store,
                timeout,
                "compare_and_delete",
                store.compare_and_delete(key.as_str(), token.as_str()),
            )
        }))
        .await;
    }
}

#[async_trait]
impl LockFactory for QuorumLock {
    #[instrument(skip(self, retry, cancel), fields(stores = self.backend.stores.len()))]
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
impl LeaseBackend for QuorumBackend {
    fn kind(&self) -> &'static str {
        BACKEND
    }

    /// 任一实例删除成功即返回 true；不要求多数派
    async fn release(&self, lease: &Lease) -> Result<bool> {
        let timeout = self.store_timeout(lease.ttl());
        let results = join_all(self.stores.iter().map(|store| {
            self.call(
                store,
                timeout,
                "compare_and_delete",
                store.compare_and_delete(lease.key().as_str(), lease.token().as_str()),
            )
        }))
        .await;

        Ok(results.iter().any(|r| matches!(r, Ok(true))))
    }

    /// 多数派实例续期成功且剩余有效期为正才算续期成功
    async fn extend(&self, lease: &Lease, ttl: Duration) -> Result<bool> {
        let timeout = self.store_timeout(ttl);
        let started = Instant::now();
        let results = join_all(self.stores.iter().map(|store| {
            self.call(
                store,
                timeout,
                "compare_and_extend",
                store.compare_and_extend(lease.key().as_str(), lease.token().as_str(), ttl),
            )
        }))
        .await;

        let extended = results.iter().filter(|r| matches!(r, Ok(true))).count();
        let validity = self.config.remaining_validity(ttl, started.elapsed());

        match validity {
            Some(validity) if extended >= quorum_size(self.stores.len()) => {
                lease.renew(started, validity);
                Ok(true)
            }
            _ => {
                // 已续期的少数实例不回滚，由 TTL 到期兜底
                warn!(
                    key = %lease.key(),
                    extended,
                    quorum = quorum_size(self.stores.len()),
                    "Quorum lease extension failed"
                );
                Ok(false)
            }
        }
    }
}
