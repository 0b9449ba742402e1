//! 锁服务
//!
//! 按配置组装锁工厂并提供带默认参数的获取入口：
//! 一个 Redis 地址用单实例锁，多个地址用多数派锁；
//! 按需叠加基础设施重试和 fail-open 装饰器。

use std::sync::Arc;
use std::time::Duration;

use distlock_shared::config::{AppConfig, LockSettings};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::error::{LockError, Result};
use crate::factory::LockFactory;
use crate::fail_open::FailOpenLockFactory;
use crate::handle::LockHandle;
use crate::quorum::{QuorumConfig, QuorumLock};
use crate::resilient::ResilientLockFactory;
use crate::retry::RetryPolicy;
use crate::single::SingleStoreLock;
use crate::store::{KeyValueStore, RedisStore};

/// 锁默认参数
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// 默认锁超时时间
    pub default_ttl: Duration,
    /// 锁被占用时的重试策略
    pub retry: RetryPolicy,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

impl LockConfig {
    pub fn from_settings(settings: &LockSettings) -> Self {
        Self {
            default_ttl: Duration::from_millis(settings.default_ttl_ms),
            retry: RetryPolicy::constant(
                settings.retry_count,
                Duration::from_millis(settings.retry_delay_ms),
            )
            .with_jitter(settings.retry_jitter),
        }
    }
}

/// 锁服务
#[derive(Clone)]
pub struct LockService {
    factory: Arc<dyn LockFactory>,
    config: LockConfig,
}

impl LockService {
    pub fn new(factory: Arc<dyn LockFactory>, config: LockConfig) -> Self {
        Self { factory, config }
    }

    /// 按应用配置连接 Redis 并组装锁服务
    ///
    /// 只解析地址、不建立连接；连接在第一次使用时建立。
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let redis = &config.redis;
        let stores = redis
            .endpoints
            .iter()
            .map(|url| -> Result<Arc<dyn KeyValueStore>> {
                let store = RedisStore::open(url)
                    .map_err(|e| LockError::invalid("redis.endpoints", e.to_string()))?
                    .with_key_prefix(redis.key_prefix.clone())
                    .with_connect_timeout(Duration::from_millis(redis.connect_timeout_ms))
                    .with_command_timeout(Duration::from_millis(redis.command_timeout_ms));
                Ok(Arc::new(store))
            })
            .collect::<Result<Vec<_>>>()?;

        Self::with_stores(stores, config)
    }

    /// 用给定的存储实例组装锁服务（测试中可传入内存存储）
    pub fn with_stores(stores: Vec<Arc<dyn KeyValueStore>>, config: &AppConfig) -> Result<Self> {
        let lock_config = LockConfig::from_settings(&config.lock);
        lock_config.retry.validate()?;

        let base: Arc<dyn LockFactory> = match stores.len() {
            0 => {
                return Err(LockError::invalid(
                    "redis.endpoints",
                    "at least one endpoint is required",
                ));
            }
            1 => {
                let store = stores.into_iter().next().ok_or_else(|| {
                    LockError::invalid("redis.endpoints", "at least one endpoint is required")
                })?;
                Arc::new(SingleStoreLock::new(store))
            }
            _ => Arc::new(QuorumLock::new(
                stores,
                QuorumConfig::from_settings(&config.quorum),
            )?),
        };

        let settings = &config.lock;
        let resilient: Arc<dyn LockFactory> = if settings.unavailable_retry_count > 0 {
            let policy = RetryPolicy::constant(
                settings.unavailable_retry_count,
                Duration::from_millis(settings.unavailable_retry_delay_ms),
            )
            .with_jitter(settings.retry_jitter);
            Arc::new(ResilientLockFactory::new(base, policy)?)
        } else {
            base
        };

        let factory: Arc<dyn LockFactory> = if settings.fail_open {
            if config.is_production() {
                warn!("fail_open is enabled in production");
            }
            Arc::new(FailOpenLockFactory::new(resilient))
        } else {
            resilient
        };

        info!(
            endpoints = config.redis.endpoints.len(),
            quorum = config.uses_quorum(),
            fail_open = settings.fail_open,
            unavailable_retry_count = settings.unavailable_retry_count,
            default_ttl_ms = settings.default_ttl_ms,
            "Lock service initialized"
        );

        Ok(Self::new(factory, lock_config))
    }

    pub fn factory(&self) -> &Arc<dyn LockFactory> {
        &self.factory
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// 使用默认租约和默认重试策略获取锁
    pub async fn acquire(&self, key: &str) -> Result<LockHandle> {
        self.acquire_with(key, None, &CancellationToken::new()).await
    }

    /// 获取锁，`ttl` 为 None 时使用配置中的默认租约
    #[instrument(skip(self, cancel))]
    pub async fn acquire_with(
        &self,
        key: &str,
        ttl: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<LockHandle> {
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        self.factory
            .acquire(key, ttl, &self.config.retry, cancel)
            .await
    }

    /// 只尝试一次
    pub async fn try_acquire(&self, key: &str, ttl: Option<Duration>) -> Result<LockHandle> {
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        self.factory.try_acquire(key, ttl).await
    }
}
