//! 键值存储适配层
//!
//! 锁算法只依赖存储提供的三个原子原语，不关心具体协议：
//!
//! - `set_if_absent`：仅在 key 不存在时写入 token 并设置过期时间
//! - `compare_and_delete`：仅当当前值等于 token 时删除
//! - `compare_and_extend`：仅当当前值等于 token 时重置过期时间
//!
//! 比较与删除必须在存储端一次完成。先 GET 再 DEL 的两步写法存在竞态窗口：
//! 两次调用之间锁可能过期并被他人获取，第二步就会误删别人的锁。
//!
//! 返回 `false` 是正常结果（前置条件不满足）；只有通信失败才返回 [`StoreError`]。

mod memory;
mod redis_store;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

/// 存储层错误
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("存储不可用: {store} - {message}")]
    Unavailable { store: String, message: String },

    #[error("存储调用超时: {store} ({timeout_ms}ms)")]
    Timeout { store: String, timeout_ms: u64 },
}

impl StoreError {
    /// 出错的存储实例标识
    pub fn store(&self) -> &str {
        match self {
            Self::Unavailable { store, .. } | Self::Timeout { store, .. } => store,
        }
    }
}

/// 键值存储接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// 存储实例标识，用于日志和指标
    fn name(&self) -> &str;

    async fn set_if_absent(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    async fn compare_and_delete(&self, key: &str, token: &str) -> Result<bool, StoreError>;

    async fn compare_and_extend(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;
}
