//! 内存存储
//!
//! 基于 DashMap 的进程内键值存储，语义与 Redis 实现一致（每个 key 的操作原子、带过期时间），
//! 适用于测试和单进程开发环境。过期时间基于 tokio 时钟，测试中可以用暂停的时钟推进。
//!
//! 额外提供故障注入（不可用、延迟）和调用计数，用于验证锁算法在异常下的行为。

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{KeyValueStore, StoreError};

#[derive(Debug, Clone)]
struct StoredLock {
    token: String,
    expires_at: Instant,
}

impl StoredLock {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// 内存键值存储
#[derive(Debug)]
pub struct MemoryStore {
    name: String,
    entries: DashMap<String, StoredLock>,
    unavailable: AtomicBool,
    latency: Mutex<Duration>,
    set_calls: AtomicU64,
    delete_calls: AtomicU64,
    extend_calls: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new("memory")
    }
}

impl MemoryStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: DashMap::new(),
            unavailable: AtomicBool::new(false),
            latency: Mutex::new(Duration::ZERO),
            set_calls: AtomicU64::new(0),
            delete_calls: AtomicU64::new(0),
            extend_calls: AtomicU64::new(0),
        }
    }

    /// 模拟存储宕机：之后的所有调用都返回 `StoreError::Unavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// 为每次调用增加固定延迟
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// 当前持有 key 的 token（已过期的视为不存在）
    pub fn token_of(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.token.clone())
    }

    /// key 剩余的存活时间
    pub fn ttl_of(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.expires_at - now)
    }

    /// 立即让 key 过期，模拟持有者崩溃后租约到期
    pub fn expire_now(&self, key: &str) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.expires_at = Instant::now();
        }
    }

    /// 绕过锁协议直接写入，模拟其他客户端覆盖了 key
    pub fn put(&self, key: &str, token: &str, ttl: Duration) {
        self.entries.insert(
            key.to_string(),
            StoredLock {
                token: token.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// 当前保存的条目数（包括尚未清除的过期条目）
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn set_if_absent_calls(&self) -> u64 {
        self.set_calls.load(Ordering::SeqCst)
    }

    pub fn compare_and_delete_calls(&self) -> u64 {
        self.delete_calls.load(Ordering::SeqCst)
    }

    pub fn compare_and_extend_calls(&self) -> u64 {
        self.extend_calls.load(Ordering::SeqCst)
    }

    async fn simulate_io(&self) -> Result<(), StoreError> {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable {
                store: self.name.clone(),
                message: "simulated outage".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn set_if_absent(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.set_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_io().await?;

        let now = Instant::now();
        let fresh = StoredLock {
            token: token.to_string(),
            expires_at: now + ttl,
        };

        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    Ok(false)
                } else {
                    occupied.insert(fresh);
                    Ok(true)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
                Ok(true)
            }
        }
    }

    async fn compare_and_delete(&self, key: &str, token: &str) -> Result<bool, StoreError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_io().await?;

        // 过期条目顺带清除，只有仍然存活且 token 匹配才算删除成功
        let now = Instant::now();
        let removed = self
            .entries
            .remove_if(key, |_, entry| !entry.is_live(now) || entry.token == token);
        Ok(removed.is_some_and(|(_, entry)| entry.is_live(now)))
    }

    async fn compare_and_extend(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.extend_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_io().await?;

        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut entry) if entry.is_live(now) && entry.token == token => {
                entry.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_set_if_absent_only_once_per_live_key() {
        let store = MemoryStore::default();
        let ttl = Duration::from_secs(10);

        assert!(store.set_if_absent("k", "a", ttl).await.unwrap());
        assert!(!store.set_if_absent("k", "b", ttl).await.unwrap());
        assert_eq!(store.token_of("k").as_deref(), Some("a"));
        assert_eq!(store.set_if_absent_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires() {
        let store = MemoryStore::default();
        assert!(store.set_if_absent("k", "a", Duration::from_secs(1)).await.unwrap());

        tokio::time::advance(Duration::from_millis(1_001)).await;

        assert!(store.token_of("k").is_none());
        assert!(store.set_if_absent("k", "b", Duration::from_secs(1)).await.unwrap());
        assert_eq!(store.token_of("k").as_deref(), Some("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_compare_and_delete_checks_token() {
        let store = MemoryStore::default();
        store.put("k", "owner", Duration::from_secs(5));

        assert!(!store.compare_and_delete("k", "intruder").await.unwrap());
        assert_eq!(store.token_of("k").as_deref(), Some("owner"));

        assert!(store.compare_and_delete("k", "owner").await.unwrap());
        assert!(store.token_of("k").is_none());
        assert!(!store.compare_and_delete("k", "owner").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_compare_and_delete_evicts_expired_entries() {
        let store = MemoryStore::default();
        store.put("a", "owner", Duration::from_secs(1));
        store.put("b", "owner", Duration::from_secs(1));
        store.put("c", "owner", Duration::from_secs(60));
        assert_eq!(store.len(), 3);

        tokio::time::advance(Duration::from_secs(2)).await;

        // 过期的 key 不算删除成功，但条目被清除
        assert!(!store.compare_and_delete("a", "owner").await.unwrap());
        assert!(!store.compare_and_delete("b", "someone-else").await.unwrap());
        assert_eq!(store.len(), 1);

        assert!(store.compare_and_delete("c", "owner").await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_compare_and_extend() {
        let store = MemoryStore::default();
        store.put("k", "owner", Duration::from_secs(1));

        assert!(!store.compare_and_extend("k", "other", Duration::from_secs(5)).await.unwrap());
        assert!(store.compare_and_extend("k", "owner", Duration::from_secs(5)).await.unwrap());
        assert_eq!(store.ttl_of("k"), Some(Duration::from_secs(5)));

        store.expire_now("k");
        assert!(!store.compare_and_extend("k", "owner", Duration::from_secs(5)).await.unwrap());
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_every_call() {
        let store = MemoryStore::new("down");
        store.set_unavailable(true);

        let err = store
            .set_if_absent("k", "a", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.store(), "down");
        assert!(store.compare_and_delete("k", "a").await.is_err());
        assert!(store.compare_and_extend("k", "a", Duration::from_secs(1)).await.is_err());
    }
}
