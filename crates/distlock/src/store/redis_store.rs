//! Redis 存储实现
//!
//! - 获取：`SET key token NX PX ttl`，只有一个客户端能写入成功
//! - 释放：Lua 脚本原子比较 token 后删除
//! - 续期：Lua 脚本原子比较 token 后 `PEXPIRE`

use std::future::Future;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::{Client, RedisError, Script};
use tracing::{debug, info, instrument, warn};

use super::{KeyValueStore, StoreError};

/// 只有当锁的 owner 匹配时才删除
static RELEASE_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
        if redis.call("get", KEYS[1]) == ARGV[1] then
            return redis.call("del", KEYS[1])
        else
            return 0
        end
    "#,
    )
});

/// 只有当锁的 owner 匹配时才重置过期时间
static EXTEND_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
        if redis.call("get", KEYS[1]) == ARGV[1] then
            return redis.call("pexpire", KEYS[1], ARGV[2])
        else
            return 0
        end
    "#,
    )
});

/// 单个 Redis 实例
///
/// 连接在首次使用时建立并复用；发生 IO 错误后丢弃，下次调用重新连接。
pub struct RedisStore {
    name: String,
    client: Client,
    conn: Mutex<Option<MultiplexedConnection>>,
    key_prefix: String,
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl RedisStore {
    /// 创建 Redis 存储（不会立即建立连接）
    pub fn open(url: &str) -> Result<Self, StoreError> {
        let name = redact_url(url);
        let client = Client::open(url).map_err(|e| StoreError::Unavailable {
            store: name.clone(),
            message: e.to_string(),
        })?;
        info!(store = %name, "Redis lock store created");

        Ok(Self {
            name,
            client,
            conn: Mutex::new(None),
            key_prefix: "lock:".to_string(),
            connect_timeout: Duration::from_secs(1),
            command_timeout: Duration::from_millis(500),
        })
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    fn lock_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    /// 获取连接
    async fn get_conn(&self) -> Result<MultiplexedConnection, StoreError> {
        let cached = self.conn.lock().clone();
        if let Some(conn) = cached {
            return Ok(conn);
        }

        let conn = self
            .bounded(self.connect_timeout, self.client.get_multiplexed_async_connection())
            .await?;
        debug!(store = %self.name, "Redis connection established");

        *self.conn.lock() = Some(conn.clone());
        Ok(conn)
    }

    /// 为一次 Redis 调用加上超时，并把错误统一转换为 StoreError
    async fn bounded<T>(
        &self,
        timeout: Duration,
        fut: impl Future<Output = Result<T, RedisError>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                if e.is_io_error() || e.is_connection_dropped() {
                    warn!(store = %self.name, error = %e, "Dropping broken Redis connection");
                    self.conn.lock().take();
                }
                Err(StoreError::Unavailable {
                    store: self.name.clone(),
                    message: e.to_string(),
                })
            }
            Err(_) => Err(StoreError::Timeout {
                store: self.name.clone(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, token), fields(store = %self.name))]
    async fn set_if_absent(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.get_conn().await?;

        // SET key value NX PX milliseconds
        // SET NX 成功时返回 "OK"，失败时返回 nil
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.lock_key(key))
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64);

        let result: Option<String> = self
            .bounded(self.command_timeout, cmd.query_async(&mut conn))
            .await?;

        Ok(result.is_some())
    }

    #[instrument(skip(self, token), fields(store = %self.name))]
    async fn compare_and_delete(&self, key: &str, token: &str) -> Result<bool, StoreError> {
        let mut conn = self.get_conn().await?;

        let mut invocation = RELEASE_SCRIPT.prepare_invoke();
        invocation.key(self.lock_key(key)).arg(token);

        let deleted: i64 = self
            .bounded(self.command_timeout, invocation.invoke_async(&mut conn))
            .await?;

        Ok(deleted > 0)
    }

    #[instrument(skip(self, token), fields(store = %self.name))]
    async fn compare_and_extend(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.get_conn().await?;

        let mut invocation = EXTEND_SCRIPT.prepare_invoke();
        invocation
            .key(self.lock_key(key))
            .arg(token)
            .arg(ttl.as_millis() as u64);

        let extended: i64 = self
            .bounded(self.command_timeout, invocation.invoke_async(&mut conn))
            .await?;

        Ok(extended > 0)
    }
}

/// 日志中隐藏连接串里的认证信息
fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***@{}", &url[..scheme_end], &url[at + 1..])
        }
        _ => url.to_string(),
    }
}
