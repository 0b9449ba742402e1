//! 锁句柄
//!
//! 句柄是调用方唯一能看到的锁对象，状态显式建模为四种：
//!
//! - `NotAcquired`：重试用尽仍未拿到锁（正常结果，不是错误）
//! - `Acquired`：持有租约，可释放、续期
//! - `Released`：已经释放过，再次释放是空操作
//! - `FailOpen`：存储不可用时由 fail-open 装饰器放行的占位句柄
//!
//! `Acquired → Released` 只发生一次：释放时先把状态替换为 `Released` 再访问存储，
//! 所以即使存储调用失败，同一个 token 也不会被第二次使用。
//!
//! 句柄是单所有者的，`release`/`extend` 需要 `&mut self`，不能被多个调用方并发释放；
//! 需要跨任务共享时由调用方自行加锁。

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use distlock_shared::observability::metrics;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::error::Result;
use crate::key::{LockKey, LockToken, validate_ttl};
use crate::retry::sleep_or_cancel;

/// 租约有效窗口：从 `renewed_at` 起 `validity` 时长内有效
#[derive(Debug, Clone, Copy)]
struct LeaseWindow {
    renewed_at: Instant,
    validity: Duration,
}

/// 已获取的租约
///
/// 克隆的租约共享同一个有效窗口，后台续期后句柄上看到的剩余时间同步更新。
#[derive(Debug, Clone)]
pub struct Lease {
    key: LockKey,
    token: LockToken,
    ttl: Duration,
    window: Arc<Mutex<LeaseWindow>>,
}

impl Lease {
    /// `validity` 是从 `started_at` 起算的有效时长。单实例锁等于 ttl，
    /// 多数派锁是扣除耗时和时钟漂移后的剩余时间。
    pub fn new(
        key: LockKey,
        token: LockToken,
        ttl: Duration,
        started_at: Instant,
        validity: Duration,
    ) -> Self {
        Self {
            key,
            token,
            ttl,
            window: Arc::new(Mutex::new(LeaseWindow {
                renewed_at: started_at,
                validity,
            })),
        }
    }

    pub fn key(&self) -> &LockKey {
        &self.key
    }

    pub fn token(&self) -> &LockToken {
        &self.token
    }

    /// 名义租约时长
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// 最近一次获取或续期时计算出的有效时长
    pub fn validity(&self) -> Duration {
        self.window.lock().validity
    }

    /// 剩余有效时间，调用方应以此而不是名义 ttl 作为临界区的时间预算
    pub fn remaining(&self) -> Duration {
        let window = *self.window.lock();
        window.validity.saturating_sub(window.renewed_at.elapsed())
    }

    /// 续期成功后刷新有效窗口
    pub fn renew(&self, started_at: Instant, validity: Duration) {
        *self.window.lock() = LeaseWindow {
            renewed_at: started_at,
            validity,
        };
    }
}

/// 句柄背后的锁实现，只用于释放和续期
#[async_trait]
pub trait LeaseBackend: Send + Sync {
    /// 实现名称，用于日志和指标（如 "single"、"quorum"）
    fn kind(&self) -> &'static str;

    /// 按 token 释放；返回是否确实删除了自己的记录
    async fn release(&self, lease: &Lease) -> Result<bool>;

    /// 按 token 续期；成功时需调用 [`Lease::renew`] 刷新有效窗口
    async fn extend(&self, lease: &Lease, ttl: Duration) -> Result<bool>;
}

/// 后台自动续期任务
struct LeaseKeeper {
    cancel: CancellationToken,
    lost: Arc<AtomicBool>,
    _task: JoinHandle<()>,
}

impl Drop for LeaseKeeper {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum HandleState {
    NotAcquired,
    Acquired {
        lease: Lease,
        backend: Arc<dyn LeaseBackend>,
        keeper: Option<LeaseKeeper>,
    },
    Released,
    FailOpen,
}

/// 锁句柄
pub struct LockHandle {
    key: String,
    state: HandleState,
}

impl fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            HandleState::NotAcquired => "not_acquired",
            HandleState::Acquired { .. } => "acquired",
            HandleState::Released => "released",
            HandleState::FailOpen => "fail_open",
        };
        f.debug_struct("LockHandle")
            .field("key", &self.key)
            .field("state", &state)
            .finish()
    }
}

impl LockHandle {
    pub fn acquired(lease: Lease, backend: Arc<dyn LeaseBackend>) -> Self {
        Self {
            key: lease.key().to_string(),
            state: HandleState::Acquired {
                lease,
                backend,
                keeper: None,
            },
        }
    }

    pub fn not_acquired(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            state: HandleState::NotAcquired,
        }
    }

    /// 放行句柄：始终视为已获取，释放总是成功且不访问存储
    pub fn fail_open(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            state: HandleState::FailOpen,
        }
    }

    /// 是否拿到了锁
    pub fn is_acquired(&self) -> bool {
        matches!(
            self.state,
            HandleState::Acquired { .. } | HandleState::FailOpen
        )
    }

    /// 是否是 fail-open 放行的句柄（此时没有互斥保证）
    pub fn is_fail_open(&self) -> bool {
        matches!(self.state, HandleState::FailOpen)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn lease(&self) -> Option<&Lease> {
        match &self.state {
            HandleState::Acquired { lease, .. } => Some(lease),
            _ => None,
        }
    }

    pub fn token(&self) -> Option<&LockToken> {
        self.lease().map(Lease::token)
    }

    /// 剩余有效时间（未持有租约时为 None）
    pub fn remaining_validity(&self) -> Option<Duration> {
        self.lease().map(Lease::remaining)
    }

    /// 自动续期是否已经失败（锁可能已被他人获取）
    pub fn is_lease_lost(&self) -> bool {
        match &self.state {
            HandleState::Acquired {
                keeper: Some(keeper),
                ..
            } => keeper.lost.load(Ordering::SeqCst),
            _ => false,
        }
    }

    /// 释放锁
    ///
    /// - 未获取或已释放：空操作，返回 `Ok(false)`
    /// - fail-open 句柄：空操作，返回 `Ok(true)`
    /// - 持有租约：原子比较 token 后删除，返回是否删除了自己的记录；
    ///   租约已过期或被他人覆盖时返回 `Ok(false)`，不会误删他人的锁
    ///
    /// 无论存储调用结果如何，调用后句柄都不再持有租约。
    #[instrument(skip(self), fields(key = %self.key))]
    pub async fn release(&mut self) -> Result<bool> {
        match std::mem::replace(&mut self.state, HandleState::Released) {
            HandleState::Acquired {
                lease,
                backend,
                keeper,
            } => {
                drop(keeper);
                let released = backend.release(&lease).await;
                metrics::record_lock_release(
                    backend.kind(),
                    matches!(released, Ok(true)),
                );
                match &released {
                    Ok(true) => debug!("Lock released"),
                    Ok(false) => warn!(
                        token = %lease.token(),
                        "Lock was already expired or owned by another client"
                    ),
                    Err(e) => warn!(error = %e, "Lock release failed, lease will expire via TTL"),
                }
                released
            }
            HandleState::FailOpen => {
                self.state = HandleState::FailOpen;
                debug!("Releasing fail-open lock handle");
                Ok(true)
            }
            HandleState::NotAcquired => {
                self.state = HandleState::NotAcquired;
                Ok(false)
            }
            HandleState::Released => Ok(false),
        }
    }

    /// 手动续期，把租约重置为 `ttl`
    ///
    /// 返回 `Ok(false)` 表示锁已不属于自己（过期或被覆盖）。
    #[instrument(skip(self), fields(key = %self.key))]
    pub async fn extend(&mut self, ttl: Duration) -> Result<bool> {
        validate_ttl(ttl)?;
        match &self.state {
            HandleState::Acquired { lease, backend, .. } => {
                let extended = backend.extend(lease, ttl).await?;
                metrics::record_lease_extend(backend.kind(), extended);
                Ok(extended)
            }
            HandleState::FailOpen => Ok(true),
            HandleState::NotAcquired | HandleState::Released => Ok(false),
        }
    }

    /// 启动后台自动续期
    ///
    /// 每隔 `interval`（默认为租约有效期的三分之一）按名义 ttl 续期一次，
    /// 直到句柄释放或被 drop。续期被拒绝（锁已丢失）或剩余有效期耗尽时停止，
    /// 并通过 [`LockHandle::is_lease_lost`] 暴露。
    ///
    /// 只有持有租约的句柄才会启动任务，返回是否启动。需在 tokio 运行时内调用。
    pub fn enable_auto_extend(&mut self, interval: Option<Duration>) -> bool {
        let HandleState::Acquired {
            lease,
            backend,
            keeper,
        } = &mut self.state
        else {
            return false;
        };
        if keeper.is_some() {
            return false;
        }

        let interval = interval
            .unwrap_or_else(|| lease.validity() / 3)
            .max(Duration::from_millis(1));
        let cancel = CancellationToken::new();
        let lost = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn(keep_alive(
            lease.clone(),
            backend.clone(),
            interval,
            cancel.clone(),
            lost.clone(),
        ));

        debug!(key = %self.key, interval_ms = interval.as_millis() as u64, "Auto extension enabled");
        *keeper = Some(LeaseKeeper {
            cancel,
            lost,
            _task: task,
        });
        true
    }
}

async fn keep_alive(
    lease: Lease,
    backend: Arc<dyn LeaseBackend>,
    interval: Duration,
    cancel: CancellationToken,
    lost: Arc<AtomicBool>,
) {
    while sleep_or_cancel(interval, &cancel).await {
        match backend.extend(&lease, lease.ttl()).await {
            Ok(true) => {
                metrics::record_lease_extend(backend.kind(), true);
                debug!(key = %lease.key(), "Lease extended");
            }
            Ok(false) => {
                metrics::record_lease_extend(backend.kind(), false);
                warn!(key = %lease.key(), "Lease lost, stopping auto extension");
                lost.store(true, Ordering::SeqCst);
                return;
            }
            Err(e) => {
                // 存储暂时不可用：只要租约还没到期就继续尝试
                if lease.remaining().is_zero() {
                    warn!(key = %lease.key(), error = %e, "Lease expired while extension kept failing");
                    lost.store(true, Ordering::SeqCst);
                    return;
                }
                warn!(key = %lease.key(), error = %e, "Lease extension failed, will retry");
            }
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        let HandleState::Acquired { lease, backend, .. } =
            std::mem::replace(&mut self.state, HandleState::Released)
        else {
            return;
        };

        // Drop 中无法等待异步操作：有运行时就在后台释放，否则只能等 TTL 过期
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                warn!(
                    lock_key = %self.key,
                    "LockHandle dropped without explicit release - releasing in background"
                );
                runtime.spawn(async move {
                    if let Err(e) = backend.release(&lease).await {
                        warn!(lock_key = %lease.key(), error = %e, "Background release failed");
                    }
                });
            }
            Err(_) => warn!(
                lock_key = %self.key,
                "LockHandle dropped without explicit release - lock will expire via TTL"
            ),
        }
    }
}
