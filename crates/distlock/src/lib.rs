//! 分布式锁
//!
//! 基于键值存储的分布式互斥锁，保证同一时刻对同一个 key 至多一个持有者，
//! 持有者崩溃后租约到期自动释放。
//!
//! ## 核心功能
//!
//! - **单实例锁**：一个存储上的 SET-IF-ABSENT + 按 token 原子删除
//! - **多数派锁**：N 个独立存储上的 RedLock 风格算法，容忍少数实例故障
//! - **重试调度**：锁被占用时按固定或指数退避等待，支持抖动
//! - **租约续期**：手动续期或后台自动续期
//! - **fail-open**：存储不可用时可选地放行（无互斥保证）
//!
//! ## 模块结构
//!
//! - `store`: 键值存储适配层（Redis、内存）
//! - `single`: 单实例锁
//! - `quorum`: 多数派锁
//! - `retry`: 重试策略与调度器
//! - `handle`: 锁句柄与租约
//! - `factory`: 锁工厂接口
//! - `fail_open` / `resilient`: 装饰器
//! - `service`: 按配置组装的锁服务
//!
//! ## 使用示例
//!
//! ```no_run
//! use std::time::Duration;
//! use distlock::{LockService, Result};
//! use distlock_shared::config::AppConfig;
//!
//! # async fn run() -> Result<()> {
//! let config = AppConfig::default();
//! let locks = LockService::from_config(&config)?;
//!
//! let mut handle = locks.acquire("order:1001").await?;
//! if handle.is_acquired() {
//!     // 临界区，时间预算以 handle.remaining_validity() 为准
//!     handle.release().await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod factory;
pub mod fail_open;
pub mod handle;
pub mod key;
pub mod quorum;
pub mod resilient;
pub mod retry;
pub mod service;
pub mod single;
pub mod store;

pub use error::{LockError, Result};
pub use factory::LockFactory;
pub use fail_open::FailOpenLockFactory;
pub use handle::{Lease, LeaseBackend, LockHandle};
pub use key::{LockKey, LockToken};
pub use quorum::{QuorumConfig, QuorumLock, quorum_size};
pub use resilient::ResilientLockFactory;
pub use retry::{Backoff, ConstantBackoff, ExponentialBackoff, RetryPolicy, RetryScheduler};
pub use service::{LockConfig, LockService};
pub use single::SingleStoreLock;
pub use store::{KeyValueStore, MemoryStore, RedisStore, StoreError};
