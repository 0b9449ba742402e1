//! 分布式锁命令行工具
//!
//! 在配置的 Redis 上获取一把锁并持有指定时长，用于排查锁竞争和验证部署：
//!
//! ```text
//! distlock-cli <key> [hold_ms]
//! ```
//!
//! 持有期间启用自动续期，Ctrl+C 提前释放。

use std::time::Duration;

use anyhow::{Context, Result, bail};
use distlock::LockService;
use distlock_shared::config::AppConfig;
use distlock_shared::observability::{self, ObservabilityConfig};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const SERVICE_NAME: &str = "distlock-cli";
const DEFAULT_HOLD_MS: u64 = 5_000;

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let Some(key) = args.next() else {
        bail!("usage: distlock-cli <key> [hold_ms]");
    };
    let hold = match args.next() {
        Some(ms) => Duration::from_millis(ms.parse().context("hold_ms must be an integer")?),
        None => Duration::from_millis(DEFAULT_HOLD_MS),
    };

    // 1. 加载配置，失败时锁参数用默认值，可观测性读环境变量
    let (config, obs_config) = match AppConfig::load(SERVICE_NAME) {
        Ok(config) => {
            let mut obs_config = config.observability.clone();
            obs_config.service_name = config.service_name.clone();
            (config, obs_config)
        }
        Err(e) => {
            eprintln!("Failed to load config, using defaults: {}", e);
            (AppConfig::default(), ObservabilityConfig::from_env(SERVICE_NAME))
        }
    };

    // 2. 初始化可观测性
    observability::init(&obs_config)?;

    info!(
        environment = %config.environment,
        endpoints = config.redis.endpoints.len(),
        "Configuration loaded"
    );

    // 3. 组装锁服务
    let locks = LockService::from_config(&config)?;

    // 等待期间 Ctrl+C 取消获取
    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            shutdown.cancel();
        }
    });

    let mut handle = locks.acquire_with(&key, None, &cancel).await?;
    if !handle.is_acquired() {
        warn!(key = %key, "Lock is held by another client");
        return Ok(());
    }

    info!(
        key = %key,
        fail_open = handle.is_fail_open(),
        validity_ms = handle.remaining_validity().map(|d| d.as_millis() as u64),
        hold_ms = hold.as_millis() as u64,
        "Lock acquired"
    );
    handle.enable_auto_extend(None);

    tokio::select! {
        _ = tokio::time::sleep(hold) => {}
        _ = cancel.cancelled() => info!("Received shutdown signal, releasing early"),
    }

    if handle.is_lease_lost() {
        warn!(key = %key, "Lease was lost while holding the lock");
    }
    let released = handle.release().await?;
    info!(key = %key, released, "Lock released");

    Ok(())
}
