//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 未安装 recorder 时记录函数是空操作，库代码可以无条件调用。

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

use super::ObservabilityConfig;

/// 安装 Prometheus recorder 并在指定端口暴露 `/metrics`
pub fn init(config: &ObservabilityConfig) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .add_global_label("service", config.service_name.clone())
        .install()?;

    describe_lock_metrics();
    info!("Metrics exporter listening on {}", addr);

    Ok(())
}

fn describe_lock_metrics() {
    metrics::describe_counter!("distlock_acquire_total", "Total number of lock acquisitions");
    metrics::describe_histogram!(
        "distlock_acquire_duration_seconds",
        "Time spent acquiring a lock, including retries"
    );
    metrics::describe_counter!("distlock_release_total", "Total number of lock releases");
    metrics::describe_counter!(
        "distlock_extend_total",
        "Total number of lease extension attempts"
    );
    metrics::describe_counter!(
        "distlock_fail_open_total",
        "Permissive handles handed out while the store was unavailable"
    );
    metrics::describe_counter!(
        "distlock_quorum_store_failures_total",
        "Per-instance failures during quorum operations"
    );
}

// ============================================================================
// 便捷的指标记录函数
// ============================================================================

/// 记录一次获取锁（outcome: acquired / not_acquired / unavailable / cancelled / invalid）
#[inline]
pub fn record_lock_acquire(backend: &str, outcome: &str, attempts: u32, duration_secs: f64) {
    metrics::counter!(
        "distlock_acquire_total",
        "backend" => backend.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);

    metrics::histogram!(
        "distlock_acquire_duration_seconds",
        "backend" => backend.to_string(),
        "outcome" => outcome.to_string()
    )
    .record(duration_secs);

    metrics::histogram!(
        "distlock_acquire_attempts",
        "backend" => backend.to_string()
    )
    .record(attempts as f64);
}

/// 记录释放锁
#[inline]
pub fn record_lock_release(backend: &str, released: bool) {
    metrics::counter!(
        "distlock_release_total",
        "backend" => backend.to_string(),
        "released" => released.to_string()
    )
    .increment(1);
}

/// 记录租约续期
#[inline]
pub fn record_lease_extend(backend: &str, extended: bool) {
    metrics::counter!(
        "distlock_extend_total",
        "backend" => backend.to_string(),
        "extended" => extended.to_string()
    )
    .increment(1);
}

/// 记录 fail-open 放行
#[inline]
pub fn record_fail_open() {
    metrics::counter!("distlock_fail_open_total").increment(1);
}

/// 记录多数派操作中单个实例的失败
#[inline]
pub fn record_quorum_store_failure(store: &str, operation: &str) {
    metrics::counter!(
        "distlock_quorum_store_failures_total",
        "store" => store.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}
