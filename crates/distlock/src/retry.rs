//! 重试策略与调度器
//!
//! 获取锁时 key 已被占用属于正常竞争，按策略等待后再试即可。
//! 退避函数通过 [`Backoff`] trait 注入：默认固定间隔，也可替换为指数退避，
//! 调用方（获取循环）无需任何改动。抖动使用注入的随机数生成器，测试中可固定种子。

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;

use crate::error::{LockError, Result};

// ---------------------------------------------------------------------------
// Backoff: 退避函数
// ---------------------------------------------------------------------------

/// 退避函数：第 N 次重试（从 0 开始）前的基础等待时间
pub trait Backoff: Send + Sync + fmt::Debug {
    fn delay(&self, attempt: u32) -> Duration;
}

/// 固定间隔
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstantBackoff {
    pub delay: Duration,
}

impl Backoff for ConstantBackoff {
    fn delay(&self, _attempt: u32) -> Duration {
        self.delay
    }
}

/// 指数退避
///
/// 公式: initial_delay * multiplier^attempt，结果不超过 max_delay。
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Backoff for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let delay_ms = base_ms * self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }
}

// ---------------------------------------------------------------------------
// RetryPolicy: 重试策略配置
// ---------------------------------------------------------------------------

/// 重试策略配置
///
/// 总尝试次数为 `1 + max_retries`（首次尝试加重试）。
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 最大重试次数（不含首次执行）
    pub max_retries: u32,
    /// 抖动比例：实际等待在 `delay * (1 - jitter)` 到 `delay * (1 + jitter)` 之间均匀分布
    pub jitter: f64,
    backoff: Arc<dyn Backoff>,
}

impl Default for RetryPolicy {
    /// 默认策略：最多重试 3 次，固定间隔 100 毫秒，不加抖动
    fn default() -> Self {
        Self::constant(3, Duration::from_millis(100))
    }
}

impl RetryPolicy {
    /// 只尝试一次
    pub fn none() -> Self {
        Self::constant(0, Duration::ZERO)
    }

    pub fn constant(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            jitter: 0.0,
            backoff: Arc::new(ConstantBackoff { delay }),
        }
    }

    pub fn exponential(
        max_retries: u32,
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
    ) -> Self {
        Self {
            max_retries,
            jitter: 0.0,
            backoff: Arc::new(ExponentialBackoff {
                initial_delay,
                max_delay,
                multiplier,
            }),
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// 替换退避函数
    pub fn with_backoff(mut self, backoff: impl Backoff + 'static) -> Self {
        self.backoff = Arc::new(backoff);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !self.jitter.is_finite() || !(0.0..=1.0).contains(&self.jitter) {
            return Err(LockError::invalid(
                "retry.jitter",
                format!("jitter must be within [0, 1], got {}", self.jitter),
            ));
        }
        Ok(())
    }

    /// 总尝试次数
    pub fn total_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// 是否应继续重试
    ///
    /// attempt 表示已经重试过的次数，当 attempt < max_retries 时返回 true。
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// 不含抖动的基础等待时间
    pub fn base_delay(&self, attempt: u32) -> Duration {
        self.backoff.delay(attempt)
    }

    /// 计算第 N 次重试的等待时间（attempt 从 0 开始）
    ///
    /// 每次调用独立取样，除 attempt 外不依赖任何历史状态。
    pub fn delay_for_attempt<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }

        let factor = 1.0 + rng.random_range(-self.jitter..=self.jitter);
        Duration::try_from_secs_f64(base.as_secs_f64() * factor).unwrap_or(base)
    }

    /// 创建使用系统熵源的调度器
    pub fn scheduler(&self) -> RetryScheduler<StdRng> {
        self.scheduler_with_rng(StdRng::from_os_rng())
    }

    /// 创建使用指定随机数生成器的调度器
    pub fn scheduler_with_rng<R: Rng>(&self, rng: R) -> RetryScheduler<R> {
        RetryScheduler {
            policy: self.clone(),
            rng,
            retries: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// RetryScheduler: 按策略依次给出等待时间
// ---------------------------------------------------------------------------

/// 重试调度器
///
/// 每次 `next_delay` 消耗一次重试额度，额度用完后返回 `None`。
#[derive(Debug)]
pub struct RetryScheduler<R = StdRng> {
    policy: RetryPolicy,
    rng: R,
    retries: u32,
}

impl<R: Rng> RetryScheduler<R> {
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.policy.should_retry(self.retries) {
            return None;
        }
        let delay = self.policy.delay_for_attempt(self.retries, &mut self.rng);
        self.retries += 1;
        Some(delay)
    }

    /// 已经发放的重试次数
    pub fn retries(&self) -> u32 {
        self.retries
    }
}

/// 等待指定时长，期间观察取消信号；被取消时返回 false
pub(crate) async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

// ---------------------------------------------------------------------------
// 单元测试
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_retry_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.total_attempts(), 4);
        assert_eq!(policy.base_delay(0), Duration::from_millis(100));
        assert_eq!(policy.base_delay(7), Duration::from_millis(100));
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_exponential_backoff_capped() {
        let policy = RetryPolicy::exponential(
            10,
            Duration::from_secs(1),
            Duration::from_secs(5),
            2.0,
        );

        assert_eq!(policy.base_delay(0), Duration::from_secs(1));
        assert_eq!(policy.base_delay(1), Duration::from_secs(2));
        assert_eq!(policy.base_delay(2), Duration::from_secs(4));
        // 8s -> 受限于 max_delay -> 5s
        assert_eq!(policy.base_delay(3), Duration::from_secs(5));
        assert_eq!(policy.base_delay(10), Duration::from_secs(5));
    }

    #[test]
    fn test_custom_backoff_is_pluggable() {
        #[derive(Debug)]
        struct Linear;
        impl Backoff for Linear {
            fn delay(&self, attempt: u32) -> Duration {
                Duration::from_millis(10 * (attempt as u64 + 1))
            }
        }

        let policy = RetryPolicy::constant(3, Duration::from_secs(9)).with_backoff(Linear);
        let mut scheduler = policy.scheduler_with_rng(StdRng::seed_from_u64(1));
        assert_eq!(scheduler.next_delay(), Some(Duration::from_millis(10)));
        assert_eq!(scheduler.next_delay(), Some(Duration::from_millis(20)));
        assert_eq!(scheduler.next_delay(), Some(Duration::from_millis(30)));
        assert_eq!(scheduler.next_delay(), None);
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::constant(1, Duration::from_millis(100)).with_jitter(0.2);
        let mut rng = StdRng::seed_from_u64(42);

        for attempt in 0..1_000 {
            let delay = policy.delay_for_attempt(attempt, &mut rng);
            assert!(delay >= Duration::from_millis(80), "{:?} too short", delay);
            assert!(delay <= Duration::from_millis(120), "{:?} too long", delay);
        }
    }

    #[test]
    fn test_jitter_is_deterministic_with_seed() {
        let policy = RetryPolicy::constant(5, Duration::from_millis(100)).with_jitter(0.5);

        let first: Vec<_> = {
            let mut s = policy.scheduler_with_rng(StdRng::seed_from_u64(7));
            std::iter::from_fn(|| s.next_delay()).collect()
        };
        let second: Vec<_> = {
            let mut s = policy.scheduler_with_rng(StdRng::seed_from_u64(7));
            std::iter::from_fn(|| s.next_delay()).collect()
        };

        assert_eq!(first.len(), 5);
        assert_eq!(first, second);
    }

    #[test]
    fn test_zero_jitter_returns_exact_delay() {
        let policy = RetryPolicy::constant(2, Duration::from_millis(250));
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(policy.delay_for_attempt(0, &mut rng), Duration::from_millis(250));
    }

    #[test]
    fn test_scheduler_exhausts_after_max_retries() {
        let policy = RetryPolicy::constant(3, Duration::from_millis(100));
        let mut scheduler = policy.scheduler_with_rng(StdRng::seed_from_u64(3));

        assert!(scheduler.next_delay().is_some());
        assert!(scheduler.next_delay().is_some());
        assert!(scheduler.next_delay().is_some());
        assert_eq!(scheduler.next_delay(), None);
        assert_eq!(scheduler.retries(), 3);

        let mut none = RetryPolicy::none().scheduler();
        assert_eq!(none.next_delay(), None);
    }

    #[test]
    fn test_validate_rejects_bad_jitter() {
        assert!(RetryPolicy::default().with_jitter(1.5).validate().is_err());
        assert!(RetryPolicy::default().with_jitter(-0.1).validate().is_err());
        assert!(RetryPolicy::default().with_jitter(f64::NAN).validate().is_err());
        assert!(RetryPolicy::default().with_jitter(1.0).validate().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_or_cancel() {
        let cancel = CancellationToken::new();
        assert!(sleep_or_cancel(Duration::from_secs(1), &cancel).await);

        cancel.cancel();
        let started = tokio::time::Instant::now();
        assert!(!sleep_or_cancel(Duration::from_secs(60), &cancel).await);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
