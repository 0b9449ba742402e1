//! 分布式锁错误类型
//!
//! 注意"没拿到锁"不是错误：它以 `is_acquired() == false` 的句柄返回。
//! 这里只有参数错误、存储不可用和调用方取消三类。

use thiserror::Error;

use crate::store::StoreError;

/// 锁工厂错误类型
#[derive(Debug, Error)]
pub enum LockError {
    #[error("无效的参数: {field} - {message}")]
    InvalidArgument {
        field: &'static str,
        message: String,
    },

    /// 与存储通信失败，对调用方而言即"锁工厂错误"
    #[error("锁存储不可用: key={key}: {source}")]
    StoreUnavailable {
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("获取锁被取消: key={key}")]
    Cancelled { key: String },
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, LockError>;

impl LockError {
    pub(crate) fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            field,
            message: message.into(),
        }
    }

    pub(crate) fn unavailable(key: impl Into<String>, source: StoreError) -> Self {
        Self::StoreUnavailable {
            key: key.into(),
            source,
        }
    }

    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidArgument { .. } => "INVALID_ARGUMENT",
            Self::StoreUnavailable { .. } => "LOCK_STORE_UNAVAILABLE",
            Self::Cancelled { .. } => "CANCELLED",
        }
    }

    /// 是否为可重试错误
    ///
    /// 只有基础设施故障值得在上层重试；参数错误和取消都应直接返回。
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable { .. })
    }

    /// 是否为存储不可用（fail-open 装饰器据此放行）
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, Self::StoreUnavailable { .. })
    }
}
