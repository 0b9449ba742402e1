//! 锁标识与所有权令牌

use std::fmt;
use std::time::Duration;

use uuid::Uuid;

use crate::error::{LockError, Result};

/// 被争用资源的名称，保证非空且不全为空白
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey(String);

impl LockKey {
    pub fn new(key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(LockError::invalid("key", "lock key must not be blank"));
        }
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for LockKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// 所有权令牌
///
/// 每次获取尝试都生成新的随机 128 位值。只有持有当前存储值的一方才能删除或续期。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 校验租约时长
///
/// 存储以毫秒为精度设置过期时间，小于 1ms 的租约会被当成 0 处理，因此同样拒绝。
pub(crate) fn validate_ttl(ttl: Duration) -> Result<()> {
    if ttl.is_zero() {
        return Err(LockError::invalid("ttl", "lease duration must be positive"));
    }
    if ttl < Duration::from_millis(1) {
        return Err(LockError::invalid(
            "ttl",
            "lease duration must be at least 1ms",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_key_rejects_blank() {
        assert!(LockKey::new("").is_err());
        assert!(LockKey::new("   \t").is_err());

        let err = LockKey::new("").unwrap_err();
        assert_eq!(err.code(), "INVALID_ARGUMENT");
    }

    #[test]
    fn test_lock_key_keeps_original_text() {
        let key = LockKey::new("redeem:user123:badge456").unwrap();
        assert_eq!(key.as_str(), "redeem:user123:badge456");
        assert_eq!(key.to_string(), "redeem:user123:badge456");
    }

    #[test]
    fn test_token_uniqueness() {
        let a = LockToken::generate();
        let b = LockToken::generate();
        assert_ne!(a, b);
        assert!(Uuid::parse_str(a.as_str()).is_ok());
    }

    #[test]
    fn test_validate_ttl() {
        assert!(validate_ttl(Duration::ZERO).is_err());
        assert!(validate_ttl(Duration::from_micros(500)).is_err());
        assert!(validate_ttl(Duration::from_millis(1)).is_ok());
        assert!(validate_ttl(Duration::from_secs(30)).is_ok());
    }
}
