//! 配置管理模块
//!
//! 支持多格式配置文件加载，环境变量覆盖，以及类型安全的配置访问。
//! 这里只负责把配置读成普通结构体，锁的核心类型由 `distlock` crate 自行转换。

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;

use crate::observability::ObservabilityConfig;

/// Redis 配置
///
/// `endpoints` 只有一个地址时使用单实例锁，多个地址时使用多数派（quorum）锁。
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub endpoints: Vec<String>,
    /// 锁 key 前缀，避免与业务缓存 key 冲突
    pub key_prefix: String,
    pub connect_timeout_ms: u64,
    /// 单条命令的超时时间，超时视为存储不可用
    pub command_timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["redis://localhost:6379".to_string()],
            key_prefix: "lock:".to_string(),
            connect_timeout_ms: 1_000,
            command_timeout_ms: 500,
        }
    }
}

/// 锁默认参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LockSettings {
    /// 默认租约时长
    pub default_ttl_ms: u64,
    /// 获取锁重试次数（不含首次尝试）
    pub retry_count: u32,
    /// 重试间隔
    pub retry_delay_ms: u64,
    /// 重试间隔抖动比例，取值 [0, 1]
    pub retry_jitter: f64,
    /// 存储不可用时是否放行（牺牲互斥换取可用性），必须显式开启
    pub fail_open: bool,
    /// 存储不可用时整体重新获取的次数，0 表示不启用
    pub unavailable_retry_count: u32,
    pub unavailable_retry_delay_ms: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            default_ttl_ms: 30_000,
            retry_count: 3,
            retry_delay_ms: 100,
            retry_jitter: 0.1,
            fail_open: false,
            unavailable_retry_count: 0,
            unavailable_retry_delay_ms: 200,
        }
    }
}

/// 多数派锁参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QuorumSettings {
    /// 时钟漂移安全余量
    pub validity_margin_ms: u64,
    /// 按租约比例计算的漂移系数
    pub clock_drift_factor: f64,
    /// 单个实例的调用超时，应远小于租约
    pub store_timeout_ms: u64,
}

impl Default for QuorumSettings {
    fn default() -> Self {
        Self {
            validity_margin_ms: 12,
            clock_drift_factor: 0.0,
            store_timeout_ms: 50,
        }
    }
}

/// 应用配置
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub service_name: String,
    pub environment: String,
    pub redis: RedisConfig,
    pub lock: LockSettings,
    pub quorum: QuorumSettings,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序（后加载的会覆盖先加载的同名配置项）：
    /// 1. .env 文件（若存在，仅用于填充进程环境变量）
    /// 2. config/default.toml（默认配置）
    /// 3. config/{environment}.toml（环境特定配置）
    /// 4. 环境变量（DISTLOCK_ 前缀，`__` 分隔层级，如 DISTLOCK_LOCK__DEFAULT_TTL_MS）
    pub fn load(service_name: &str) -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let env = std::env::var("DISTLOCK_ENV").unwrap_or_else(|_| "development".to_string());
        let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string());

        Self::builder(service_name, &env, Path::new(&config_dir))?
            .build()?
            .try_deserialize()
    }

    fn builder(
        service_name: &str,
        env: &str,
        config_dir: &Path,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        Ok(Config::builder()
            .set_default("service_name", service_name)?
            .set_default("environment", env)?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            .add_source(File::from(config_dir.join(format!("{}.toml", env))).required(false))
            // DISTLOCK_REDIS__ENDPOINTS=redis://a:6379,redis://b:6379
            .add_source(
                Environment::with_prefix("DISTLOCK")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("redis.endpoints")
                    .try_parsing(true),
            ))
    }

    /// 是否配置了多个 Redis 实例（使用多数派锁）
    pub fn uses_quorum(&self) -> bool {
        self.redis.endpoints.len() > 1
    }

    /// 是否为生产环境
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.redis.endpoints.len(), 1);
        assert_eq!(config.redis.key_prefix, "lock:");
        assert_eq!(config.lock.default_ttl_ms, 30_000);
        assert_eq!(config.lock.retry_count, 3);
        assert!(!config.lock.fail_open, "fail-open 必须默认关闭");
        assert!(!config.uses_quorum());
    }

    #[test]
    fn test_uses_quorum() {
        let config = AppConfig {
            redis: RedisConfig {
                endpoints: vec![
                    "redis://a:6379".to_string(),
                    "redis://b:6379".to_string(),
                    "redis://c:6379".to_string(),
                ],
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.uses_quorum());
    }

    #[test]
    fn test_load_from_toml_file() {
        let dir = std::env::temp_dir().join(format!("distlock-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("default.toml"),
            r#"
[lock]
default_ttl_ms = 5000
retry_count = 7
fail_open = true

[quorum]
store_timeout_ms = 20
"#,
        )
        .unwrap();

        let config: AppConfig = AppConfig::builder("lock-test", "test", &dir)
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.service_name, "lock-test");
        assert_eq!(config.environment, "test");
        assert_eq!(config.lock.default_ttl_ms, 5000);
        assert_eq!(config.lock.retry_count, 7);
        assert!(config.lock.fail_open);
        // 未出现的字段回落到默认值
        assert_eq!(config.lock.retry_delay_ms, 100);
        assert_eq!(config.quorum.store_timeout_ms, 20);
        assert_eq!(config.quorum.validity_margin_ms, 12);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
