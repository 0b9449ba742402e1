//! 共享库
//!
//! 包含分布式锁相关进程共用的配置加载与可观测性初始化代码。

pub mod config;
pub mod observability;
