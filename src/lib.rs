//! Tock - 准点执行器
//!
//! 在精确的目标时刻执行一次关键动作，并在时刻前后自动恢复。
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 时钟、错误分类、重试、截止时刻调度、恢复、执行协调与分发
//! - **schedule**: 调度条目与校验
//! - **report**: 结果投递（审计日志 / JSON Lines / Webhook）
//! - **rehearsal**: 演练用 Workload
//! - **browser**: Headless Chrome 适配（feature "browser"）
//! - **observability**: 日志初始化

#[cfg(feature = "browser")]
pub mod browser;
pub mod config;
pub mod core;
pub mod observability;
pub mod rehearsal;
pub mod report;
pub mod schedule;

pub use crate::core::{ExecutionCoordinator, ExecutionResult};
pub use schedule::Schedule;
