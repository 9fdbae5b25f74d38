//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `TOCK__*` 覆盖（双下划线表示嵌套，如 `TOCK__RETRY__MAX_RETRIES=5`）。
//! 加载与校验只在启动时做一次，之后以显式值传给协调器。

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::core::clock::SystemClock;
use crate::core::coordinator::CoordinatorSettings;
use crate::core::retry::RetryOptions;
use crate::schedule::{validate_all, Schedule, ScheduleError};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub timing: TimingSection,
    pub retry: RetrySection,
    pub recovery: RecoverySection,
    pub report: ReportSection,
    pub browser: BrowserSection,
    pub schedules: Vec<ScheduleEntry>,
}

/// [timing] 段：等待精度与准备余量
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimingSection {
    /// 粗等待在目标前留出的余量
    pub coarse_margin_ms: u64,
    /// 细轮询间隔
    pub fine_poll_ms: u64,
    /// Schedule 未指定 buffer_secs 时使用
    pub default_buffer_secs: u64,
    /// 准备失败后仍可重新准备所需的最小余量
    pub min_preparation_slack_secs: u64,
    pub accuracy_warn_ms: u64,
}

impl Default for TimingSection {
    fn default() -> Self {
        Self {
            coarse_margin_ms: 1000,
            fine_poll_ms: 1,
            default_buffer_secs: 120,
            min_preparation_slack_secs: 10,
            accuracy_warn_ms: 50,
        }
    }
}

/// [retry] 段：准备阶段重试参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_retries: u32,
    /// 设置后覆盖每个类别自带的基础延迟；缺省使用类别策略表
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
    pub total_timeout_secs: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: None,
            max_delay_ms: 5000,
            jitter_ms: 250,
            total_timeout_secs: 60,
        }
    }
}

/// [recovery] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecoverySection {
    /// 单个检测 / 修复步骤的超时
    pub probe_timeout_secs: u64,
    /// 资源释放超时
    pub cleanup_timeout_secs: u64,
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            probe_timeout_secs: 3,
            cleanup_timeout_secs: 10,
        }
    }
}

/// [report] 段：结果投递
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReportSection {
    pub jsonl_path: Option<PathBuf>,
    pub webhook_url: Option<String>,
    pub webhook_timeout_secs: u64,
}

impl Default for ReportSection {
    fn default() -> Self {
        Self {
            jsonl_path: None,
            webhook_url: None,
            webhook_timeout_secs: 10,
        }
    }
}

/// [browser] 段：全部选择器来自配置，代码里不写死任何站点结构
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrowserSection {
    pub start_url: Option<String>,
    pub headless: bool,
    /// 准备完成的标志元素
    pub ready_selector: Option<String>,
    /// 关键动作点击的元素
    pub action_selector: Option<String>,
    /// 点击后读取结果文本的元素
    pub status_selector: Option<String>,
    /// 结果文本必须包含的成功标志（不区分大小写）
    pub success_marker: Option<String>,
    /// 出现即点击关闭的弹窗按钮，按优先级排列
    pub interstitial_selectors: Vec<String>,
    /// 出现即说明会话已丢失（如登录表单）
    pub login_marker_selector: Option<String>,
    /// action_selector 找不到时依次尝试
    pub fallback_action_selectors: Vec<String>,
    /// 元素等待超时
    pub element_timeout_ms: u64,
}

impl Default for BrowserSection {
    fn default() -> Self {
        Self {
            start_url: None,
            headless: true,
            ready_selector: None,
            action_selector: None,
            status_selector: None,
            success_marker: None,
            interstitial_selectors: Vec::new(),
            login_marker_selector: None,
            fallback_action_selectors: Vec::new(),
            element_timeout_ms: 5000,
        }
    }
}

/// [[schedules]] 条目
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleEntry {
    pub id: String,
    /// RFC 3339，如 "2026-11-02T07:00:00+08:00"
    pub target: DateTime<Utc>,
    pub buffer_secs: Option<u64>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl AppConfig {
    /// 转为协调器参数
    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            min_preparation_slack: Duration::from_secs(self.timing.min_preparation_slack_secs),
            accuracy_warn: Duration::from_millis(self.timing.accuracy_warn_ms),
            retry: RetryOptions {
                max_retries: self.retry.max_retries,
                base_delay: self.retry.base_delay_ms.map(Duration::from_millis),
                max_delay: Duration::from_millis(self.retry.max_delay_ms),
                jitter: Duration::from_millis(self.retry.jitter_ms),
                total_timeout: Duration::from_secs(self.retry.total_timeout_secs),
                deadline: None,
            },
            cleanup_timeout: Duration::from_secs(self.recovery.cleanup_timeout_secs),
        }
    }

    pub fn system_clock(&self) -> SystemClock {
        SystemClock::new(
            Duration::from_millis(self.timing.coarse_margin_ms),
            Duration::from_millis(self.timing.fine_poll_ms),
        )
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery.probe_timeout_secs)
    }

    /// 校验并转为 Schedule 列表；未指定 buffer 的条目使用 timing.default_buffer_secs
    pub fn schedules(&self) -> Result<Vec<Schedule>, ScheduleError> {
        let schedules: Vec<Schedule> = self
            .schedules
            .iter()
            .map(|entry| Schedule {
                id: entry.id.trim().to_string(),
                target: entry.target,
                buffer_secs: entry.buffer_secs.unwrap_or(self.timing.default_buffer_secs),
                enabled: entry.enabled,
            })
            .collect();
        validate_all(&schedules)?;
        Ok(schedules)
    }
}

/// 从 config 目录加载配置，环境变量 TOCK__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 TOCK__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        } else {
            tracing::warn!("config file {} not found, using defaults", path.display());
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("TOCK")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
