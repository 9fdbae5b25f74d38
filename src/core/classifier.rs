//! 错误分类器
//!
//! 外部失败以非结构化文本到达（第三方页面、浏览器驱动），这里是唯一做字符串匹配的地方。
//! 关键字表按分组优先级排列：network → authentication → ui-navigation → reservation-state
//! → environment → timing → configuration，首个命中即返回；无命中为 unknown。

use std::time::Duration;

use serde::{Serialize, Serializer};

use crate::core::error::{ActionError, FailureCategory};

/// 重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    NoRetry,
    /// 零延迟
    ImmediateRetry,
    /// 延迟 × 第几次
    LinearBackoff,
    /// 延迟 × 2^(n-1)，受 max_delay 限制
    ExponentialBackoff,
    /// 近零延迟，只在调用方给定的截止时刻之前允许
    DeadlineAwareRetry,
}

/// 类别对应的重试描述
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetryPolicy {
    pub category: FailureCategory,
    pub strategy: RetryStrategy,
    /// 允许的重试次数（不含首次尝试）
    pub max_attempts: u32,
    #[serde(rename = "base_delay_ms", serialize_with = "serialize_ms")]
    pub base_delay: Duration,
    /// 关键类别：即使策略允许也不重试，ImmediateRetry 除外
    pub is_critical: bool,
}

impl RetryPolicy {
    const fn new(
        category: FailureCategory,
        strategy: RetryStrategy,
        max_attempts: u32,
        base_delay_ms: u64,
        is_critical: bool,
    ) -> Self {
        Self {
            category,
            strategy,
            max_attempts,
            base_delay: Duration::from_millis(base_delay_ms),
            is_critical,
        }
    }

    /// 该类别是否允许至少再试一次
    pub fn permits_retry(&self) -> bool {
        if self.strategy == RetryStrategy::NoRetry || self.max_attempts == 0 {
            return false;
        }
        !self.is_critical || self.strategy == RetryStrategy::ImmediateRetry
    }
}

pub(crate) fn serialize_ms<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// 关键字表（全部小写），顺序即优先级
const KEYWORD_TABLE: &[(FailureCategory, &[&str])] = &[
    // network
    (
        FailureCategory::NetworkTimeout,
        &["net::err_timed_out", "etimedout", "timed out", "timeout"],
    ),
    (
        FailureCategory::ConnectionRefused,
        &[
            "connection refused",
            "econnrefused",
            "connection reset",
            "econnreset",
            "net::err_connection",
            "socket hang up",
        ],
    ),
    (
        FailureCategory::DnsFailure,
        &["enotfound", "net::err_name_not_resolved", "dns", "name resolution"],
    ),
    (
        FailureCategory::ServerError,
        &[
            "internal server error",
            "bad gateway",
            "service unavailable",
            "gateway timeout",
            "status 500",
            "status 502",
            "status 503",
            "status 504",
        ],
    ),
    // authentication
    (
        FailureCategory::InvalidCredentials,
        &[
            "invalid credentials",
            "incorrect password",
            "wrong password",
            "invalid password",
            "invalid username",
            "login failed",
        ],
    ),
    (
        FailureCategory::SessionExpired,
        &[
            "session expired",
            "session has expired",
            "not logged in",
            "please log in",
            "unauthorized",
            "status 401",
        ],
    ),
    (
        FailureCategory::AccountLocked,
        &["account locked", "account disabled", "too many login attempts"],
    ),
    // ui-navigation
    (
        FailureCategory::ElementNotFound,
        &[
            "element not found",
            "no node found",
            "no such element",
            "could not find element",
            "selector not found",
            "waited for never came",
        ],
    ),
    (
        FailureCategory::ElementNotInteractable,
        &[
            "not clickable",
            "not interactable",
            "not visible",
            "click intercepted",
            "detached from",
        ],
    ),
    (
        FailureCategory::PageLoadFailed,
        &["navigation failed", "page load", "net::err_aborted", "failed to navigate"],
    ),
    (
        FailureCategory::UnexpectedPopup,
        &["popup", "modal", "overlay", "interstitial", "cookie banner"],
    ),
    // reservation-state
    (
        FailureCategory::AlreadyBooked,
        &[
            "already booked",
            "already registered",
            "already enrolled",
            "already reserved",
            "already signed up",
        ],
    ),
    (
        FailureCategory::NoSpotsAvailable,
        &[
            "no spots",
            "no places",
            "class full",
            "class is full",
            "fully booked",
            "sold out",
            "waitlist",
        ],
    ),
    (
        FailureCategory::BookingWindowClosed,
        &[
            "not yet open",
            "booking window",
            "booking closed",
            "registration closed",
            "opens at",
        ],
    ),
    (
        FailureCategory::ClassNotFound,
        &["class not found", "no such class", "course not found"],
    ),
    // environment
    (
        FailureCategory::BrowserCrashed,
        &[
            "browser crashed",
            "tab crashed",
            "target closed",
            "connection is closed",
            "browser has disconnected",
        ],
    ),
    (
        FailureCategory::BrowserLaunchFailed,
        &[
            "failed to launch",
            "chrome launch",
            "could not auto detect a chrome executable",
            "executable not found",
        ],
    ),
    (
        FailureCategory::ResourceExhausted,
        &["out of memory", "too many open files", "no space left"],
    ),
    // timing
    (
        FailureCategory::TimingMissed,
        &["too late", "deadline passed", "missed deadline", "clock skew"],
    ),
    (
        FailureCategory::ScheduleExpired,
        &["schedule expired", "in the past"],
    ),
    // configuration
    (
        FailureCategory::InvalidConfiguration,
        &[
            "invalid configuration",
            "missing configuration",
            "config error",
            "missing environment variable",
            "invalid url",
            "relative url without a base",
        ],
    ),
];

/// 无状态分类器：classify 全函数、确定性、不会失败
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    /// 文本 → 类别
    pub fn classify(&self, message: &str) -> FailureCategory {
        let lowered = message.to_lowercase();
        if lowered.trim().is_empty() {
            return FailureCategory::Unknown;
        }
        KEYWORD_TABLE
            .iter()
            .find(|(_, keywords)| keywords.iter().any(|k| lowered.contains(k)))
            .map(|(category, _)| *category)
            .unwrap_or(FailureCategory::Unknown)
    }

    /// 失败值 → 类别；调用方给出的类别优先
    pub fn categorize(&self, error: &ActionError) -> FailureCategory {
        error
            .category_hint()
            .unwrap_or_else(|| self.classify(error.message()))
    }

    /// 类别 → 重试策略（静态表）
    pub fn policy(&self, category: FailureCategory) -> RetryPolicy {
        use FailureCategory::*;
        use RetryStrategy::*;
        match category {
            NetworkTimeout => RetryPolicy::new(category, ExponentialBackoff, 3, 1000, false),
            ConnectionRefused => RetryPolicy::new(category, ExponentialBackoff, 3, 2000, false),
            DnsFailure => RetryPolicy::new(category, LinearBackoff, 2, 2000, false),
            ServerError => RetryPolicy::new(category, ExponentialBackoff, 3, 1500, false),

            InvalidCredentials => RetryPolicy::new(category, NoRetry, 0, 0, true),
            // 会话丢失允许立即重登一次
            SessionExpired => RetryPolicy::new(category, ImmediateRetry, 1, 0, true),
            AccountLocked => RetryPolicy::new(category, NoRetry, 0, 0, true),

            ElementNotFound => RetryPolicy::new(category, LinearBackoff, 3, 500, false),
            ElementNotInteractable => RetryPolicy::new(category, LinearBackoff, 3, 300, false),
            PageLoadFailed => RetryPolicy::new(category, ExponentialBackoff, 2, 1000, false),
            UnexpectedPopup => RetryPolicy::new(category, ImmediateRetry, 2, 0, false),

            AlreadyBooked => RetryPolicy::new(category, NoRetry, 0, 0, false),
            NoSpotsAvailable => RetryPolicy::new(category, NoRetry, 0, 0, false),
            BookingWindowClosed => RetryPolicy::new(category, DeadlineAwareRetry, 5, 100, false),
            ClassNotFound => RetryPolicy::new(category, LinearBackoff, 2, 1000, false),

            BrowserCrashed => RetryPolicy::new(category, LinearBackoff, 2, 2000, false),
            BrowserLaunchFailed => RetryPolicy::new(category, LinearBackoff, 2, 3000, false),
            ResourceExhausted => RetryPolicy::new(category, NoRetry, 0, 0, false),

            TimingMissed => RetryPolicy::new(category, NoRetry, 0, 0, true),
            ScheduleExpired => RetryPolicy::new(category, NoRetry, 0, 0, true),
            PreparationTimeout => RetryPolicy::new(category, NoRetry, 0, 0, true),

            InvalidConfiguration => RetryPolicy::new(category, NoRetry, 0, 0, false),

            // 保守：有限、短
            Unknown => RetryPolicy::new(category, LinearBackoff, 2, 1000, false),
        }
    }

    pub fn policy_for(&self, error: &ActionError) -> RetryPolicy {
        self.policy(self.categorize(error))
    }
}
