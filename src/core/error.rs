//! 失败类型与分类
//!
//! Preparer / CriticalAction 抛出的失败统一为 ActionError；ErrorClassifier 将其映射为 FailureCategory，
//! 再按类别查出重试策略。

use std::any::Any;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 失败类别（约 20 个），按所属分组决定关键字匹配优先级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    // network
    NetworkTimeout,
    ConnectionRefused,
    DnsFailure,
    ServerError,
    // authentication
    InvalidCredentials,
    SessionExpired,
    AccountLocked,
    // ui-navigation
    ElementNotFound,
    ElementNotInteractable,
    PageLoadFailed,
    UnexpectedPopup,
    // reservation-state
    AlreadyBooked,
    NoSpotsAvailable,
    BookingWindowClosed,
    ClassNotFound,
    // environment / browser
    BrowserCrashed,
    BrowserLaunchFailed,
    ResourceExhausted,
    // timing
    TimingMissed,
    ScheduleExpired,
    PreparationTimeout,
    // configuration
    InvalidConfiguration,
    Unknown,
}

/// 类别分组；声明顺序即关键字匹配优先级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CategoryGroup {
    Network,
    Authentication,
    UiNavigation,
    ReservationState,
    Environment,
    Timing,
    Configuration,
    Unknown,
}

impl FailureCategory {
    pub const ALL: [FailureCategory; 23] = [
        FailureCategory::NetworkTimeout,
        FailureCategory::ConnectionRefused,
        FailureCategory::DnsFailure,
        FailureCategory::ServerError,
        FailureCategory::InvalidCredentials,
        FailureCategory::SessionExpired,
        FailureCategory::AccountLocked,
        FailureCategory::ElementNotFound,
        FailureCategory::ElementNotInteractable,
        FailureCategory::PageLoadFailed,
        FailureCategory::UnexpectedPopup,
        FailureCategory::AlreadyBooked,
        FailureCategory::NoSpotsAvailable,
        FailureCategory::BookingWindowClosed,
        FailureCategory::ClassNotFound,
        FailureCategory::BrowserCrashed,
        FailureCategory::BrowserLaunchFailed,
        FailureCategory::ResourceExhausted,
        FailureCategory::TimingMissed,
        FailureCategory::ScheduleExpired,
        FailureCategory::PreparationTimeout,
        FailureCategory::InvalidConfiguration,
        FailureCategory::Unknown,
    ];

    pub fn group(self) -> CategoryGroup {
        use FailureCategory::*;
        match self {
            NetworkTimeout | ConnectionRefused | DnsFailure | ServerError => CategoryGroup::Network,
            InvalidCredentials | SessionExpired | AccountLocked => CategoryGroup::Authentication,
            ElementNotFound | ElementNotInteractable | PageLoadFailed | UnexpectedPopup => {
                CategoryGroup::UiNavigation
            }
            AlreadyBooked | NoSpotsAvailable | BookingWindowClosed | ClassNotFound => {
                CategoryGroup::ReservationState
            }
            BrowserCrashed | BrowserLaunchFailed | ResourceExhausted => CategoryGroup::Environment,
            TimingMissed | ScheduleExpired | PreparationTimeout => CategoryGroup::Timing,
            InvalidConfiguration => CategoryGroup::Configuration,
            Unknown => CategoryGroup::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        use FailureCategory::*;
        match self {
            NetworkTimeout => "network_timeout",
            ConnectionRefused => "connection_refused",
            DnsFailure => "dns_failure",
            ServerError => "server_error",
            InvalidCredentials => "invalid_credentials",
            SessionExpired => "session_expired",
            AccountLocked => "account_locked",
            ElementNotFound => "element_not_found",
            ElementNotInteractable => "element_not_interactable",
            PageLoadFailed => "page_load_failed",
            UnexpectedPopup => "unexpected_popup",
            AlreadyBooked => "already_booked",
            NoSpotsAvailable => "no_spots_available",
            BookingWindowClosed => "booking_window_closed",
            ClassNotFound => "class_not_found",
            BrowserCrashed => "browser_crashed",
            BrowserLaunchFailed => "browser_launch_failed",
            ResourceExhausted => "resource_exhausted",
            TimingMissed => "timing_missed",
            ScheduleExpired => "schedule_expired",
            PreparationTimeout => "preparation_timeout",
            InvalidConfiguration => "invalid_configuration",
            Unknown => "unknown",
        }
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Preparer / CriticalAction / 恢复探针抛出的失败
///
/// - `Failed`：普通失败，文本来自第三方页面或驱动，可附带调用方已知的类别
/// - `Panicked`：操作内部 panic，被执行器捕获
/// - `Opaque`：没有任何描述的失败值
///
/// 后两者一律归为 `unknown`，不参与关键字匹配。
#[derive(Error, Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionError {
    #[error("{message}")]
    Failed {
        message: String,
        category: Option<FailureCategory>,
    },

    #[error("operation panicked: {message}")]
    Panicked { message: String },

    #[error("unspecified failure")]
    Opaque,
}

impl ActionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            category: None,
        }
    }

    /// 调用方已确定类别时使用，跳过关键字匹配
    pub fn categorized(category: FailureCategory, message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            category: Some(category),
        }
    }

    pub fn opaque() -> Self {
        Self::Opaque
    }

    /// 由 catch_unwind 的 payload 构造；非字符串 payload 得到空描述
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        Self::Panicked {
            message: panic_message(payload.as_ref()).unwrap_or_default(),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Failed { message, .. } | Self::Panicked { message } => message,
            Self::Opaque => "",
        }
    }

    pub fn category_hint(&self) -> Option<FailureCategory> {
        match self {
            Self::Failed { category, .. } => *category,
            Self::Panicked { .. } | Self::Opaque => Some(FailureCategory::Unknown),
        }
    }
}

impl From<anyhow::Error> for ActionError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format!("{err:#}"))
    }
}

/// 提取 panic payload 中的文本（&str 或 String）
pub fn panic_message(payload: &(dyn Any + Send)) -> Option<String> {
    if let Some(s) = payload.downcast_ref::<&str>() {
        Some((*s).to_string())
    } else {
        payload.downcast_ref::<String>().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_category_has_group_and_name() {
        for category in FailureCategory::ALL {
            assert!(!category.as_str().is_empty());
            let _ = category.group();
        }
        assert_eq!(FailureCategory::PreparationTimeout.group(), CategoryGroup::Timing);
    }

    #[test]
    fn test_serde_name_matches_as_str() {
        for category in FailureCategory::ALL {
            let json = serde_json::to_string(&category).unwrap();
            assert_eq!(json, format!("\"{}\"", category.as_str()));
        }
    }

    #[test]
    fn test_panic_payloads() {
        let err = ActionError::from_panic(Box::new("boom"));
        assert_eq!(err.message(), "boom");
        let err = ActionError::from_panic(Box::new(String::from("owned boom")));
        assert_eq!(err.message(), "owned boom");
        let err = ActionError::from_panic(Box::new(42u32));
        assert_eq!(err.message(), "");
        assert_eq!(err.category_hint(), Some(FailureCategory::Unknown));
    }

    #[test]
    fn test_opaque_display() {
        assert_eq!(ActionError::opaque().to_string(), "unspecified failure");
        assert_eq!(ActionError::opaque().category_hint(), Some(FailureCategory::Unknown));
    }

    #[test]
    fn test_from_anyhow_keeps_context_chain() {
        let err: ActionError = anyhow::anyhow!("connection refused").context("navigate").into();
        assert!(err.message().contains("navigate"));
        assert!(err.message().contains("connection refused"));
        assert_eq!(err.category_hint(), None);
    }
}
