//! 外部协作方契约：Preparer、CriticalAction、ScopedResource
//!
//! 具体的页面操作（选择器、表单）由调用方实现；协调器只依赖这里的 trait。

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::classifier::ErrorClassifier;
use crate::core::error::{ActionError, FailureCategory};
use crate::core::retry::{RetryCoordinator, RetryOptions};
use crate::schedule::Schedule;

/// 课程状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassStatus {
    Available,
    Full,
    AlreadyBooked,
}

/// 关键动作的确定性结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub success: bool,
    pub class_status: ClassStatus,
    pub participant_info: Option<String>,
}

impl ActionOutcome {
    pub fn booked(participant_info: Option<String>) -> Self {
        Self {
            success: true,
            class_status: ClassStatus::Available,
            participant_info,
        }
    }

    /// 已经预约过，视为成功
    pub fn already_booked() -> Self {
        Self {
            success: true,
            class_status: ClassStatus::AlreadyBooked,
            participant_info: None,
        }
    }

    pub fn full() -> Self {
        Self {
            success: false,
            class_status: ClassStatus::Full,
            participant_info: None,
        }
    }

    /// 预约状态类的终态失败（已预约 / 满员）转为确定性结果，不参与重试
    pub fn from_terminal_category(category: FailureCategory) -> Option<Self> {
        match category {
            FailureCategory::AlreadyBooked => Some(Self::already_booked()),
            FailureCategory::NoSpotsAvailable => Some(Self::full()),
            _ => None,
        }
    }

    /// 根据页面返回的状态文本判断结果。
    ///
    /// 已预约 / 满员为确定性结果；能归入其他类别的文本按该类别失败；
    /// 配置了 success_marker 时文本必须包含它，否则未识别的文本视为预约成功。
    pub fn from_status_text(
        text: &str,
        success_marker: Option<&str>,
        classifier: &ErrorClassifier,
    ) -> Result<Self, ActionError> {
        let text = text.trim();
        let category = classifier.classify(text);
        if let Some(outcome) = Self::from_terminal_category(category) {
            return Ok(outcome);
        }
        if category != FailureCategory::Unknown {
            return Err(ActionError::categorized(category, text));
        }
        if let Some(marker) = success_marker {
            if !text.to_lowercase().contains(&marker.to_lowercase()) {
                return Err(ActionError::categorized(
                    FailureCategory::Unknown,
                    format!("status text lacks success marker {marker:?}: {text}"),
                ));
            }
        }
        Ok(Self::booked(Some(text.to_string()).filter(|s| !s.is_empty())))
    }
}

/// 传给 Preparer 的上下文：本次准备的序号、目标时刻，以及可复用的重试执行器
#[derive(Clone)]
pub struct PreparationContext {
    pub schedule_id: String,
    pub target: DateTime<Utc>,
    /// 1 为首次，2 为余量充足时的唯一一次重新准备
    pub attempt: u32,
    pub retry: RetryCoordinator,
    /// deadline 已设为目标时刻
    pub retry_options: RetryOptions,
}

/// 准备阶段：登录、导航、定位等非时间敏感操作；必须可安全重跑一次
#[async_trait]
pub trait Preparer: Send + Sync {
    async fn prepare(&self, ctx: &PreparationContext) -> Result<(), ActionError>;
}

/// 关键动作：失败时不得留下不可逆的部分状态，以保证即时重试安全
#[async_trait]
pub trait CriticalAction: Send + Sync {
    async fn attempt(&self, attempt: u32) -> Result<ActionOutcome, ActionError>;
}

/// 单次执行独占的资源（如浏览器会话），执行结束后无条件释放
#[async_trait]
pub trait ScopedResource: Send + Sync {
    fn name(&self) -> &str;

    async fn release(&self) -> anyhow::Result<()>;
}

/// 一次执行所需的全部协作方
#[derive(Clone)]
pub struct Workload {
    pub preparer: Arc<dyn Preparer>,
    pub action: Arc<dyn CriticalAction>,
    pub resource: Option<Arc<dyn ScopedResource>>,
}

/// 为每个 Schedule 独立构建 Workload（各自的会话，不跨执行共享）
#[async_trait]
pub trait WorkloadFactory: Send + Sync {
    async fn build(&self, schedule: &Schedule) -> Result<Workload, ActionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_categories() {
        assert_eq!(
            ActionOutcome::from_terminal_category(FailureCategory::AlreadyBooked),
            Some(ActionOutcome::already_booked())
        );
        assert!(!ActionOutcome::from_terminal_category(FailureCategory::NoSpotsAvailable)
            .unwrap()
            .success);
        assert_eq!(ActionOutcome::from_terminal_category(FailureCategory::NetworkTimeout), None);
    }

    #[test]
    fn test_from_status_text() {
        let c = ErrorClassifier::new();
        assert_eq!(
            ActionOutcome::from_status_text("Sorry, this class is full", None, &c)
                .unwrap()
                .class_status,
            ClassStatus::Full
        );
        assert_eq!(
            ActionOutcome::from_status_text("You are already registered", None, &c)
                .unwrap()
                .class_status,
            ClassStatus::AlreadyBooked
        );
        let booked = ActionOutcome::from_status_text("  Booked: Jane D.  ", None, &c).unwrap();
        assert!(booked.success);
        assert_eq!(booked.participant_info.as_deref(), Some("Booked: Jane D."));
        assert_eq!(
            ActionOutcome::from_status_text("", None, &c).unwrap().participant_info,
            None
        );
    }

    #[test]
    fn test_error_status_text_is_a_failure() {
        let c = ErrorClassifier::new();
        let err = ActionOutcome::from_status_text("Booking failed: internal server error", None, &c)
            .unwrap_err();
        assert_eq!(c.categorize(&err), FailureCategory::ServerError);
        assert!(err.message().contains("internal server error"));
    }

    #[test]
    fn test_success_marker_required_when_configured() {
        let c = ErrorClassifier::new();
        let ok = ActionOutcome::from_status_text("Reservation CONFIRMED for 7:00", Some("confirmed"), &c);
        assert!(ok.unwrap().success);

        let err = ActionOutcome::from_status_text("Please choose a slot", Some("confirmed"), &c).unwrap_err();
        assert_eq!(c.categorize(&err), FailureCategory::Unknown);

        // 终态文本不受 success_marker 影响
        let full = ActionOutcome::from_status_text("class is full", Some("confirmed"), &c).unwrap();
        assert_eq!(full.class_status, ClassStatus::Full);
    }
}
