//! 截止时刻调度器：两阶段（准备 → 执行）时序协议
//!
//! 状态机：Idle → Preparing → AwaitingDeadline → Executing → Completed，
//! 任一非终态都可进入 Failed。准备失败且余量大于阈值时重新准备一次；
//! 关键动作只允许一次零延迟的即时重试。

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde::Serialize;
use thiserror::Error;

use crate::core::action::{ActionOutcome, CriticalAction, PreparationContext, Preparer};
use crate::core::classifier::ErrorClassifier;
use crate::core::clock::{to_chrono, to_std, Clock};
use crate::core::error::{ActionError, FailureCategory};
use crate::core::retry::{AttemptRecord, RetryCoordinator, RetryOptions, RetryOutcome, StopReason};
use crate::core::timing::TimingRecorder;

/// 调度状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Idle,
    Preparing,
    AwaitingDeadline,
    Executing,
    Completed,
    Failed,
}

impl SchedulerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn can_transition_to(self, next: SchedulerState) -> bool {
        use SchedulerState::*;
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (Idle, Preparing)
            | (Preparing, Preparing)
            | (Preparing, AwaitingDeadline)
            | (AwaitingDeadline, Executing)
            | (Executing, Executing)
            | (Executing, Completed) => true,
            _ => false,
        }
    }
}

/// 阶段失败
#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("preparation failed after {attempts} attempt(s) ({category}): {source}")]
    PreparationTimeout {
        attempts: u32,
        /// 最后一次准备失败的原始类别
        category: FailureCategory,
        source: ActionError,
    },

    #[error("illegal state transition {from:?} -> {to:?}")]
    IllegalTransition {
        from: SchedulerState,
        to: SchedulerState,
    },
}

/// 调度参数（由配置显式传入）
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// 准备失败后仍允许重新准备所需的最小余量
    pub min_preparation_slack: Duration,
    /// 超过此误差时告警
    pub accuracy_warn: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            min_preparation_slack: Duration::from_secs(10),
            accuracy_warn: Duration::from_millis(50),
        }
    }
}

/// 准备开始时刻 = 目标时刻 - buffer
pub fn calculate_preparation_instant(target: DateTime<Utc>, buffer: Duration) -> DateTime<Utc> {
    target
        .checked_sub_signed(to_chrono(buffer))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// 单次执行的调度器；不跨执行复用
pub struct DeadlineScheduler {
    clock: Arc<dyn Clock>,
    classifier: ErrorClassifier,
    settings: SchedulerSettings,
    schedule_id: String,
    target: DateTime<Utc>,
    preparation_instant: DateTime<Utc>,
    state: SchedulerState,
    critical_history: Vec<AttemptRecord>,
    critical_started: Option<DateTime<Utc>>,
}

impl DeadlineScheduler {
    pub fn new(
        clock: Arc<dyn Clock>,
        classifier: ErrorClassifier,
        settings: SchedulerSettings,
        schedule_id: impl Into<String>,
        target: DateTime<Utc>,
        buffer: Duration,
    ) -> Self {
        Self {
            clock,
            classifier,
            settings,
            schedule_id: schedule_id.into(),
            target,
            preparation_instant: calculate_preparation_instant(target, buffer),
            state: SchedulerState::Idle,
            critical_history: Vec::new(),
            critical_started: None,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn preparation_instant(&self) -> DateTime<Utc> {
        self.preparation_instant
    }

    /// 距目标时刻的剩余时间（已过为 0）
    pub fn slack(&self) -> Duration {
        to_std(self.target - self.clock.now())
    }

    fn transition(&mut self, next: SchedulerState) -> Result<(), PhaseError> {
        if !self.state.can_transition_to(next) {
            return Err(PhaseError::IllegalTransition {
                from: self.state,
                to: next,
            });
        }
        tracing::debug!(schedule_id = %self.schedule_id, from = ?self.state, to = ?next, "state transition");
        self.state = next;
        Ok(())
    }

    /// 异常路径：任何非终态直接进入 Failed
    pub fn abort(&mut self) {
        if !self.state.is_terminal() {
            self.state = SchedulerState::Failed;
        }
    }

    /// Idle：等到准备时刻后进入 Preparing
    pub async fn wait_for_preparation_window(&mut self) -> Result<(), PhaseError> {
        self.clock.wait_until(self.preparation_instant).await;
        self.transition(SchedulerState::Preparing)
    }

    /// Preparing：运行 Preparer；失败且余量 > 阈值时重新准备一次，否则进入 Failed
    pub async fn prepare(
        &mut self,
        preparer: &dyn Preparer,
        retry: &RetryCoordinator,
        retry_options: &RetryOptions,
        recorder: &mut TimingRecorder,
    ) -> Result<(), PhaseError> {
        recorder.mark_preparation_start(self.clock.now());
        let mut attempt = 1u32;

        loop {
            recorder.mark_preparation_attempt();
            let ctx = PreparationContext {
                schedule_id: self.schedule_id.clone(),
                target: self.target,
                attempt,
                retry: retry.clone(),
                retry_options: retry_options.clone().with_deadline(self.target),
            };

            let error = match preparer.prepare(&ctx).await {
                Ok(()) => {
                    recorder.mark_preparation_end(self.clock.now());
                    tracing::info!(
                        schedule_id = %self.schedule_id,
                        attempt,
                        slack_ms = self.slack().as_millis() as u64,
                        "preparation finished"
                    );
                    return self.transition(SchedulerState::AwaitingDeadline);
                }
                Err(error) => error,
            };

            let category = self.classifier.categorize(&error);
            let slack = self.slack();
            if attempt == 1 && slack > self.settings.min_preparation_slack {
                tracing::warn!(
                    schedule_id = %self.schedule_id,
                    category = %category,
                    slack_ms = slack.as_millis() as u64,
                    error = %error,
                    "preparation failed, retrying once"
                );
                self.transition(SchedulerState::Preparing)?;
                attempt += 1;
                continue;
            }

            recorder.mark_preparation_end(self.clock.now());
            tracing::error!(
                schedule_id = %self.schedule_id,
                attempts = attempt,
                category = %category,
                slack_ms = slack.as_millis() as u64,
                error = %error,
                "preparation failed"
            );
            self.transition(SchedulerState::Failed)?;
            return Err(PhaseError::PreparationTimeout {
                attempts: attempt,
                category,
                source: error,
            });
        }
    }

    /// AwaitingDeadline：精确等待到目标时刻后进入 Executing
    pub async fn await_deadline(&mut self) -> Result<(), PhaseError> {
        self.clock.wait_until(self.target).await;
        self.transition(SchedulerState::Executing)
    }

    /// Executing：执行关键动作，可重试类别只允许一次零延迟重试
    pub async fn execute(
        &mut self,
        action: &dyn CriticalAction,
        recorder: &mut TimingRecorder,
    ) -> Result<RetryOutcome<ActionOutcome>, PhaseError> {
        if self.state != SchedulerState::Executing {
            return Err(PhaseError::IllegalTransition {
                from: self.state,
                to: SchedulerState::Executing,
            });
        }

        let started = self.clock.now();
        self.critical_started = Some(started);
        recorder.mark_execution_start(started);
        let accuracy_ms = (started - self.target).num_milliseconds();
        if accuracy_ms.unsigned_abs() as u128 > self.settings.accuracy_warn.as_millis() {
            tracing::warn!(schedule_id = %self.schedule_id, accuracy_ms, "critical action started off target");
        } else {
            tracing::info!(schedule_id = %self.schedule_id, accuracy_ms, "critical action started");
        }

        let mut attempt = 1u32;
        let mut last_category = None;
        let (result, reason) = loop {
            let at = self.clock.now();
            // 单次尝试内的 panic 视为 unknown 失败，同样适用即时重试规则
            let result = match AssertUnwindSafe(action.attempt(attempt)).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => Err(ActionError::from_panic(payload)),
            };
            let error = match result {
                Ok(outcome) => {
                    self.critical_history.push(AttemptRecord::success(attempt, at));
                    self.transition(SchedulerState::Completed)?;
                    break (Ok(outcome), StopReason::Succeeded);
                }
                Err(error) => error,
            };

            let category = self.classifier.categorize(&error);
            last_category = Some(category);

            if let Some(outcome) = ActionOutcome::from_terminal_category(category) {
                self.critical_history
                    .push(AttemptRecord::failure(attempt, at, category, Duration::ZERO, &error));
                tracing::info!(schedule_id = %self.schedule_id, category = %category, "critical action reached terminal state");
                self.transition(SchedulerState::Completed)?;
                break (Ok(outcome), StopReason::TerminalOutcome);
            }

            self.critical_history
                .push(AttemptRecord::failure(attempt, at, category, Duration::ZERO, &error));

            if attempt == 1 && self.classifier.policy(category).permits_retry() {
                tracing::warn!(
                    schedule_id = %self.schedule_id,
                    category = %category,
                    error = %error,
                    "critical action failed, retrying immediately"
                );
                self.transition(SchedulerState::Executing)?;
                attempt += 1;
                continue;
            }

            tracing::error!(
                schedule_id = %self.schedule_id,
                attempt,
                category = %category,
                error = %error,
                "critical action failed"
            );
            self.transition(SchedulerState::Failed)?;
            let reason = if attempt == 1 {
                StopReason::NoRetryPolicy
            } else {
                StopReason::AttemptsExhausted
            };
            break (Err(error), reason);
        };

        let finished = self.clock.now();
        recorder.mark_execution_end(finished);
        Ok(RetryOutcome::new(
            result,
            to_std(finished - started),
            last_category,
            reason,
            std::mem::take(&mut self.critical_history),
        ))
    }

    /// 关键动作中途 panic 时，用已记录的尝试拼出结果
    pub fn interrupted_outcome(&mut self, error: ActionError) -> RetryOutcome<ActionOutcome> {
        let history = std::mem::take(&mut self.critical_history);
        if history.is_empty() {
            return RetryOutcome::not_attempted(error);
        }
        let elapsed = self
            .critical_started
            .map(|started| to_std(self.clock.now() - started))
            .unwrap_or_default();
        let last_category = history.iter().rev().find_map(|r| r.category);
        RetryOutcome::new(
            Err(error),
            elapsed,
            last_category.or(Some(FailureCategory::Unknown)),
            StopReason::Interrupted,
            history,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use crate::core::clock::VirtualClock;

    struct FlakyAction {
        calls: AtomicU32,
        errors: Vec<&'static str>,
    }

    #[async_trait]
    impl CriticalAction for FlakyAction {
        async fn attempt(&self, _attempt: u32) -> Result<ActionOutcome, ActionError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            match self.errors.get(n) {
                Some(msg) => Err(ActionError::new(*msg)),
                None => Ok(ActionOutcome::booked(None)),
            }
        }
    }

    fn executing_scheduler(clock: &VirtualClock) -> DeadlineScheduler {
        let target = clock.now();
        let mut scheduler = DeadlineScheduler::new(
            Arc::new(clock.clone()),
            ErrorClassifier::new(),
            SchedulerSettings::default(),
            "s1",
            target,
            Duration::from_secs(30),
        );
        scheduler.state = SchedulerState::Executing;
        scheduler
    }

    #[test]
    fn test_transition_table() {
        use SchedulerState::*;
        assert!(Idle.can_transition_to(Preparing));
        assert!(Preparing.can_transition_to(Preparing));
        assert!(Executing.can_transition_to(Executing));
        assert!(AwaitingDeadline.can_transition_to(Failed));
        assert!(!Idle.can_transition_to(Executing));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Preparing));
        assert!(!AwaitingDeadline.can_transition_to(Preparing));
    }

    #[test]
    fn test_preparation_instant() {
        let target = Utc::now();
        let at = calculate_preparation_instant(target, Duration::from_secs(90));
        assert_eq!((target - at).num_seconds(), 90);
    }

    #[tokio::test]
    async fn test_execute_requires_executing_state() {
        let clock = VirtualClock::starting_now();
        let mut scheduler = executing_scheduler(&clock);
        scheduler.state = SchedulerState::AwaitingDeadline;
        let action = FlakyAction { calls: AtomicU32::new(0), errors: vec![] };
        let mut recorder = TimingRecorder::new(clock.now());
        let err = scheduler.execute(&action, &mut recorder).await.unwrap_err();
        assert!(matches!(err, PhaseError::IllegalTransition { .. }));
        assert_eq!(action.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_second_retryable_failure_is_terminal() {
        let clock = VirtualClock::starting_now();
        let mut scheduler = executing_scheduler(&clock);
        let action = FlakyAction {
            calls: AtomicU32::new(0),
            errors: vec!["element not found", "element not found", "element not found"],
        };
        let mut recorder = TimingRecorder::new(clock.now());
        let outcome = scheduler.execute(&action, &mut recorder).await.unwrap();
        assert_eq!(action.calls.load(Ordering::SeqCst), 2);
        assert_eq!(outcome.attempts(), 2);
        assert!(!outcome.succeeded());
        assert_eq!(outcome.stop_reason(), StopReason::AttemptsExhausted);
        assert_eq!(scheduler.state(), SchedulerState::Failed);
    }

    #[tokio::test]
    async fn test_non_retryable_failure_not_retried() {
        let clock = VirtualClock::starting_now();
        let mut scheduler = executing_scheduler(&clock);
        let action = FlakyAction {
            calls: AtomicU32::new(0),
            errors: vec!["invalid credentials"],
        };
        let mut recorder = TimingRecorder::new(clock.now());
        let outcome = scheduler.execute(&action, &mut recorder).await.unwrap();
        assert_eq!(action.calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.last_category(), Some(FailureCategory::InvalidCredentials));
        assert_eq!(scheduler.state(), SchedulerState::Failed);
    }

    #[tokio::test]
    async fn test_no_spots_error_completes_unsuccessfully() {
        let clock = VirtualClock::starting_now();
        let mut scheduler = executing_scheduler(&clock);
        let action = FlakyAction {
            calls: AtomicU32::new(0),
            errors: vec!["Sorry, no spots left"],
        };
        let mut recorder = TimingRecorder::new(clock.now());
        let outcome = scheduler.execute(&action, &mut recorder).await.unwrap();
        assert_eq!(action.calls.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.state(), SchedulerState::Completed);
        assert_eq!(outcome.value(), Some(&ActionOutcome::full()));
        assert_eq!(outcome.stop_reason(), StopReason::TerminalOutcome);
    }

    #[tokio::test]
    async fn test_interrupted_outcome_keeps_history() {
        let clock = VirtualClock::starting_now();
        let mut scheduler = executing_scheduler(&clock);
        let empty = scheduler.interrupted_outcome(ActionError::opaque());
        assert_eq!(empty.attempts(), 0);
        assert_eq!(empty.stop_reason(), StopReason::NotAttempted);

        scheduler.critical_started = Some(clock.now());
        scheduler.critical_history.push(AttemptRecord::failure(
            1,
            clock.now(),
            FailureCategory::ElementNotFound,
            Duration::ZERO,
            &ActionError::new("element not found"),
        ));
        let outcome = scheduler.interrupted_outcome(ActionError::opaque());
        assert_eq!(outcome.attempts(), 1);
        assert_eq!(outcome.stop_reason(), StopReason::Interrupted);
        assert_eq!(outcome.last_category(), Some(FailureCategory::ElementNotFound));
    }
}
