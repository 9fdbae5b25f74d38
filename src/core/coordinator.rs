//! 执行协调器
//!
//! 串起 Clock、DeadlineScheduler、RetryCoordinator：准备 → 等待目标时刻 → 关键动作 → 结果定稿。
//! 任何退出路径（含 panic）都产生且只产生一个 ExecutionResult；资源在结果定稿后无条件释放，
//! 释放失败只记日志，不改变结果。

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde::Serialize;
use tracing::Instrument;
use uuid::Uuid;

use crate::core::action::{
    ActionOutcome, ClassStatus, CriticalAction, Preparer, ScopedResource, Workload, WorkloadFactory,
};
use crate::core::classifier::ErrorClassifier;
use crate::core::clock::Clock;
use crate::core::error::{ActionError, FailureCategory};
use crate::core::retry::{RetryCoordinator, RetryOptions, RetryOutcome};
use crate::core::scheduler::{DeadlineScheduler, PhaseError, SchedulerSettings, SchedulerState};
use crate::core::timing::{TimingRecord, TimingRecorder};
use crate::schedule::Schedule;

/// 协调器参数，由配置显式构造后传入
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub min_preparation_slack: Duration,
    pub accuracy_warn: Duration,
    /// 准备阶段 Preparer 内部使用的重试参数
    pub retry: RetryOptions,
    /// 单个资源释放的超时
    pub cleanup_timeout: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        let scheduler = SchedulerSettings::default();
        Self {
            min_preparation_slack: scheduler.min_preparation_slack,
            accuracy_warn: scheduler.accuracy_warn,
            retry: RetryOptions::default(),
            cleanup_timeout: Duration::from_secs(10),
        }
    }
}

impl CoordinatorSettings {
    fn scheduler(&self) -> SchedulerSettings {
        SchedulerSettings {
            min_preparation_slack: self.min_preparation_slack,
            accuracy_warn: self.accuracy_warn,
        }
    }
}

/// 一次执行的最终结果
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub run_id: Uuid,
    pub schedule_id: String,
    /// 关键动作给出的成功标志；Completed 但满员时为 false
    pub success: bool,
    pub final_state: SchedulerState,
    /// 仅 Failed 时有值
    pub failure_category: Option<FailureCategory>,
    /// 人类可读的原因
    pub reason: String,
    pub timing: TimingRecord,
    pub critical: RetryOutcome<ActionOutcome>,
    pub finished_at: DateTime<Utc>,
}

impl ExecutionResult {
    pub fn outcome(&self) -> Option<&ActionOutcome> {
        self.critical.value()
    }

    pub fn accuracy_ms(&self) -> Option<i64> {
        self.timing.accuracy_ms()
    }

    /// 未进入任何阶段就失败（过期、构建失败）
    fn rejected(
        run_id: Uuid,
        schedule: &Schedule,
        category: FailureCategory,
        reason: String,
        finished_at: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id,
            schedule_id: schedule.id.clone(),
            success: false,
            final_state: SchedulerState::Failed,
            failure_category: Some(category),
            critical: RetryOutcome::not_attempted(ActionError::categorized(category, reason.clone())),
            reason,
            timing: TimingRecorder::new(schedule.target).finalize(),
            finished_at,
        }
    }
}

fn describe_outcome(outcome: &ActionOutcome) -> String {
    match outcome.class_status {
        ClassStatus::Available => match &outcome.participant_info {
            Some(info) => format!("booked ({info})"),
            None => "booked".to_string(),
        },
        ClassStatus::AlreadyBooked => "already booked".to_string(),
        ClassStatus::Full => "class is full".to_string(),
    }
}

/// 执行协调器；可跨 Schedule 复用，自身不持有可变状态
#[derive(Clone)]
pub struct ExecutionCoordinator {
    clock: Arc<dyn Clock>,
    classifier: ErrorClassifier,
    retry: RetryCoordinator,
    settings: CoordinatorSettings,
}

impl ExecutionCoordinator {
    pub fn new(clock: Arc<dyn Clock>, settings: CoordinatorSettings) -> Self {
        let classifier = ErrorClassifier::new();
        Self {
            retry: RetryCoordinator::new(Arc::clone(&clock), classifier),
            clock,
            classifier,
            settings,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    fn expired(&self, run_id: Uuid, schedule: &Schedule) -> Option<ExecutionResult> {
        let now = self.clock.now();
        if schedule.is_future_at(now) {
            return None;
        }
        let reason = format!(
            "target {} is not in the future (now {})",
            schedule.target.to_rfc3339(),
            now.to_rfc3339()
        );
        tracing::error!(schedule_id = %schedule.id, %run_id, "schedule rejected: {}", reason);
        Some(ExecutionResult::rejected(
            run_id,
            schedule,
            FailureCategory::ScheduleExpired,
            reason,
            now,
        ))
    }

    /// 执行一个 Schedule；总是返回结果
    pub async fn execute(
        &self,
        schedule: &Schedule,
        preparer: &dyn Preparer,
        action: &dyn CriticalAction,
    ) -> ExecutionResult {
        let run_id = Uuid::new_v4();
        if let Some(rejected) = self.expired(run_id, schedule) {
            return rejected;
        }
        let span = tracing::info_span!("execution", schedule_id = %schedule.id, %run_id);
        self.run(run_id, schedule, preparer, action).instrument(span).await
    }

    /// 执行并在结果定稿后释放资源
    pub async fn execute_workload(&self, schedule: &Schedule, workload: &Workload) -> ExecutionResult {
        let result = self
            .execute(schedule, workload.preparer.as_ref(), workload.action.as_ref())
            .await;
        if let Some(resource) = &workload.resource {
            self.release(&schedule.id, resource.as_ref()).await;
        }
        result
    }

    /// 为 Schedule 构建独立的 Workload 后执行；过期检查先于构建
    pub async fn execute_with(&self, schedule: &Schedule, factory: &dyn WorkloadFactory) -> ExecutionResult {
        let run_id = Uuid::new_v4();
        if let Some(rejected) = self.expired(run_id, schedule) {
            return rejected;
        }

        let built = match AssertUnwindSafe(factory.build(schedule)).catch_unwind().await {
            Ok(built) => built,
            Err(payload) => Err(ActionError::from_panic(payload)),
        };
        match built {
            Ok(workload) => self.execute_workload(schedule, &workload).await,
            Err(error) => {
                let category = self.classifier.categorize(&error);
                tracing::error!(schedule_id = %schedule.id, %run_id, category = %category, error = %error, "workload setup failed");
                ExecutionResult::rejected(
                    run_id,
                    schedule,
                    category,
                    format!("workload setup failed: {error}"),
                    self.clock.now(),
                )
            }
        }
    }

    async fn run(
        &self,
        run_id: Uuid,
        schedule: &Schedule,
        preparer: &dyn Preparer,
        action: &dyn CriticalAction,
    ) -> ExecutionResult {
        let mut scheduler = DeadlineScheduler::new(
            Arc::clone(&self.clock),
            self.classifier,
            self.settings.scheduler(),
            schedule.id.clone(),
            schedule.target,
            schedule.buffer(),
        );
        let mut recorder = TimingRecorder::new(schedule.target);
        tracing::info!(
            preparation_at = %scheduler.preparation_instant().to_rfc3339(),
            target = %schedule.target.to_rfc3339(),
            "execution scheduled"
        );

        let phases = AssertUnwindSafe(self.phases(&mut scheduler, &mut recorder, preparer, action))
            .catch_unwind()
            .await;

        let (success, failure_category, reason, critical) = match phases {
            Ok(Ok(critical)) => {
                let completed = match (scheduler.state(), critical.value()) {
                    (SchedulerState::Completed, Some(outcome)) => Some((outcome.success, describe_outcome(outcome))),
                    _ => None,
                };
                match completed {
                    Some((success, reason)) => (success, None, reason, critical),
                    None => {
                        let category = critical.last_category().unwrap_or(FailureCategory::Unknown);
                        let reason = match critical.failure() {
                            Some(error) => format!(
                                "critical action failed after {} attempt(s): {error}",
                                critical.attempts()
                            ),
                            None => "critical action failed".to_string(),
                        };
                        (false, Some(category), reason, critical)
                    }
                }
            }
            Ok(Err(PhaseError::PreparationTimeout {
                attempts,
                category,
                source,
            })) => {
                let reason = format!("preparation failed after {attempts} attempt(s), last failure {category}: {source}");
                let critical = RetryOutcome::not_attempted(ActionError::categorized(
                    FailureCategory::PreparationTimeout,
                    reason.clone(),
                ));
                (false, Some(FailureCategory::PreparationTimeout), reason, critical)
            }
            Ok(Err(error @ PhaseError::IllegalTransition { .. })) => {
                scheduler.abort();
                let reason = error.to_string();
                let critical = scheduler.interrupted_outcome(ActionError::categorized(FailureCategory::Unknown, reason.clone()));
                (false, Some(FailureCategory::Unknown), reason, critical)
            }
            Err(payload) => {
                if scheduler.state() == SchedulerState::Executing {
                    recorder.mark_execution_end(self.clock.now());
                } else if scheduler.state() == SchedulerState::Preparing {
                    recorder.mark_preparation_end(self.clock.now());
                }
                scheduler.abort();
                let error = ActionError::from_panic(payload);
                let reason = error.to_string();
                tracing::error!("execution panicked: {}", reason);
                (false, Some(FailureCategory::Unknown), reason, scheduler.interrupted_outcome(error))
            }
        };

        let timing = recorder.finalize();
        let result = ExecutionResult {
            run_id,
            schedule_id: schedule.id.clone(),
            success,
            final_state: scheduler.state(),
            failure_category,
            reason,
            timing,
            critical,
            finished_at: self.clock.now(),
        };

        if result.success {
            tracing::info!(
                state = ?result.final_state,
                accuracy_ms = result.accuracy_ms(),
                slack_ms = result.timing.slack_after_preparation_ms(),
                attempts = result.critical.attempts(),
                "execution finished: {}",
                result.reason
            );
        } else {
            tracing::warn!(
                state = ?result.final_state,
                category = ?result.failure_category,
                accuracy_ms = result.accuracy_ms(),
                slack_ms = result.timing.slack_after_preparation_ms(),
                attempts = result.critical.attempts(),
                "execution finished without success: {}",
                result.reason
            );
        }
        result
    }

    async fn phases(
        &self,
        scheduler: &mut DeadlineScheduler,
        recorder: &mut TimingRecorder,
        preparer: &dyn Preparer,
        action: &dyn CriticalAction,
    ) -> Result<RetryOutcome<ActionOutcome>, PhaseError> {
        scheduler.wait_for_preparation_window().await?;
        scheduler
            .prepare(preparer, &self.retry, &self.settings.retry, recorder)
            .await?;
        scheduler.await_deadline().await?;
        scheduler.execute(action, recorder).await
    }

    async fn release(&self, schedule_id: &str, resource: &dyn ScopedResource) {
        let name = resource.name();
        let timeout = self.settings.cleanup_timeout;
        match tokio::time::timeout(timeout, AssertUnwindSafe(resource.release()).catch_unwind()).await {
            Ok(Ok(Ok(()))) => {
                tracing::debug!(schedule_id, resource = name, "resource released");
            }
            Ok(Ok(Err(e))) => {
                tracing::warn!(schedule_id, resource = name, "resource release failed: {:#}", e);
            }
            Ok(Err(_)) => {
                tracing::warn!(schedule_id, resource = name, "resource release panicked");
            }
            Err(_) => {
                tracing::warn!(schedule_id, resource = name, "resource release timed out after {}ms", timeout.as_millis());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use async_trait::async_trait;

    use crate::core::action::PreparationContext;
    use crate::core::clock::VirtualClock;
    use crate::core::retry::StopReason;

    struct CountingPreparer {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Preparer for CountingPreparer {
        async fn prepare(&self, _ctx: &PreparationContext) -> Result<(), ActionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct PanickingAction;

    #[async_trait]
    impl CriticalAction for PanickingAction {
        async fn attempt(&self, _attempt: u32) -> Result<ActionOutcome, ActionError> {
            panic!("selector engine exploded");
        }
    }

    struct OkAction {
        calls: AtomicU32,
    }

    #[async_trait]
    impl CriticalAction for OkAction {
        async fn attempt(&self, _attempt: u32) -> Result<ActionOutcome, ActionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ActionOutcome::booked(None))
        }
    }

    struct FailingResource {
        released: AtomicBool,
    }

    #[async_trait]
    impl ScopedResource for FailingResource {
        fn name(&self) -> &str {
            "session"
        }

        async fn release(&self) -> anyhow::Result<()> {
            self.released.store(true, Ordering::SeqCst);
            anyhow::bail!("browser already gone")
        }
    }

    fn coordinator(clock: &VirtualClock) -> ExecutionCoordinator {
        ExecutionCoordinator::new(Arc::new(clock.clone()), CoordinatorSettings::default())
    }

    #[tokio::test]
    async fn test_expired_schedule_has_no_side_effects() {
        let clock = VirtualClock::starting_now();
        let preparer = CountingPreparer { calls: AtomicU32::new(0) };
        let action = OkAction { calls: AtomicU32::new(0) };
        let schedule = Schedule::new("late", clock.now(), 60);

        let result = coordinator(&clock).execute(&schedule, &preparer, &action).await;
        assert!(!result.success);
        assert_eq!(result.final_state, SchedulerState::Failed);
        assert_eq!(result.failure_category, Some(FailureCategory::ScheduleExpired));
        assert_eq!(preparer.calls.load(Ordering::SeqCst), 0);
        assert_eq!(action.calls.load(Ordering::SeqCst), 0);
        assert_eq!(result.critical.stop_reason(), StopReason::NotAttempted);
    }

    #[tokio::test]
    async fn test_panic_in_action_maps_to_unknown() {
        let clock = VirtualClock::starting_now();
        let preparer = CountingPreparer { calls: AtomicU32::new(0) };
        let schedule = Schedule::new("boom", clock.now() + chrono::Duration::seconds(30), 20);

        let result = coordinator(&clock).execute(&schedule, &preparer, &PanickingAction).await;
        assert_eq!(result.final_state, SchedulerState::Failed);
        assert_eq!(result.failure_category, Some(FailureCategory::Unknown));
        assert!(result.reason.contains("selector engine exploded"));
        assert!(result.timing.execution_start().is_some());
        assert!(result.timing.execution_end().is_some());
        // 第一次 panic 按 unknown 即时重试一次
        assert_eq!(result.critical.attempts(), 2);
        assert_eq!(result.critical.stop_reason(), StopReason::AttemptsExhausted);
    }

    #[tokio::test]
    async fn test_release_failure_does_not_mask_result() {
        let clock = VirtualClock::starting_now();
        let resource = Arc::new(FailingResource { released: AtomicBool::new(false) });
        let workload = Workload {
            preparer: Arc::new(CountingPreparer { calls: AtomicU32::new(0) }),
            action: Arc::new(OkAction { calls: AtomicU32::new(0) }),
            resource: Some(resource.clone()),
        };
        let schedule = Schedule::new("ok", clock.now() + chrono::Duration::seconds(30), 20);

        let result = coordinator(&clock).execute_workload(&schedule, &workload).await;
        assert!(result.success);
        assert_eq!(result.final_state, SchedulerState::Completed);
        assert!(resource.released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_result_serializes() {
        let clock = VirtualClock::starting_now();
        let preparer = CountingPreparer { calls: AtomicU32::new(0) };
        let action = OkAction { calls: AtomicU32::new(0) };
        let schedule = Schedule::new("json", clock.now() + chrono::Duration::seconds(5), 2);
        let result = coordinator(&clock).execute(&schedule, &preparer, &action).await;

        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["schedule_id"], "json");
        assert_eq!(value["final_state"], "completed");
        assert_eq!(value["timing"]["accuracy_ms"], 0);
        assert_eq!(value["critical"]["attempts"], 1);
    }
}
