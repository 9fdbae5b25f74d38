//! 多 Schedule 分发
//!
//! 每个启用的 Schedule 一个独立 tokio 任务：等待到准备时刻（可被取消），再交给协调器执行，
//! 最后把结果投递给所有 ResultSink。任务之间没有共享可变状态，也没有顺序保证。
//! 取消只在调用 execute 之前生效。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::core::action::WorkloadFactory;
use crate::core::clock::to_chrono;
use crate::core::coordinator::{ExecutionCoordinator, ExecutionResult};
use crate::report::{deliver_all, ResultSink};
use crate::schedule::Schedule;

/// 调度分发器
#[derive(Clone)]
pub struct Dispatcher {
    coordinator: ExecutionCoordinator,
    factory: Arc<dyn WorkloadFactory>,
    sinks: Vec<Arc<dyn ResultSink>>,
    /// 提前于准备时刻多久开始构建 Workload
    dispatch_lead: Duration,
}

impl Dispatcher {
    pub fn new(coordinator: ExecutionCoordinator, factory: Arc<dyn WorkloadFactory>) -> Self {
        Self {
            coordinator,
            factory,
            sinks: Vec::new(),
            dispatch_lead: Duration::ZERO,
        }
    }

    pub fn with_sinks(mut self, sinks: Vec<Arc<dyn ResultSink>>) -> Self {
        self.sinks = sinks;
        self
    }

    pub fn with_dispatch_lead(mut self, lead: Duration) -> Self {
        self.dispatch_lead = lead;
        self
    }

    fn dispatch_instant(&self, schedule: &Schedule) -> DateTime<Utc> {
        schedule
            .preparation_instant()
            .checked_sub_signed(to_chrono(self.dispatch_lead))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// 并发执行所有启用的 Schedule，返回按完成顺序排列的结果；被取消的 Schedule 不产生结果
    pub async fn run(&self, schedules: Vec<Schedule>, cancel: CancellationToken) -> Vec<ExecutionResult> {
        let mut tasks = JoinSet::new();

        for schedule in schedules {
            if !schedule.enabled {
                tracing::info!(schedule_id = %schedule.id, "schedule disabled, skipping");
                continue;
            }

            let dispatch_at = self.dispatch_instant(&schedule);
            let this = self.clone();
            let cancel = cancel.clone();
            tracing::info!(
                schedule_id = %schedule.id,
                dispatch_at = %dispatch_at.to_rfc3339(),
                target = %schedule.target.to_rfc3339(),
                "schedule queued"
            );

            tasks.spawn(async move {
                let clock = Arc::clone(this.coordinator.clock());
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        tracing::info!(schedule_id = %schedule.id, "schedule cancelled before dispatch");
                        return None;
                    }
                    _ = clock.wait_until(dispatch_at) => {}
                }

                let result = this.coordinator.execute_with(&schedule, this.factory.as_ref()).await;
                deliver_all(&this.sinks, &result).await;
                Some(result)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(result)) => results.push(result),
                Ok(None) => {}
                Err(e) => tracing::error!("execution task aborted: {}", e),
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use crate::core::action::{
        ActionOutcome, CriticalAction, PreparationContext, Preparer, Workload,
    };
    use crate::core::clock::SystemClock;
    use crate::core::coordinator::CoordinatorSettings;
    use crate::core::error::ActionError;

    struct NoopStep;

    #[async_trait]
    impl Preparer for NoopStep {
        async fn prepare(&self, _ctx: &PreparationContext) -> Result<(), ActionError> {
            Ok(())
        }
    }

    #[async_trait]
    impl CriticalAction for NoopStep {
        async fn attempt(&self, _attempt: u32) -> Result<ActionOutcome, ActionError> {
            Ok(ActionOutcome::booked(None))
        }
    }

    struct CountingFactory {
        builds: AtomicU32,
    }

    #[async_trait]
    impl WorkloadFactory for CountingFactory {
        async fn build(&self, _schedule: &Schedule) -> Result<Workload, ActionError> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            Ok(Workload {
                preparer: Arc::new(NoopStep),
                action: Arc::new(NoopStep),
                resource: None,
            })
        }
    }

    fn dispatcher(factory: Arc<CountingFactory>) -> Dispatcher {
        let coordinator = ExecutionCoordinator::new(Arc::new(SystemClock::default()), CoordinatorSettings::default());
        Dispatcher::new(coordinator, factory)
    }

    #[tokio::test]
    async fn test_runs_enabled_schedules_concurrently() {
        let factory = Arc::new(CountingFactory { builds: AtomicU32::new(0) });
        let now = Utc::now();
        let schedules = vec![
            Schedule::new("a", now + chrono::Duration::milliseconds(300), 1),
            Schedule::new("b", now + chrono::Duration::milliseconds(350), 1),
            Schedule::new("off", now + chrono::Duration::milliseconds(300), 1).disabled(),
        ];

        let started = std::time::Instant::now();
        let results = dispatcher(factory.clone()).run(schedules, CancellationToken::new()).await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.success));
        assert_eq!(factory.builds.load(Ordering::SeqCst), 2);
        // 两个目标时刻重叠执行，而不是串行累加
        assert!(started.elapsed() < Duration::from_millis(650));
    }

    #[tokio::test]
    async fn test_cancel_before_dispatch_skips_execution() {
        let factory = Arc::new(CountingFactory { builds: AtomicU32::new(0) });
        let cancel = CancellationToken::new();
        cancel.cancel();
        let schedules = vec![Schedule::new("later", Utc::now() + chrono::Duration::hours(1), 60)];

        let results = dispatcher(factory.clone()).run(schedules, cancel).await;
        assert!(results.is_empty());
        assert_eq!(factory.builds.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_expired_schedule_reported_not_built() {
        let factory = Arc::new(CountingFactory { builds: AtomicU32::new(0) });
        let schedules = vec![Schedule::new("past", Utc::now() - chrono::Duration::seconds(5), 1)];

        let results = dispatcher(factory.clone()).run(schedules, CancellationToken::new()).await;
        assert_eq!(results.len(), 1);
        assert_eq!(
            results[0].failure_category,
            Some(crate::core::error::FailureCategory::ScheduleExpired)
        );
        assert_eq!(factory.builds.load(Ordering::SeqCst), 0);
    }
}
