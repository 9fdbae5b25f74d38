//! 演练用的 Workload：不驱动任何外部系统，只走完完整的时序协议
//!
//! 用于 `tock run --dry-run` 与 `tock probe`，校准主机的准点精度。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::core::action::{
    ActionOutcome, CriticalAction, PreparationContext, Preparer, Workload, WorkloadFactory,
};
use crate::core::error::ActionError;
use crate::schedule::Schedule;

/// 模拟一段准备耗时
#[derive(Debug, Clone)]
pub struct RehearsalPreparer {
    pub simulated: Duration,
}

#[async_trait]
impl Preparer for RehearsalPreparer {
    async fn prepare(&self, ctx: &PreparationContext) -> Result<(), ActionError> {
        tracing::info!(schedule_id = %ctx.schedule_id, attempt = ctx.attempt, "rehearsal preparation");
        if !self.simulated.is_zero() {
            tokio::time::sleep(self.simulated).await;
        }
        Ok(())
    }
}

/// 立即返回成功
#[derive(Debug, Clone, Default)]
pub struct RehearsalAction;

#[async_trait]
impl CriticalAction for RehearsalAction {
    async fn attempt(&self, attempt: u32) -> Result<ActionOutcome, ActionError> {
        tracing::info!(attempt, "rehearsal action");
        Ok(ActionOutcome::booked(Some("rehearsal".to_string())))
    }
}

#[derive(Debug, Clone, Default)]
pub struct RehearsalFactory {
    pub simulated_preparation: Duration,
}

impl RehearsalFactory {
    pub fn workload(&self) -> Workload {
        Workload {
            preparer: Arc::new(RehearsalPreparer {
                simulated: self.simulated_preparation,
            }),
            action: Arc::new(RehearsalAction),
            resource: None,
        }
    }
}

#[async_trait]
impl WorkloadFactory for RehearsalFactory {
    async fn build(&self, _schedule: &Schedule) -> Result<Workload, ActionError> {
        Ok(self.workload())
    }
}
