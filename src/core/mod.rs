//! 核心引擎：时钟、错误分类、重试、截止时刻调度、恢复、执行协调与分发

pub mod action;
pub mod classifier;
pub mod clock;
pub mod coordinator;
pub mod dispatcher;
pub mod error;
pub mod recovery;
pub mod retry;
pub mod scheduler;
pub mod shutdown;
pub mod timing;

pub use action::{
    ActionOutcome, ClassStatus, CriticalAction, PreparationContext, Preparer, ScopedResource, Workload,
    WorkloadFactory,
};
pub use classifier::{ErrorClassifier, RetryPolicy, RetryStrategy};
pub use clock::{Clock, SystemClock, VirtualClock};
pub use coordinator::{CoordinatorSettings, ExecutionCoordinator, ExecutionResult};
pub use dispatcher::Dispatcher;
pub use error::{ActionError, CategoryGroup, FailureCategory};
pub use recovery::{RecoveryLayer, RecoveryProbe, RecoveryReport};
pub use retry::{AttemptRecord, RetryCoordinator, RetryOptions, RetryOutcome, StopReason};
pub use scheduler::{calculate_preparation_instant, DeadlineScheduler, PhaseError, SchedulerSettings, SchedulerState};
pub use shutdown::{ShutdownManager, ShutdownReason};
pub use timing::{TimingRecord, TimingRecorder};
