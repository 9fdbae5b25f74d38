//! 重试协调器
//!
//! 按分类结果执行操作：有限次数、按策略计算退避、全局超时只在两次尝试之间检查（不抢占进行中的操作）。
//! 每次尝试都会记录一条 AttemptRecord 并输出一条结构化日志。

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use rand::Rng;
use serde::Serialize;

use crate::core::classifier::{serialize_ms, ErrorClassifier, RetryPolicy, RetryStrategy};
use crate::core::clock::{to_chrono, to_std, Clock};
use crate::core::error::{ActionError, FailureCategory};

/// 单次 run 的参数
#[derive(Debug, Clone)]
pub struct RetryOptions {
    /// 全局重试上限，与类别的 max_attempts 取较小值
    pub max_retries: u32,
    /// 覆盖类别自带的基础延迟
    pub base_delay: Option<Duration>,
    pub max_delay: Duration,
    /// 线性/指数退避附加的均匀抖动上限
    pub jitter: Duration,
    pub total_timeout: Duration,
    /// DeadlineAwareRetry 的截止时刻
    pub deadline: Option<DateTime<Utc>>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: None,
            max_delay: Duration::from_secs(5),
            jitter: Duration::from_millis(250),
            total_timeout: Duration::from_secs(60),
            deadline: None,
        }
    }
}

impl RetryOptions {
    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// 停止原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Succeeded,
    NoRetryPolicy,
    CriticalCategory,
    AttemptsExhausted,
    TotalTimeout,
    DeadlineReached,
    /// 关键动作遇到终态（已预约 / 满员）
    TerminalOutcome,
    NotAttempted,
    Interrupted,
}

/// 一次尝试的记录
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub at: DateTime<Utc>,
    pub succeeded: bool,
    pub category: Option<FailureCategory>,
    /// 本次失败后、下次尝试前的等待
    #[serde(serialize_with = "serialize_ms")]
    pub delay: Duration,
    pub message: Option<String>,
}

impl AttemptRecord {
    pub(crate) fn success(attempt: u32, at: DateTime<Utc>) -> Self {
        Self {
            attempt,
            at,
            succeeded: true,
            category: None,
            delay: Duration::ZERO,
            message: None,
        }
    }

    pub(crate) fn failure(
        attempt: u32,
        at: DateTime<Utc>,
        category: FailureCategory,
        delay: Duration,
        error: &ActionError,
    ) -> Self {
        Self {
            attempt,
            at,
            succeeded: false,
            category: Some(category),
            delay,
            message: Some(error.to_string()),
        }
    }
}

/// run 的最终结果，创建后不可变
#[derive(Debug, Clone, Serialize)]
pub struct RetryOutcome<T> {
    succeeded: bool,
    attempts: u32,
    #[serde(rename = "total_elapsed_ms", serialize_with = "serialize_ms")]
    total_elapsed: Duration,
    last_category: Option<FailureCategory>,
    stop_reason: StopReason,
    result: Result<T, ActionError>,
    history: Vec<AttemptRecord>,
}

impl<T> RetryOutcome<T> {
    pub(crate) fn new(
        result: Result<T, ActionError>,
        total_elapsed: Duration,
        last_category: Option<FailureCategory>,
        stop_reason: StopReason,
        history: Vec<AttemptRecord>,
    ) -> Self {
        Self {
            succeeded: result.is_ok(),
            attempts: history.len() as u32,
            total_elapsed,
            last_category,
            stop_reason,
            result,
            history,
        }
    }

    /// 关键动作从未开始（例如准备阶段失败）
    pub(crate) fn not_attempted(reason: ActionError) -> Self {
        Self::new(Err(reason), Duration::ZERO, None, StopReason::NotAttempted, Vec::new())
    }

    pub fn succeeded(&self) -> bool {
        self.succeeded
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn total_elapsed(&self) -> Duration {
        self.total_elapsed
    }

    pub fn last_category(&self) -> Option<FailureCategory> {
        self.last_category
    }

    pub fn stop_reason(&self) -> StopReason {
        self.stop_reason
    }

    pub fn value(&self) -> Option<&T> {
        self.result.as_ref().ok()
    }

    pub fn failure(&self) -> Option<&ActionError> {
        self.result.as_ref().err()
    }

    pub fn history(&self) -> &[AttemptRecord] {
        &self.history
    }

    pub fn into_result(self) -> Result<T, ActionError> {
        self.result
    }
}

enum Decision {
    Retry(Duration),
    Stop(StopReason),
}

/// 分类驱动的重试执行器
#[derive(Clone)]
pub struct RetryCoordinator {
    clock: Arc<dyn Clock>,
    classifier: ErrorClassifier,
}

impl RetryCoordinator {
    pub fn new(clock: Arc<dyn Clock>, classifier: ErrorClassifier) -> Self {
        Self { clock, classifier }
    }

    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    /// 执行 operation 直到成功或策略要求停止；operation 收到从 1 开始的尝试序号。
    /// operation 内部 panic 视为 unknown 类别的失败。
    pub async fn run<T, F, Fut>(&self, label: &str, options: &RetryOptions, mut operation: F) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ActionError>>,
    {
        let started = self.clock.now();
        let mut history = Vec::new();
        let mut last_category = None;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let at = self.clock.now();
            let result = match AssertUnwindSafe(operation(attempt)).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => Err(ActionError::from_panic(payload)),
            };

            let error = match result {
                Ok(value) => {
                    history.push(AttemptRecord::success(attempt, at));
                    tracing::debug!(operation = label, attempt, "attempt succeeded");
                    return RetryOutcome::new(
                        Ok(value),
                        self.elapsed_since(started),
                        last_category,
                        StopReason::Succeeded,
                        history,
                    );
                }
                Err(error) => error,
            };

            let category = self.classifier.categorize(&error);
            let policy = self.classifier.policy(category);
            last_category = Some(category);
            let elapsed = self.elapsed_since(started);

            match self.decide(attempt, &policy, options, elapsed) {
                Decision::Retry(delay) => {
                    history.push(AttemptRecord::failure(attempt, at, category, delay, &error));
                    tracing::warn!(
                        operation = label,
                        attempt,
                        category = %category,
                        strategy = ?policy.strategy,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "attempt failed, retrying"
                    );
                    // 零延迟即立即重试
                    if !delay.is_zero() {
                        self.clock.sleep(delay).await;
                    }
                }
                Decision::Stop(reason) => {
                    history.push(AttemptRecord::failure(attempt, at, category, Duration::ZERO, &error));
                    tracing::warn!(
                        operation = label,
                        attempt,
                        category = %category,
                        reason = ?reason,
                        error = %error,
                        "attempt failed, giving up"
                    );
                    return RetryOutcome::new(
                        Err(error),
                        self.elapsed_since(started),
                        last_category,
                        reason,
                        history,
                    );
                }
            }
        }
    }

    fn decide(&self, attempt: u32, policy: &RetryPolicy, options: &RetryOptions, elapsed: Duration) -> Decision {
        if policy.strategy == RetryStrategy::NoRetry {
            return Decision::Stop(StopReason::NoRetryPolicy);
        }
        if policy.is_critical && policy.strategy != RetryStrategy::ImmediateRetry {
            return Decision::Stop(StopReason::CriticalCategory);
        }
        if attempt > policy.max_attempts.min(options.max_retries) {
            return Decision::Stop(StopReason::AttemptsExhausted);
        }
        if elapsed >= options.total_timeout {
            return Decision::Stop(StopReason::TotalTimeout);
        }

        let delay = compute_delay(policy, attempt, options).min(options.total_timeout - elapsed);

        if policy.strategy == RetryStrategy::DeadlineAwareRetry {
            if let Some(deadline) = options.deadline {
                if self.clock.now() + to_chrono(delay) >= deadline {
                    return Decision::Stop(StopReason::DeadlineReached);
                }
            }
        }
        Decision::Retry(delay)
    }

    fn elapsed_since(&self, started: DateTime<Utc>) -> Duration {
        to_std(self.clock.now() - started)
    }
}

/// 第 attempt 次失败后的等待时间
pub fn compute_delay(policy: &RetryPolicy, attempt: u32, options: &RetryOptions) -> Duration {
    let base = options.base_delay.unwrap_or(policy.base_delay);
    let raw = match policy.strategy {
        // 截止时刻前立即重试，由 decide 负责截止检查
        RetryStrategy::NoRetry | RetryStrategy::ImmediateRetry | RetryStrategy::DeadlineAwareRetry => {
            return Duration::ZERO
        }
        RetryStrategy::LinearBackoff => base.saturating_mul(attempt.max(1)),
        RetryStrategy::ExponentialBackoff => {
            let exp = attempt.saturating_sub(1).min(16);
            base.saturating_mul(2u32.saturating_pow(exp))
        }
    };
    (raw + jitter(options.jitter)).min(options.max_delay)
}

fn jitter(bound: Duration) -> Duration {
    let bound_ms = bound.as_millis() as u64;
    if bound_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=bound_ms))
}
