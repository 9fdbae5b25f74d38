//! 时序记录
//!
//! TimingRecorder 在一次执行中逐步打点，finalize 后得到不可变的 TimingRecord，
//! 并由此算出准点误差（execution_start - target，带符号毫秒）与各阶段耗时。

use chrono::{DateTime, Utc};
use serde::Serialize;

/// 执行过程中的可变打点器
#[derive(Debug)]
pub struct TimingRecorder {
    target: DateTime<Utc>,
    preparation_start: Option<DateTime<Utc>>,
    preparation_end: Option<DateTime<Utc>>,
    execution_start: Option<DateTime<Utc>>,
    execution_end: Option<DateTime<Utc>>,
    preparation_attempts: u32,
}

impl TimingRecorder {
    pub fn new(target: DateTime<Utc>) -> Self {
        Self {
            target,
            preparation_start: None,
            preparation_end: None,
            execution_start: None,
            execution_end: None,
            preparation_attempts: 0,
        }
    }

    pub fn target(&self) -> DateTime<Utc> {
        self.target
    }

    /// 只记录第一次进入准备阶段的时刻
    pub fn mark_preparation_start(&mut self, at: DateTime<Utc>) {
        self.preparation_start.get_or_insert(at);
    }

    pub fn mark_preparation_attempt(&mut self) {
        self.preparation_attempts += 1;
    }

    pub fn mark_preparation_end(&mut self, at: DateTime<Utc>) {
        self.preparation_end = Some(at);
    }

    /// 关键动作第一次尝试的开始时刻；即时重试不改变它
    pub fn mark_execution_start(&mut self, at: DateTime<Utc>) {
        self.execution_start.get_or_insert(at);
    }

    pub fn mark_execution_end(&mut self, at: DateTime<Utc>) {
        self.execution_end = Some(at);
    }

    pub fn finalize(self) -> TimingRecord {
        let accuracy_ms = self
            .execution_start
            .map(|start| (start - self.target).num_milliseconds());
        let preparation_ms = span_ms(self.preparation_start, self.preparation_end);
        let execution_ms = span_ms(self.execution_start, self.execution_end);
        TimingRecord {
            target: self.target,
            preparation_start: self.preparation_start,
            preparation_end: self.preparation_end,
            execution_start: self.execution_start,
            execution_end: self.execution_end,
            preparation_attempts: self.preparation_attempts,
            accuracy_ms,
            preparation_ms,
            execution_ms,
        }
    }
}

fn span_ms(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Option<i64> {
    match (start, end) {
        (Some(s), Some(e)) => Some((e - s).num_milliseconds()),
        _ => None,
    }
}

/// 定稿后的时序记录
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimingRecord {
    target: DateTime<Utc>,
    preparation_start: Option<DateTime<Utc>>,
    preparation_end: Option<DateTime<Utc>>,
    execution_start: Option<DateTime<Utc>>,
    execution_end: Option<DateTime<Utc>>,
    preparation_attempts: u32,
    accuracy_ms: Option<i64>,
    preparation_ms: Option<i64>,
    execution_ms: Option<i64>,
}

impl TimingRecord {
    pub fn target(&self) -> DateTime<Utc> {
        self.target
    }

    pub fn preparation_start(&self) -> Option<DateTime<Utc>> {
        self.preparation_start
    }

    pub fn preparation_end(&self) -> Option<DateTime<Utc>> {
        self.preparation_end
    }

    pub fn execution_start(&self) -> Option<DateTime<Utc>> {
        self.execution_start
    }

    pub fn execution_end(&self) -> Option<DateTime<Utc>> {
        self.execution_end
    }

    pub fn preparation_attempts(&self) -> u32 {
        self.preparation_attempts
    }

    /// 正数表示晚于目标时刻
    pub fn accuracy_ms(&self) -> Option<i64> {
        self.accuracy_ms
    }

    pub fn preparation_ms(&self) -> Option<i64> {
        self.preparation_ms
    }

    pub fn execution_ms(&self) -> Option<i64> {
        self.execution_ms
    }

    /// 准备结束时距目标时刻的余量
    pub fn slack_after_preparation_ms(&self) -> Option<i64> {
        self.preparation_end
            .map(|end| (self.target - end).num_milliseconds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_finalize_derives_accuracy_and_durations() {
        let target = Utc::now();
        let mut recorder = TimingRecorder::new(target);
        recorder.mark_preparation_start(target - Duration::seconds(60));
        recorder.mark_preparation_attempt();
        recorder.mark_preparation_end(target - Duration::seconds(45));
        recorder.mark_execution_start(target + Duration::milliseconds(12));
        recorder.mark_execution_end(target + Duration::milliseconds(812));

        let record = recorder.finalize();
        assert_eq!(record.accuracy_ms(), Some(12));
        assert_eq!(record.preparation_ms(), Some(15_000));
        assert_eq!(record.execution_ms(), Some(800));
        assert_eq!(record.slack_after_preparation_ms(), Some(45_000));
        assert_eq!(record.preparation_attempts(), 1);
    }

    #[test]
    fn test_early_execution_is_negative_accuracy() {
        let target = Utc::now();
        let mut recorder = TimingRecorder::new(target);
        recorder.mark_execution_start(target - Duration::milliseconds(3));
        assert_eq!(recorder.finalize().accuracy_ms(), Some(-3));
    }

    #[test]
    fn test_first_marks_win() {
        let target = Utc::now();
        let mut recorder = TimingRecorder::new(target);
        recorder.mark_preparation_start(target - Duration::seconds(20));
        recorder.mark_preparation_start(target - Duration::seconds(5));
        recorder.mark_execution_start(target);
        recorder.mark_execution_start(target + Duration::milliseconds(400));
        let record = recorder.finalize();
        assert_eq!(record.preparation_start(), Some(target - Duration::seconds(20)));
        assert_eq!(record.accuracy_ms(), Some(0));
    }

    #[test]
    fn test_unreached_phases_are_none() {
        let record = TimingRecorder::new(Utc::now()).finalize();
        assert_eq!(record.accuracy_ms(), None);
        assert_eq!(record.preparation_ms(), None);
        assert_eq!(record.execution_ms(), None);
    }
}
