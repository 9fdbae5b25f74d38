//! 调度条目：一次执行的不可变快照

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::core::scheduler::calculate_preparation_instant;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("schedule id must not be empty")]
    EmptyId,

    #[error("duplicate schedule id '{0}'")]
    DuplicateId(String),

    #[error("schedule '{0}' has a zero buffer")]
    ZeroBuffer(String),
}

/// 目标时刻 + 准备提前量
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Schedule {
    pub id: String,
    pub target: DateTime<Utc>,
    pub buffer_secs: u64,
    pub enabled: bool,
}

impl Schedule {
    pub fn new(id: impl Into<String>, target: DateTime<Utc>, buffer_secs: u64) -> Self {
        Self {
            id: id.into(),
            target,
            buffer_secs,
            enabled: true,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn buffer(&self) -> Duration {
        Duration::from_secs(self.buffer_secs)
    }

    pub fn preparation_instant(&self) -> DateTime<Utc> {
        calculate_preparation_instant(self.target, self.buffer())
    }

    /// 目标时刻必须严格晚于 now
    pub fn is_future_at(&self, now: DateTime<Utc>) -> bool {
        self.target > now
    }

    pub fn validate(&self) -> Result<(), ScheduleError> {
        if self.id.trim().is_empty() {
            return Err(ScheduleError::EmptyId);
        }
        if self.buffer_secs == 0 {
            return Err(ScheduleError::ZeroBuffer(self.id.clone()));
        }
        Ok(())
    }
}

/// 校验整组条目：各自合法且 id 唯一
pub fn validate_all(schedules: &[Schedule]) -> Result<(), ScheduleError> {
    let mut seen = HashSet::new();
    for schedule in schedules {
        schedule.validate()?;
        if !seen.insert(schedule.id.as_str()) {
            return Err(ScheduleError::DuplicateId(schedule.id.clone()));
        }
    }
    Ok(())
}
