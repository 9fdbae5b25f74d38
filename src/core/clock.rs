//! 时钟抽象
//!
//! 所有等待都经过 Clock：SystemClock 采用「粗等待 + 细轮询」逼近目标时刻；
//! VirtualClock 的等待直接推进虚拟时间，测试中无需真实 sleep。

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// 时钟 trait：当前时刻、等待到指定时刻
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// 挂起直到 `now() >= instant`；过去的时刻立即返回
    async fn wait_until(&self, instant: DateTime<Utc>);

    async fn sleep(&self, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        let target = self
            .now()
            .checked_add_signed(to_chrono(duration))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.wait_until(target).await;
    }
}

/// std Duration 转 chrono Duration，溢出时取最大值
pub fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// chrono Duration 转 std Duration，负值取 0
pub fn to_std(duration: chrono::Duration) -> Duration {
    duration.to_std().unwrap_or(Duration::ZERO)
}

/// 墙上时钟：剩余时间超过粗等待余量时一次 sleep 到「目标 - 余量」，余下部分按 fine_poll 间隔轮询
#[derive(Debug, Clone)]
pub struct SystemClock {
    coarse_margin: Duration,
    fine_poll: Duration,
}

impl SystemClock {
    pub fn new(coarse_margin: Duration, fine_poll: Duration) -> Self {
        Self {
            coarse_margin,
            fine_poll: fine_poll.max(Duration::from_micros(100)),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_millis(1))
    }
}

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn wait_until(&self, instant: DateTime<Utc>) {
        let remaining = to_std(instant - Utc::now());
        if remaining.is_zero() {
            return;
        }

        if remaining > self.coarse_margin {
            tokio::time::sleep(remaining - self.coarse_margin).await;
        }

        // 细轮询只覆盖最后 coarse_margin 这一段
        while Utc::now() < instant {
            tokio::time::sleep(self.fine_poll).await;
        }
    }
}

/// 虚拟时钟：wait_until 立即把当前时刻推进到目标时刻
///
/// 多个任务共享同一个 VirtualClock 时，时间只会单调前进。
#[derive(Debug, Clone)]
pub struct VirtualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl VirtualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    /// 模拟操作耗时
    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now = now.checked_add_signed(to_chrono(duration)).unwrap_or(DateTime::<Utc>::MAX_UTC);
    }

    fn advance_to(&self, instant: DateTime<Utc>) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        if instant > *now {
            *now = instant;
        }
    }
}

#[async_trait]
impl Clock for VirtualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn wait_until(&self, instant: DateTime<Utc>) {
        self.advance_to(instant);
        tokio::task::yield_now().await;
    }
}
