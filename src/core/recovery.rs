//! 环境恢复层
//!
//! 一组按固定优先级排列的「检测 + 修复」探针，由 Preparer 在准备阶段按需调用，
//! 不进入截止时刻的关键路径。每一步都有固定超时；修复失败以分类错误上报，不吞掉。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::core::error::{ActionError, FailureCategory};

/// 探针：检测某类环境异常并尝试修复
#[async_trait]
pub trait RecoveryProbe: Send + Sync {
    fn name(&self) -> &str;

    /// 修复失败时上报的类别
    fn category(&self) -> FailureCategory;

    async fn detect(&self) -> bool;

    async fn repair(&self) -> bool;
}

/// 一轮检测的结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RecoveryReport {
    /// 没有探针命中
    Clean,
    /// 命中并修复成功
    Repaired { probe: String },
}

/// 恢复层：探针列表顺序即优先级
#[derive(Clone)]
pub struct RecoveryLayer {
    probes: Vec<Arc<dyn RecoveryProbe>>,
    step_timeout: Duration,
}

impl RecoveryLayer {
    pub fn new(step_timeout: Duration) -> Self {
        Self {
            probes: Vec::new(),
            step_timeout,
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn RecoveryProbe>) -> Self {
        self.probes.push(probe);
        self
    }

    pub fn register(&mut self, probe: Arc<dyn RecoveryProbe>) {
        self.probes.push(probe);
    }

    pub fn probe_names(&self) -> Vec<&str> {
        self.probes.iter().map(|p| p.name()).collect()
    }

    /// 按优先级检测，第一个命中的探针执行修复，其余跳过
    pub async fn run_pass(&self) -> Result<RecoveryReport, ActionError> {
        for probe in &self.probes {
            let name = probe.name();
            let detected = match tokio::time::timeout(self.step_timeout, probe.detect()).await {
                Ok(detected) => detected,
                Err(_) => {
                    tracing::debug!(probe = name, "detector timed out, treating as not detected");
                    false
                }
            };
            if !detected {
                continue;
            }

            tracing::info!(probe = name, "recovery probe triggered");
            return match tokio::time::timeout(self.step_timeout, probe.repair()).await {
                Ok(true) => {
                    tracing::info!(probe = name, "recovery repair succeeded");
                    Ok(RecoveryReport::Repaired {
                        probe: name.to_string(),
                    })
                }
                Ok(false) => {
                    tracing::warn!(probe = name, category = %probe.category(), "recovery repair failed");
                    Err(ActionError::categorized(
                        probe.category(),
                        format!("recovery probe '{name}' could not repair"),
                    ))
                }
                Err(_) => {
                    tracing::warn!(probe = name, category = %probe.category(), "recovery repair timed out");
                    Err(ActionError::categorized(
                        probe.category(),
                        format!(
                            "recovery probe '{name}' repair timed out after {}ms",
                            self.step_timeout.as_millis()
                        ),
                    ))
                }
            };
        }
        Ok(RecoveryReport::Clean)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct StubProbe {
        name: &'static str,
        detected: bool,
        repaired: bool,
        hang: bool,
        detect_calls: AtomicU32,
        repair_calls: AtomicU32,
    }

    impl StubProbe {
        fn new(name: &'static str, detected: bool, repaired: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                detected,
                repaired,
                hang: false,
                detect_calls: AtomicU32::new(0),
                repair_calls: AtomicU32::new(0),
            })
        }

        fn hanging(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                detected: true,
                repaired: true,
                hang: true,
                detect_calls: AtomicU32::new(0),
                repair_calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl RecoveryProbe for StubProbe {
        fn name(&self) -> &str {
            self.name
        }

        fn category(&self) -> FailureCategory {
            FailureCategory::UnexpectedPopup
        }

        async fn detect(&self) -> bool {
            self.detect_calls.fetch_add(1, Ordering::SeqCst);
            self.detected
        }

        async fn repair(&self) -> bool {
            self.repair_calls.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                std::future::pending::<()>().await;
            }
            self.repaired
        }
    }

    #[tokio::test]
    async fn test_clean_pass() {
        let a = StubProbe::new("a", false, false);
        let layer = RecoveryLayer::new(Duration::from_secs(1)).with_probe(a.clone());
        assert_eq!(layer.run_pass().await.unwrap(), RecoveryReport::Clean);
        assert_eq!(a.repair_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_first_match_wins_rest_skipped() {
        let a = StubProbe::new("a", false, false);
        let b = StubProbe::new("b", true, true);
        let c = StubProbe::new("c", true, true);
        let layer = RecoveryLayer::new(Duration::from_secs(1))
            .with_probe(a.clone())
            .with_probe(b.clone())
            .with_probe(c.clone());
        assert_eq!(layer.probe_names(), vec!["a", "b", "c"]);

        let report = layer.run_pass().await.unwrap();
        assert_eq!(report, RecoveryReport::Repaired { probe: "b".into() });
        assert_eq!(a.detect_calls.load(Ordering::SeqCst), 1);
        assert_eq!(c.detect_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_repair_is_classified() {
        let layer = RecoveryLayer::new(Duration::from_secs(1)).with_probe(StubProbe::new("popup", true, false));
        let err = layer.run_pass().await.unwrap_err();
        assert_eq!(err.category_hint(), Some(FailureCategory::UnexpectedPopup));
        assert!(err.message().contains("popup"));
    }

    #[tokio::test]
    async fn test_repair_is_time_boxed() {
        let layer = RecoveryLayer::new(Duration::from_millis(30)).with_probe(StubProbe::hanging("stuck"));
        let err = layer.run_pass().await.unwrap_err();
        assert!(err.message().contains("timed out"));
    }
}
