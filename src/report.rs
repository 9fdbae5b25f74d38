//! 结果投递：审计日志、JSON Lines 历史文件、Webhook
//!
//! 投递失败只记 warn，不影响已经定稿的 ExecutionResult。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::config::ReportSection;
use crate::core::coordinator::ExecutionResult;

/// 结果接收方
#[async_trait]
pub trait ResultSink: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, result: &ExecutionResult) -> anyhow::Result<()>;
}

/// 以一行 JSON 审计事件写入 tracing
#[derive(Debug, Default)]
pub struct TracingSink;

#[async_trait]
impl ResultSink for TracingSink {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn deliver(&self, result: &ExecutionResult) -> anyhow::Result<()> {
        let audit = serde_json::json!({
            "event": "execution_audit",
            "run_id": result.run_id,
            "schedule_id": result.schedule_id,
            "success": result.success,
            "state": result.final_state,
            "category": result.failure_category,
            "reason": result.reason,
            "accuracy_ms": result.accuracy_ms(),
            "attempts": result.critical.attempts(),
            "preparation_attempts": result.timing.preparation_attempts(),
        });
        tracing::info!(audit = %audit.to_string(), "execution");
        Ok(())
    }
}

/// 追加写入 JSON Lines 文件，每个结果一行
pub struct JsonlSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl ResultSink for JsonlSink {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn deliver(&self, result: &ExecutionResult) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(result).context("serialize execution result")?;
        line.push('\n');

        // 并发执行的多个 Schedule 共用同一文件
        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("open {}", self.path.display()))?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

/// POST 结果 JSON 到 webhook
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("build webhook client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl ResultSink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deliver(&self, result: &ExecutionResult) -> anyhow::Result<()> {
        let resp = self
            .client
            .post(&self.url)
            .json(result)
            .send()
            .await
            .context("send webhook")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("webhook returned {}: {}", status, text);
        }
        Ok(())
    }
}

/// 按 [report] 段组装接收方；TracingSink 总是启用
pub fn sinks_from_config(cfg: &ReportSection) -> anyhow::Result<Vec<Arc<dyn ResultSink>>> {
    let mut sinks: Vec<Arc<dyn ResultSink>> = vec![Arc::new(TracingSink)];
    if let Some(path) = &cfg.jsonl_path {
        sinks.push(Arc::new(JsonlSink::new(path.clone())));
    }
    if let Some(url) = cfg.webhook_url.as_deref().filter(|u| !u.trim().is_empty()) {
        sinks.push(Arc::new(WebhookSink::new(
            url,
            Duration::from_secs(cfg.webhook_timeout_secs),
        )?));
    }
    Ok(sinks)
}

/// 依次投递到所有接收方
pub async fn deliver_all(sinks: &[Arc<dyn ResultSink>], result: &ExecutionResult) {
    for sink in sinks {
        if let Err(e) = sink.deliver(result).await {
            tracing::warn!(
                sink = sink.name(),
                schedule_id = %result.schedule_id,
                "result delivery failed: {:#}",
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::core::action::{ActionOutcome, CriticalAction, PreparationContext, Preparer};
    use crate::core::clock::{Clock, VirtualClock};
    use crate::core::coordinator::{CoordinatorSettings, ExecutionCoordinator};
    use crate::core::error::ActionError;
    use crate::schedule::Schedule;

    struct Noop;

    #[async_trait]
    impl Preparer for Noop {
        async fn prepare(&self, _ctx: &PreparationContext) -> Result<(), ActionError> {
            Ok(())
        }
    }

    #[async_trait]
    impl CriticalAction for Noop {
        async fn attempt(&self, _attempt: u32) -> Result<ActionOutcome, ActionError> {
            Ok(ActionOutcome::already_booked())
        }
    }

    struct BrokenSink {
        calls: AtomicU32,
    }

    #[async_trait]
    impl ResultSink for BrokenSink {
        fn name(&self) -> &str {
            "broken"
        }

        async fn deliver(&self, _result: &ExecutionResult) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("unreachable endpoint")
        }
    }

    async fn sample_result(id: &str) -> ExecutionResult {
        let clock = VirtualClock::starting_now();
        let coordinator = ExecutionCoordinator::new(Arc::new(clock.clone()), CoordinatorSettings::default());
        let schedule = Schedule::new(id, clock.now() + chrono::Duration::seconds(10), 5);
        coordinator.execute(&schedule, &Noop, &Noop).await
    }

    #[tokio::test]
    async fn test_jsonl_appends_one_line_per_result() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history").join("results.jsonl");
        let sink = JsonlSink::new(&path);

        sink.deliver(&sample_result("a").await).await.unwrap();
        sink.deliver(&sample_result("b").await).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["schedule_id"], "a");
        assert_eq!(first["critical"]["result"]["Ok"]["class_status"], "already_booked");
    }

    #[tokio::test]
    async fn test_failing_sink_does_not_stop_others() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.jsonl");
        let broken = Arc::new(BrokenSink { calls: AtomicU32::new(0) });
        let sinks: Vec<Arc<dyn ResultSink>> = vec![broken.clone(), Arc::new(JsonlSink::new(&path))];

        deliver_all(&sinks, &sample_result("c").await).await;
        assert_eq!(broken.calls.load(Ordering::SeqCst), 1);
        assert!(std::fs::read_to_string(&path).unwrap().contains("\"c\""));
    }

    #[test]
    fn test_sinks_from_config() {
        let cfg = ReportSection {
            jsonl_path: Some(PathBuf::from("results.jsonl")),
            webhook_url: Some("  ".into()),
            webhook_timeout_secs: 5,
        };
        let names: Vec<String> = sinks_from_config(&cfg)
            .unwrap()
            .iter()
            .map(|s| s.name().to_string())
            .collect();
        assert_eq!(names, vec!["tracing", "jsonl"]);
    }
}
