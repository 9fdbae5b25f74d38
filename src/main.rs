//! Tock - 准点执行器
//!
//! 入口：初始化日志、加载配置，按子命令执行调度、演练、校准或分类调试。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tock::config::{load_config, AppConfig};
use tock::core::{
    Clock, Dispatcher, ErrorClassifier, ExecutionCoordinator, ShutdownManager, WorkloadFactory,
};
use tock::rehearsal::RehearsalFactory;
use tock::report::sinks_from_config;
use tock::Schedule;

#[derive(Debug, Parser)]
#[command(name = "tock", version, about = "在精确的目标时刻执行浏览器动作")]
struct Cli {
    /// 额外的配置文件，覆盖 config/default.toml
    #[arg(long, short, env = "TOCK_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// 以 JSON 行输出日志
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// 执行配置中所有启用的 Schedule
    Run {
        /// 不驱动浏览器，只走完时序协议
        #[arg(long)]
        dry_run: bool,
    },
    /// 校验配置并列出 Schedule
    Check,
    /// 在 N 毫秒后执行一次空动作，报告准点误差
    Probe {
        #[arg(long, default_value_t = 3000)]
        in_ms: u64,
        #[arg(long, default_value_t = 1)]
        buffer_secs: u64,
        #[arg(long, default_value_t = 1)]
        repeat: u32,
    },
    /// 显示一条错误消息的分类与重试策略
    Classify { message: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tock::observability::init(cli.json_logs);

    match cli.command {
        Command::Classify { message } => classify(&message),
        Command::Check => {
            let cfg = load(cli.config)?;
            check(&cfg)
        }
        Command::Probe {
            in_ms,
            buffer_secs,
            repeat,
        } => {
            let cfg = load(cli.config)?;
            probe(&cfg, in_ms, buffer_secs, repeat).await
        }
        Command::Run { dry_run } => {
            let cfg = load(cli.config)?;
            run(&cfg, dry_run).await
        }
    }
}

fn load(path: Option<PathBuf>) -> anyhow::Result<AppConfig> {
    load_config(path).context("Failed to load config")
}

fn coordinator(cfg: &AppConfig) -> ExecutionCoordinator {
    ExecutionCoordinator::new(Arc::new(cfg.system_clock()), cfg.coordinator_settings())
}

fn classify(message: &str) -> anyhow::Result<()> {
    let classifier = ErrorClassifier::new();
    let category = classifier.classify(message);
    let policy = classifier.policy(category);
    let out = serde_json::json!({
        "category": category,
        "group": category.group(),
        "policy": policy,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn check(cfg: &AppConfig) -> anyhow::Result<()> {
    let schedules = cfg.schedules().context("Invalid schedules")?;
    #[cfg(feature = "browser")]
    let _factory = tock::browser::ChromeWorkloadFactory::new(cfg.browser.clone(), cfg.probe_timeout())
        .map_err(|e| anyhow::anyhow!("Invalid browser config: {}", e))?;

    let now = chrono::Utc::now();
    println!("{} schedule(s)", schedules.len());
    for s in &schedules {
        let status = if !s.enabled {
            "disabled"
        } else if !s.is_future_at(now) {
            "expired"
        } else {
            "pending"
        };
        println!(
            "  {:<20} target {}  prepare at {}  [{}]",
            s.id,
            s.target.to_rfc3339(),
            s.preparation_instant().to_rfc3339(),
            status
        );
    }
    Ok(())
}

async fn probe(cfg: &AppConfig, in_ms: u64, buffer_secs: u64, repeat: u32) -> anyhow::Result<()> {
    let coordinator = coordinator(cfg);
    let workload = RehearsalFactory::default().workload();
    let mut accuracies = Vec::new();

    for i in 0..repeat.max(1) {
        let target = coordinator
            .clock()
            .now()
            .checked_add_signed(chrono::Duration::milliseconds(in_ms.max(1) as i64))
            .context("probe target out of range")?;
        let schedule = Schedule::new(format!("probe-{}", i + 1), target, buffer_secs.max(1));
        let result = coordinator.execute_workload(&schedule, &workload).await;
        let accuracy = result.accuracy_ms();
        println!(
            "{}: state {:?}, accuracy {} ms",
            schedule.id,
            result.final_state,
            accuracy.map_or_else(|| "n/a".to_string(), |a| format!("{a:+}"))
        );
        accuracies.extend(accuracy);
    }

    if let Some(worst) = accuracies.iter().map(|a| a.abs()).max() {
        let warn = cfg.timing.accuracy_warn_ms as i64;
        println!("worst |accuracy| {} ms (warn threshold {} ms)", worst, warn);
    }
    Ok(())
}

async fn run(cfg: &AppConfig, dry_run: bool) -> anyhow::Result<()> {
    let schedules = cfg.schedules().context("Invalid schedules")?;
    if schedules.is_empty() {
        tracing::warn!("No schedules configured");
        return Ok(());
    }

    let factory = workload_factory(cfg, dry_run)?;
    let sinks = sinks_from_config(&cfg.report)?;
    let dispatcher = Dispatcher::new(coordinator(cfg), factory)
        .with_sinks(sinks)
        .with_dispatch_lead(Duration::from_secs(5));

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    let enabled = schedules.iter().filter(|s| s.enabled).count();
    tracing::info!(count = enabled, dry_run, "dispatching schedules");
    let results = dispatcher.run(schedules, shutdown.token()).await;
    if let Some(reason) = shutdown.reason() {
        tracing::warn!(
            reason = ?reason,
            skipped = enabled.saturating_sub(results.len()),
            "run interrupted before all schedules were dispatched"
        );
    }

    let failed = results.iter().filter(|r| !r.success).count();
    for r in &results {
        println!(
            "{:<20} {:<9} {:?}  accuracy {} ms  {}",
            r.schedule_id,
            if r.success { "ok" } else { "not ok" },
            r.final_state,
            r.accuracy_ms().map_or_else(|| "n/a".to_string(), |a| format!("{a:+}")),
            r.reason
        );
    }
    tracing::info!(finished = results.len(), failed, "all schedules finished");
    Ok(())
}

fn workload_factory(cfg: &AppConfig, dry_run: bool) -> anyhow::Result<Arc<dyn WorkloadFactory>> {
    if dry_run {
        return Ok(Arc::new(RehearsalFactory::default()));
    }

    #[cfg(feature = "browser")]
    {
        let factory = tock::browser::ChromeWorkloadFactory::new(cfg.browser.clone(), cfg.probe_timeout())
            .map_err(|e| anyhow::anyhow!("Invalid browser config: {}", e))?;
        Ok(Arc::new(factory))
    }

    #[cfg(not(feature = "browser"))]
    {
        let _ = cfg;
        anyhow::bail!("built without the \"browser\" feature; rebuild with --features browser or use --dry-run")
    }
}
