//! 浏览器适配层：使用 Headless Chrome 实现 Preparer / CriticalAction / ScopedResource
//!
//! 需启用 feature "browser" 且系统已安装 Chrome/Chromium。
//! 所有选择器来自 [browser] 配置段；headless_chrome 是同步 API，统一经 spawn_blocking 调用。

mod actions;
mod probes;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use headless_chrome::{Browser, LaunchOptions, Tab};

use crate::config::BrowserSection;
use crate::core::action::{ScopedResource, Workload, WorkloadFactory};
use crate::core::classifier::ErrorClassifier;
use crate::core::error::{ActionError, FailureCategory};
use crate::core::recovery::RecoveryLayer;
use crate::schedule::Schedule;

pub use actions::{ClickAction, NavigatePreparer};
pub use probes::{InterstitialProbe, LocatorDriftProbe, SessionLossProbe};

/// 单次执行独占的浏览器会话
pub struct ChromeSession {
    browser: Mutex<Option<Browser>>,
    tab: Arc<Tab>,
    element_timeout: Duration,
}

impl ChromeSession {
    pub async fn launch(headless: bool, element_timeout: Duration) -> Result<Arc<Self>, ActionError> {
        let launched = tokio::task::spawn_blocking(move || {
            let options = LaunchOptions::default_builder()
                .headless(headless)
                .build()
                .map_err(|e| anyhow::anyhow!("invalid launch options: {}", e))?;
            let browser = Browser::new(options)?;
            let tab = browser.new_tab()?;
            Ok::<_, anyhow::Error>((browser, tab))
        })
        .await
        .map_err(|e| ActionError::categorized(FailureCategory::BrowserLaunchFailed, format!("launch task join: {e}")))?;

        let (browser, tab) = launched.map_err(|e| {
            ActionError::categorized(FailureCategory::BrowserLaunchFailed, format!("Chrome launch failed: {e:#}"))
        })?;
        tracing::info!(headless, "browser session started");
        Ok(Arc::new(Self {
            browser: Mutex::new(Some(browser)),
            tab,
            element_timeout,
        }))
    }

    pub fn element_timeout(&self) -> Duration {
        self.element_timeout
    }

    /// 在阻塞线程上操作当前 Tab；驱动错误按消息文本分类
    pub async fn with_tab<T, F>(&self, f: F) -> Result<T, ActionError>
    where
        F: FnOnce(&Tab) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let tab = Arc::clone(&self.tab);
        tokio::task::spawn_blocking(move || f(&tab))
            .await
            .map_err(|e| ActionError::categorized(FailureCategory::BrowserCrashed, format!("browser task join: {e}")))?
            .map_err(ActionError::from)
    }

    /// 选择器当前是否存在（不等待）
    pub async fn exists(&self, selector: &str) -> bool {
        let selector = selector.to_string();
        self.with_tab(move |tab| Ok(tab.find_element(&selector).is_ok()))
            .await
            .unwrap_or(false)
    }
}

#[async_trait]
impl ScopedResource for ChromeSession {
    fn name(&self) -> &str {
        "chrome"
    }

    async fn release(&self) -> anyhow::Result<()> {
        let browser = self
            .browser
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let tab = Arc::clone(&self.tab);
        tokio::task::spawn_blocking(move || {
            let closed = tab.close(false);
            // 丢弃 Browser 即结束 Chrome 进程
            drop(browser);
            closed.map(|_| ())
        })
        .await??;
        Ok(())
    }
}

/// 为每个 Schedule 启动独立的浏览器会话
pub struct ChromeWorkloadFactory {
    config: BrowserSection,
    probe_timeout: Duration,
    start_url: String,
    action_selector: String,
}

impl ChromeWorkloadFactory {
    /// start_url 与 action_selector 必填
    pub fn new(config: BrowserSection, probe_timeout: Duration) -> Result<Self, ActionError> {
        let start_url = required(&config.start_url, "browser.start_url")?;
        let action_selector = required(&config.action_selector, "browser.action_selector")?;
        Ok(Self {
            config,
            probe_timeout,
            start_url,
            action_selector,
        })
    }
}

fn required(value: &Option<String>, key: &str) -> Result<String, ActionError> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ActionError::categorized(FailureCategory::InvalidConfiguration, format!("{key} is not configured")))
}

#[async_trait]
impl WorkloadFactory for ChromeWorkloadFactory {
    async fn build(&self, schedule: &Schedule) -> Result<Workload, ActionError> {
        let session = ChromeSession::launch(
            self.config.headless,
            Duration::from_millis(self.config.element_timeout_ms),
        )
        .await?;

        let drift = Arc::new(LocatorDriftProbe::new(
            Arc::clone(&session),
            self.action_selector.clone(),
            self.config.fallback_action_selectors.clone(),
        ));
        let mut recovery = RecoveryLayer::new(self.probe_timeout);
        if !self.config.interstitial_selectors.is_empty() {
            recovery.register(Arc::new(InterstitialProbe::new(
                Arc::clone(&session),
                self.config.interstitial_selectors.clone(),
            )));
        }
        if let Some(marker) = &self.config.login_marker_selector {
            recovery.register(Arc::new(SessionLossProbe::new(Arc::clone(&session), marker.clone())));
        }
        let recovery = recovery.with_probe(drift.clone());
        tracing::debug!(schedule_id = %schedule.id, probes = ?recovery.probe_names(), "browser workload ready");

        let preparer = NavigatePreparer::new(
            Arc::clone(&session),
            self.start_url.clone(),
            self.config.ready_selector.clone(),
            recovery,
            drift.active_selector(),
        );
        let action = ClickAction::new(
            Arc::clone(&session),
            drift.active_selector(),
            self.config.status_selector.clone(),
            self.config.success_marker.clone(),
            ErrorClassifier::new(),
        );

        Ok(Workload {
            preparer: Arc::new(preparer),
            action: Arc::new(action),
            resource: Some(session),
        })
    }
}
