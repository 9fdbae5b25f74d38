//! 基于选择器的恢复探针

use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use super::ChromeSession;
use crate::core::error::FailureCategory;
use crate::core::recovery::RecoveryProbe;

/// 临时弹窗（cookie 提示、公告等）：出现即点击关闭
pub struct InterstitialProbe {
    session: Arc<ChromeSession>,
    selectors: Vec<String>,
}

impl InterstitialProbe {
    pub fn new(session: Arc<ChromeSession>, selectors: Vec<String>) -> Self {
        Self { session, selectors }
    }
}

#[async_trait]
impl RecoveryProbe for InterstitialProbe {
    fn name(&self) -> &str {
        "interstitial"
    }

    fn category(&self) -> FailureCategory {
        FailureCategory::UnexpectedPopup
    }

    async fn detect(&self) -> bool {
        for selector in &self.selectors {
            if self.session.exists(selector).await {
                return true;
            }
        }
        false
    }

    async fn repair(&self) -> bool {
        let selectors = self.selectors.clone();
        let dismissed = self
            .session
            .with_tab(move |tab| {
                for selector in &selectors {
                    if let Ok(element) = tab.find_element(selector) {
                        element.click()?;
                        tracing::debug!(selector = %selector, "interstitial dismissed");
                        return Ok(true);
                    }
                }
                Ok(false)
            })
            .await;
        matches!(dismissed, Ok(true))
    }
}

/// 会话丢失：登录标志出现说明需要重新认证；这里不做自动登录，直接上报
pub struct SessionLossProbe {
    session: Arc<ChromeSession>,
    login_marker: String,
}

impl SessionLossProbe {
    pub fn new(session: Arc<ChromeSession>, login_marker: String) -> Self {
        Self { session, login_marker }
    }
}

#[async_trait]
impl RecoveryProbe for SessionLossProbe {
    fn name(&self) -> &str {
        "session_loss"
    }

    fn category(&self) -> FailureCategory {
        FailureCategory::SessionExpired
    }

    async fn detect(&self) -> bool {
        self.session.exists(&self.login_marker).await
    }

    async fn repair(&self) -> bool {
        false
    }
}

/// 布局漂移：主选择器失效时，按顺序尝试备用选择器，命中的成为当前选择器
pub struct LocatorDriftProbe {
    session: Arc<ChromeSession>,
    primary: String,
    fallbacks: Vec<String>,
    active: Arc<RwLock<String>>,
}

impl LocatorDriftProbe {
    pub fn new(session: Arc<ChromeSession>, primary: String, fallbacks: Vec<String>) -> Self {
        Self {
            session,
            active: Arc::new(RwLock::new(primary.clone())),
            primary,
            fallbacks,
        }
    }

    /// 与 Preparer / ClickAction 共享的当前选择器
    pub fn active_selector(&self) -> Arc<RwLock<String>> {
        Arc::clone(&self.active)
    }

    fn current(&self) -> String {
        self.active.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl RecoveryProbe for LocatorDriftProbe {
    fn name(&self) -> &str {
        "locator_drift"
    }

    fn category(&self) -> FailureCategory {
        FailureCategory::ElementNotFound
    }

    async fn detect(&self) -> bool {
        !self.session.exists(&self.current()).await
    }

    async fn repair(&self) -> bool {
        let candidates = std::iter::once(&self.primary).chain(self.fallbacks.iter());
        for candidate in candidates {
            if self.session.exists(candidate).await {
                tracing::info!(selector = %candidate, "action locator switched");
                *self.active.write().unwrap_or_else(|e| e.into_inner()) = candidate.clone();
                return true;
            }
        }
        false
    }
}
