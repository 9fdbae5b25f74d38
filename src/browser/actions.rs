//! 通用的导航准备与点击动作

use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use super::ChromeSession;
use crate::core::action::{ActionOutcome, CriticalAction, PreparationContext, Preparer};
use crate::core::classifier::ErrorClassifier;
use crate::core::error::ActionError;
use crate::core::recovery::RecoveryLayer;

fn read_selector(selector: &RwLock<String>) -> String {
    selector.read().unwrap_or_else(|e| e.into_inner()).clone()
}

/// 打开起始页，等待就绪标志，跑一轮恢复，最后确认动作目标可见
pub struct NavigatePreparer {
    session: Arc<ChromeSession>,
    start_url: String,
    ready_selector: Option<String>,
    recovery: RecoveryLayer,
    action_selector: Arc<RwLock<String>>,
}

impl NavigatePreparer {
    pub fn new(
        session: Arc<ChromeSession>,
        start_url: String,
        ready_selector: Option<String>,
        recovery: RecoveryLayer,
        action_selector: Arc<RwLock<String>>,
    ) -> Self {
        Self {
            session,
            start_url,
            ready_selector,
            recovery,
            action_selector,
        }
    }

    async fn load_page(&self) -> Result<(), ActionError> {
        let url = self.start_url.clone();
        let ready = self.ready_selector.clone().unwrap_or_else(|| "body".to_string());
        let timeout = self.session.element_timeout();
        self.session
            .with_tab(move |tab| {
                tab.navigate_to(&url)?;
                tab.wait_until_navigated()?;
                tab.wait_for_element_with_custom_timeout(&ready, timeout)?;
                Ok(())
            })
            .await?;
        self.recovery.run_pass().await?;
        Ok(())
    }
}

#[async_trait]
impl Preparer for NavigatePreparer {
    async fn prepare(&self, ctx: &PreparationContext) -> Result<(), ActionError> {
        tracing::info!(schedule_id = %ctx.schedule_id, attempt = ctx.attempt, url = %self.start_url, "preparing page");
        ctx.retry
            .run("navigate", &ctx.retry_options, |_| self.load_page())
            .await
            .into_result()?;

        let selector = read_selector(&self.action_selector);
        let timeout = self.session.element_timeout();
        self.session
            .with_tab(move |tab| {
                tab.wait_for_element_with_custom_timeout(&selector, timeout)?;
                Ok(())
            })
            .await
    }
}

/// 点击动作目标，再读取结果文本判断预约状态；报错文本按分类失败，进入关键动作的重试规则
pub struct ClickAction {
    session: Arc<ChromeSession>,
    action_selector: Arc<RwLock<String>>,
    status_selector: Option<String>,
    success_marker: Option<String>,
    classifier: ErrorClassifier,
}

impl ClickAction {
    pub fn new(
        session: Arc<ChromeSession>,
        action_selector: Arc<RwLock<String>>,
        status_selector: Option<String>,
        success_marker: Option<String>,
        classifier: ErrorClassifier,
    ) -> Self {
        Self {
            session,
            action_selector,
            status_selector,
            success_marker,
            classifier,
        }
    }
}

#[async_trait]
impl CriticalAction for ClickAction {
    async fn attempt(&self, attempt: u32) -> Result<ActionOutcome, ActionError> {
        let selector = read_selector(&self.action_selector);
        let status_selector = self.status_selector.clone();
        let timeout = self.session.element_timeout();
        tracing::debug!(attempt, selector = %selector, "clicking action target");

        let status = self
            .session
            .with_tab(move |tab| {
                tab.find_element(&selector)?.click()?;
                match status_selector {
                    Some(status) => {
                        let text = tab
                            .wait_for_element_with_custom_timeout(&status, timeout)?
                            .get_inner_text()?;
                        Ok(Some(text))
                    }
                    None => Ok(None),
                }
            })
            .await?;

        match status {
            Some(text) => {
                ActionOutcome::from_status_text(&text, self.success_marker.as_deref(), &self.classifier)
            }
            None => Ok(ActionOutcome::booked(None)),
        }
    }
}
