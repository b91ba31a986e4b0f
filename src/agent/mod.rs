//! 页内代理：在浏览上下文中执行删除交互
//!
//! 收到 deletePhoto 后依次执行：定位并点击删除按钮 → 定位并点击确认按钮 → 等待删除提示。
//! 每一步有独立超时；无论成败，恰好回复一条 deletePhoto.result 到总线。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::AgentSection;
use crate::protocol::{Bus, ItemResult, Message};

/// 演练模式下每项的失败原因；客户端不会把它当作已删除
pub const DRY_RUN_ERROR: &str = "dry run, nothing deleted";

/// 页面操作抽象（Chrome Tab / 模拟页面）
#[async_trait]
pub trait PageDriver: Send + Sync {
    /// 等待元素出现；超时内未出现返回 Ok(false)
    async fn wait_for(&self, selector: &str, timeout: Duration) -> Result<bool, String>;

    async fn click(&self, selector: &str) -> Result<(), String>;

    async fn current_url(&self) -> Result<String, String>;
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    #[error("{step}: element {selector} did not appear within {timeout_ms}ms")]
    StepTimeout {
        step: &'static str,
        selector: String,
        timeout_ms: u64,
    },

    #[error("{step}: {detail}")]
    Driver { step: &'static str, detail: String },
}

/// 单个交互步骤
struct Step<'a> {
    name: &'static str,
    selector: &'a str,
    click: bool,
}

pub struct InPageAgent {
    config: AgentSection,
    driver: Arc<dyn PageDriver>,
    bus: Bus,
}

impl InPageAgent {
    pub fn new(config: AgentSection, driver: Arc<dyn PageDriver>, bus: Bus) -> Self {
        Self { config, driver, bus }
    }

    fn steps(&self) -> Vec<Step<'_>> {
        if self.config.dry_run {
            return vec![Step {
                name: "locate trash button",
                selector: &self.config.trash_selector,
                click: false,
            }];
        }
        vec![
            Step {
                name: "trash button",
                selector: &self.config.trash_selector,
                click: true,
            },
            Step {
                name: "confirm button",
                selector: &self.config.confirm_selector,
                click: true,
            },
            Step {
                name: "confirmation toast",
                selector: &self.config.toast_selector,
                click: false,
            },
        ]
    }

    async fn run_step(&self, step: &Step<'_>) -> Result<(), AgentError> {
        let timeout = Duration::from_millis(self.config.step_timeout_ms);
        let found = tokio::time::timeout(timeout, self.driver.wait_for(step.selector, timeout))
            .await
            .unwrap_or(Ok(false))
            .map_err(|detail| AgentError::Driver {
                step: step.name,
                detail,
            })?;

        if !found {
            return Err(AgentError::StepTimeout {
                step: step.name,
                selector: step.selector.to_string(),
                timeout_ms: self.config.step_timeout_ms,
            });
        }

        tracing::debug!(step = step.name, "element found");
        if step.click {
            self.driver
                .click(step.selector)
                .await
                .map_err(|detail| AgentError::Driver {
                    step: step.name,
                    detail,
                })?;
        }
        Ok(())
    }

    /// 执行删除交互，返回该项结果
    pub async fn delete(&self, media_item_id: &str) -> ItemResult {
        for step in self.steps() {
            if let Err(e) = self.run_step(&step).await {
                tracing::warn!(item_id = %media_item_id, error = %e, "in-page deletion failed");
                return ItemResult::failed(media_item_id, e.to_string());
            }
        }
        if self.config.dry_run {
            tracing::info!(item_id = %media_item_id, "dry run, trash control located");
            return ItemResult::failed(media_item_id, DRY_RUN_ERROR);
        }

        let user_url = match self.driver.current_url().await {
            Ok(url) => Some(url),
            Err(e) => {
                tracing::debug!(error = %e, "could not read page url");
                None
            }
        };
        tracing::info!(item_id = %media_item_id, "in-page deletion succeeded");
        ItemResult::deleted(media_item_id, user_url)
    }

    /// 处理一条 deletePhoto 并把结果发布到总线
    pub async fn respond(&self, media_item_id: &str) -> ItemResult {
        let result = self.delete(media_item_id).await;
        self.bus.publish(Message::DeletePhotoResult(result.clone()));
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::protocol::DEFAULT_APP_TAG;

    /// 记录点击的假页面；`missing` 中的选择器永远不会出现
    struct FakePage {
        missing: Vec<String>,
        clicks: Mutex<Vec<String>>,
    }

    impl FakePage {
        fn new(missing: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                missing: missing.iter().map(|s| s.to_string()).collect(),
                clicks: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl PageDriver for FakePage {
        async fn wait_for(&self, selector: &str, _timeout: Duration) -> Result<bool, String> {
            Ok(!self.missing.iter().any(|m| m == selector))
        }

        async fn click(&self, selector: &str) -> Result<(), String> {
            self.clicks.lock().unwrap().push(selector.to_string());
            Ok(())
        }

        async fn current_url(&self) -> Result<String, String> {
            Ok("https://photos.example/photo/a".to_string())
        }
    }

    fn config() -> AgentSection {
        AgentSection {
            step_timeout_ms: 50,
            ..AgentSection::default()
        }
    }

    #[tokio::test]
    async fn test_full_sequence_clicks_trash_then_confirm() {
        let page = FakePage::new(&[]);
        let bus = Bus::new(DEFAULT_APP_TAG, 8);
        let agent = InPageAgent::new(config(), page.clone(), bus);

        let result = agent.delete("a").await;
        assert!(result.success);
        assert!(result.deleted_at.is_some());
        assert_eq!(result.user_url.as_deref(), Some("https://photos.example/photo/a"));
        assert_eq!(
            *page.clicks.lock().unwrap(),
            vec![
                "[data-delete-origin] button".to_string(),
                "[jsshadow] [autofocus]".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_confirm_reports_step() {
        let page = FakePage::new(&["[jsshadow] [autofocus]"]);
        let bus = Bus::new(DEFAULT_APP_TAG, 8);
        let agent = InPageAgent::new(config(), page.clone(), bus);

        let result = agent.delete("a").await;
        assert!(!result.success);
        assert!(result.error.unwrap().starts_with("confirm button"));
        assert_eq!(page.clicks.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dry_run_never_clicks() {
        let page = FakePage::new(&[]);
        let bus = Bus::new(DEFAULT_APP_TAG, 8);
        let cfg = AgentSection {
            dry_run: true,
            ..config()
        };
        let agent = InPageAgent::new(cfg, page.clone(), bus);

        let result = agent.delete("a").await;
        assert!(!result.success);
        assert!(result.deleted_at.is_none());
        assert_eq!(result.error.as_deref(), Some(DRY_RUN_ERROR));
        assert!(page.clicks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_respond_publishes_exactly_one_result() {
        let page = FakePage::new(&[]);
        let bus = Bus::new(DEFAULT_APP_TAG, 8);
        let mut rx = bus.subscribe();
        let agent = InPageAgent::new(config(), page, bus.clone());

        agent.respond("a").await;
        match rx.recv().await {
            Some(Message::DeletePhotoResult(r)) => assert_eq!(r.media_item_id, "a"),
            other => panic!("unexpected: {:?}", other),
        }
        drop(agent);
        drop(bus);
        assert_eq!(rx.recv().await, None);
    }
}
