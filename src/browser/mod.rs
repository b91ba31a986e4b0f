//! 浏览上下文：由编排器独占驱动的可导航窗口
//!
//! - [`BrowsingHost`]：打开上下文，并广播上下文事件（加载完成 / 被外部关闭）
//! - [`BrowsingContext`]：导航、向页内代理点对点投递消息、关闭
//! - `simulated`：进程内模拟宿主（测试与无浏览器的演练）
//! - `chrome`：Headless Chrome 后端（需 feature "browser"）

#[cfg(feature = "browser")]
pub mod chrome;
pub mod simulated;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::config::AppConfig;
use crate::protocol::{Bus, Message};

pub use simulated::{AgentOutcome, HostCall, PageScript, SimulatedHost};

/// 上下文 ID（宿主内唯一）
pub type ContextId = u64;

/// 宿主发出的上下文事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextEvent {
    /// 页面加载完成
    Loaded { context_id: ContextId, url: String },
    /// 上下文被销毁（包括用户手动关闭窗口）
    Removed { context_id: ContextId },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrowserError {
    /// 页内代理尚未挂载，可重试
    #[error("Could not establish connection. Receiving end does not exist.")]
    NoReceiver,

    #[error("browsing context {0} is closed")]
    ContextClosed(ContextId),

    #[error("browser backend error: {0}")]
    Backend(String),
}

impl BrowserError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BrowserError::NoReceiver)
    }
}

/// 浏览器宿主
#[async_trait]
pub trait BrowsingHost: Send + Sync {
    /// 打开一个新的浏览上下文（窗口）
    async fn open_context(&self) -> Result<Arc<dyn BrowsingContext>, BrowserError>;

    /// 订阅上下文事件
    fn subscribe(&self) -> broadcast::Receiver<ContextEvent>;
}

/// 单个浏览上下文
#[async_trait]
pub trait BrowsingContext: Send + Sync {
    fn id(&self) -> ContextId;

    /// 开始导航；加载完成通过 [`ContextEvent::Loaded`] 通知
    async fn navigate(&self, url: &str) -> Result<(), BrowserError>;

    /// 点对点投递给该上下文中的页内代理
    async fn send(&self, message: Message) -> Result<(), BrowserError>;

    async fn close(&self) -> Result<(), BrowserError>;
}

/// 根据编译特性选择宿主：启用 browser 时用 Chrome，否则用模拟宿主演练
pub fn create_host(cfg: &AppConfig, bus: &Bus) -> Result<Arc<dyn BrowsingHost>, BrowserError> {
    #[cfg(feature = "browser")]
    {
        tracing::info!(headless = cfg.browser.headless, "Using Chrome browsing host");
        let host = chrome::ChromeHost::launch(&cfg.browser, cfg.agent.clone(), bus.clone())?;
        Ok(Arc::new(host))
    }

    #[cfg(not(feature = "browser"))]
    {
        tracing::warn!("Built without the \"browser\" feature, using simulated host (dry run)");
        Ok(Arc::new(SimulatedHost::dry_run(bus.clone(), cfg.agent.clone())))
    }
}
