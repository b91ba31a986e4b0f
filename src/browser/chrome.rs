//! Chrome 后端：使用 Headless Chrome 驱动真实浏览器窗口
//!
//! 需启用 feature "browser" 且系统已安装 Chrome/Chromium。
//! headless_chrome 的 API 是阻塞的，所有 Tab 操作都放进 `spawn_blocking`。
//! 窗口是否被用户关闭通过轮询浏览器的 Tab 列表检测。

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use headless_chrome::{Browser, LaunchOptions, Tab};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::{BrowserError, BrowsingContext, BrowsingHost, ContextEvent, ContextId};
use crate::agent::{InPageAgent, PageDriver};
use crate::config::{AgentSection, BrowserSection};
use crate::protocol::{Bus, Message};

pub struct ChromeHost {
    browser: Arc<Browser>,
    bus: Bus,
    agent: AgentSection,
    events: broadcast::Sender<ContextEvent>,
    next_id: AtomicU64,
    close_poll: Duration,
}

impl ChromeHost {
    /// 启动 Chrome
    pub fn launch(cfg: &BrowserSection, agent: AgentSection, bus: Bus) -> Result<Self, BrowserError> {
        let options = LaunchOptions::default_builder()
            .headless(cfg.headless)
            .window_size(Some((cfg.window_width, cfg.window_height)))
            .build()
            .map_err(|e| BrowserError::Backend(format!("Invalid launch options: {}", e)))?;
        let browser = Browser::new(options).map_err(|e| {
            BrowserError::Backend(format!("Chrome launch failed: {}. Install Chrome/Chromium.", e))
        })?;
        let (events, _) = broadcast::channel(64);

        Ok(Self {
            browser: Arc::new(browser),
            bus,
            agent,
            events,
            next_id: AtomicU64::new(1),
            close_poll: Duration::from_millis(cfg.close_poll_ms.max(50)),
        })
    }

    /// 轮询 Tab 列表，Tab 消失且不是我们自己关闭的，视为用户关闭了窗口
    fn watch_for_close(&self, context: &ChromeContext) {
        let browser = Arc::clone(&self.browser);
        let target_id = context.tab.get_target_id().clone();
        let closing = context.closing.clone();
        let closed = Arc::clone(&context.closed);
        let events = self.events.clone();
        let context_id = context.id;
        let poll = self.close_poll;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll);
            loop {
                tokio::select! {
                    _ = closing.cancelled() => break,
                    _ = ticker.tick() => {
                        let alive = match browser.get_tabs().lock() {
                            Ok(tabs) => tabs.iter().any(|t| t.get_target_id() == &target_id),
                            Err(_) => true,
                        };
                        if !alive {
                            closed.store(true, Ordering::SeqCst);
                            tracing::info!(context_id, "Chrome window closed externally");
                            let _ = events.send(ContextEvent::Removed { context_id });
                            break;
                        }
                    }
                }
            }
        });
    }
}

#[async_trait]
impl BrowsingHost for ChromeHost {
    async fn open_context(&self) -> Result<Arc<dyn BrowsingContext>, BrowserError> {
        let browser = Arc::clone(&self.browser);
        let tab = tokio::task::spawn_blocking(move || browser.new_tab())
            .await
            .map_err(|e| BrowserError::Backend(format!("Task join: {}", e)))?
            .map_err(|e| BrowserError::Backend(format!("Browser tab failed: {}", e)))?;

        let context = ChromeContext {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            tab,
            bus: self.bus.clone(),
            agent: self.agent.clone(),
            events: self.events.clone(),
            attached: Arc::new(AtomicBool::new(false)),
            navigation: Arc::new(AtomicU64::new(0)),
            closed: Arc::new(AtomicBool::new(false)),
            closing: CancellationToken::new(),
        };
        self.watch_for_close(&context);
        tracing::info!(context_id = context.id, "Chrome context opened");
        Ok(Arc::new(context))
    }

    fn subscribe(&self) -> broadcast::Receiver<ContextEvent> {
        self.events.subscribe()
    }
}

pub struct ChromeContext {
    id: ContextId,
    tab: Arc<Tab>,
    bus: Bus,
    agent: AgentSection,
    events: broadcast::Sender<ContextEvent>,
    /// 当前页面已加载完成，页内代理可接收消息
    attached: Arc<AtomicBool>,
    /// 每次导航递增；旧导航的加载结果不再生效
    navigation: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
    closing: CancellationToken,
}

impl ChromeContext {
    fn ensure_open(&self) -> Result<(), BrowserError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrowserError::ContextClosed(self.id));
        }
        Ok(())
    }
}

#[async_trait]
impl BrowsingContext for ChromeContext {
    fn id(&self) -> ContextId {
        self.id
    }

    async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
        self.ensure_open()?;
        let generation = self.navigation.fetch_add(1, Ordering::SeqCst) + 1;
        self.attached.store(false, Ordering::SeqCst);

        let tab = Arc::clone(&self.tab);
        let target = url.to_string();
        tokio::task::spawn_blocking(move || tab.navigate_to(&target).map(|_| ()))
            .await
            .map_err(|e| BrowserError::Backend(format!("Task join: {}", e)))?
            .map_err(|e| BrowserError::Backend(format!("Navigate failed: {}", e)))?;

        let tab = Arc::clone(&self.tab);
        let attached = Arc::clone(&self.attached);
        let navigation = Arc::clone(&self.navigation);
        let events = self.events.clone();
        let context_id = self.id;
        let url = url.to_string();
        tokio::spawn(async move {
            let loaded = tokio::task::spawn_blocking(move || tab.wait_until_navigated().map(|_| ()))
                .await;
            match loaded {
                Ok(Ok(())) if navigation.load(Ordering::SeqCst) != generation => {
                    tracing::debug!(context_id, url = %url, "superseded page load ignored");
                }
                Ok(Ok(())) => {
                    attached.store(true, Ordering::SeqCst);
                    let _ = events.send(ContextEvent::Loaded { context_id, url });
                }
                Ok(Err(e)) => tracing::warn!(context_id, url = %url, error = %e, "page load failed"),
                Err(e) => tracing::warn!(context_id, error = %e, "page load task panicked"),
            }
        });
        Ok(())
    }

    async fn send(&self, message: Message) -> Result<(), BrowserError> {
        self.ensure_open()?;
        let Message::DeletePhoto { media_item_id } = message else {
            return Ok(());
        };
        if !self.attached.load(Ordering::SeqCst) {
            return Err(BrowserError::NoReceiver);
        }

        let agent = InPageAgent::new(
            self.agent.clone(),
            Arc::new(TabDriver {
                tab: Arc::clone(&self.tab),
            }),
            self.bus.clone(),
        );
        tokio::spawn(async move {
            agent.respond(&media_item_id).await;
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), BrowserError> {
        self.closing.cancel();
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(BrowserError::ContextClosed(self.id));
        }
        let tab = Arc::clone(&self.tab);
        tokio::task::spawn_blocking(move || tab.close(true))
            .await
            .map_err(|e| BrowserError::Backend(format!("Task join: {}", e)))?
            .map_err(|e| BrowserError::Backend(format!("Close failed: {}", e)))?;
        tracing::info!(context_id = self.id, "Chrome context closed");
        Ok(())
    }
}

/// 基于 Chrome Tab 的页面操作
struct TabDriver {
    tab: Arc<Tab>,
}

#[async_trait]
impl PageDriver for TabDriver {
    async fn wait_for(&self, selector: &str, timeout: Duration) -> Result<bool, String> {
        let tab = Arc::clone(&self.tab);
        let selector = selector.to_string();
        tokio::task::spawn_blocking(move || {
            let found = tab
                .wait_for_element_with_custom_timeout(&selector, timeout)
                .is_ok();
            found
        })
        .await
        .map_err(|e| format!("Task join: {}", e))
    }

    async fn click(&self, selector: &str) -> Result<(), String> {
        let tab = Arc::clone(&self.tab);
        let selector = selector.to_string();
        tokio::task::spawn_blocking(move || {
            let element = tab
                .find_element(&selector)
                .map_err(|e| format!("Element not found: {}", e))?;
            element.click().map_err(|e| format!("Click failed: {}", e))?;
            Ok::<_, String>(())
        })
        .await
        .map_err(|e| format!("Task join: {}", e))?
    }

    async fn current_url(&self) -> Result<String, String> {
        Ok(self.tab.get_url())
    }
}
