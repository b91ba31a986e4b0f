//! 模拟浏览器宿主
//!
//! 每个 URL 可配置一份 [`PageScript`]：是否加载完成、页内代理第几次投递才挂载、代理的行为。
//! 页面内跑的是真实的 [`InPageAgent`]，只是 DOM 换成了脚本化的假页面。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{BrowserError, BrowsingContext, BrowsingHost, ContextEvent, ContextId};
use crate::agent::{InPageAgent, PageDriver};
use crate::config::AgentSection;
use crate::protocol::{Bus, ItemResult, Message};

/// 页内代理的表现
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentOutcome {
    /// 所有控件都在，正常删除
    Delete,
    /// 该选择器永远不出现，代理在对应步骤超时
    MissingControl(String),
    /// 直接回复失败
    Refuse(String),
    /// 不回复
    Silent,
    /// 正常删除，但结果发两次
    Duplicate,
}

/// 单个页面的脚本
#[derive(Debug, Clone)]
pub struct PageScript {
    /// false 时页面永远不发加载完成事件
    pub loads: bool,
    /// 前 N 次投递返回 NoReceiver
    pub attach_after: u32,
    pub outcome: AgentOutcome,
    /// 覆盖宿主的统一加载延迟
    pub load_after: Option<Duration>,
}

impl Default for PageScript {
    fn default() -> Self {
        Self {
            loads: true,
            attach_after: 0,
            outcome: AgentOutcome::Delete,
            load_after: None,
        }
    }
}

impl PageScript {
    pub fn with_outcome(outcome: AgentOutcome) -> Self {
        Self {
            outcome,
            ..Self::default()
        }
    }

    pub fn stalled() -> Self {
        Self {
            loads: false,
            ..Self::default()
        }
    }

    pub fn attach_after(mut self, failures: u32) -> Self {
        self.attach_after = failures;
        self
    }

    pub fn load_after(mut self, delay: Duration) -> Self {
        self.load_after = Some(delay);
        self
    }
}

/// 宿主侧记录的调用（测试断言用）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCall {
    Open(ContextId),
    Navigate(ContextId, String),
    Send(ContextId, String),
    Close(ContextId),
}

type ReplyHook = Arc<dyn Fn(&ItemResult) + Send + Sync>;

struct Shared {
    bus: Bus,
    agent: AgentSection,
    events: broadcast::Sender<ContextEvent>,
    scripts: Mutex<HashMap<String, PageScript>>,
    default_script: Mutex<PageScript>,
    calls: Mutex<Vec<HostCall>>,
    load_delay: Mutex<Duration>,
    before_reply: Mutex<Option<ReplyHook>>,
}

impl Shared {
    fn record(&self, call: HostCall) {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).push(call);
    }

    fn script_for(&self, url: &str) -> PageScript {
        let scripts = self.scripts.lock().unwrap_or_else(|p| p.into_inner());
        scripts.get(url).cloned().unwrap_or_else(|| {
            self.default_script
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .clone()
        })
    }

    fn publish_reply(&self, result: ItemResult) {
        let hook = self
            .before_reply
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        if let Some(hook) = hook {
            hook(&result);
        }
        self.bus.publish(Message::DeletePhotoResult(result));
    }
}

/// 进程内模拟宿主
#[derive(Clone)]
pub struct SimulatedHost {
    shared: Arc<Shared>,
    next_id: Arc<AtomicU64>,
    contexts: Arc<Mutex<HashMap<ContextId, Arc<SimulatedContext>>>>,
}

impl SimulatedHost {
    pub fn new(bus: Bus, agent: AgentSection) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(Shared {
                bus,
                agent,
                events,
                scripts: Mutex::new(HashMap::new()),
                default_script: Mutex::new(PageScript::default()),
                calls: Mutex::new(Vec::new()),
                load_delay: Mutex::new(Duration::from_millis(5)),
                before_reply: Mutex::new(None),
            }),
            next_id: Arc::new(AtomicU64::new(1)),
            contexts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// 演练宿主：页内代理强制 dry run，每项都回复「未删除」
    pub fn dry_run(bus: Bus, agent: AgentSection) -> Self {
        Self::new(
            bus,
            AgentSection {
                dry_run: true,
                ..agent
            },
        )
    }

    pub fn script(&self, url: impl Into<String>, script: PageScript) -> &Self {
        self.shared
            .scripts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(url.into(), script);
        self
    }

    pub fn default_script(&self, script: PageScript) -> &Self {
        *self
            .shared
            .default_script
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = script;
        self
    }

    pub fn load_delay(&self, delay: Duration) -> &Self {
        *self.shared.load_delay.lock().unwrap_or_else(|p| p.into_inner()) = delay;
        self
    }

    /// 在每条代理回复发布前调用
    pub fn before_reply(&self, hook: impl Fn(&ItemResult) + Send + Sync + 'static) -> &Self {
        *self
            .shared
            .before_reply
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Some(Arc::new(hook));
        self
    }

    /// 模拟用户手动关闭窗口
    pub fn destroy(&self, context_id: ContextId) {
        let context = self
            .contexts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&context_id)
            .cloned();
        if let Some(context) = context {
            if !context.closed.swap(true, Ordering::SeqCst) {
                tracing::info!(context_id, "simulated window closed by user");
                let _ = self.shared.events.send(ContextEvent::Removed { context_id });
            }
        }
    }

    pub fn calls(&self) -> Vec<HostCall> {
        self.shared
            .calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn navigations(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                HostCall::Navigate(_, url) => Some(url),
                _ => None,
            })
            .collect()
    }

    /// 仍处于打开状态的上下文数量
    pub fn open_count(&self) -> usize {
        self.contexts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .filter(|c| !c.closed.load(Ordering::SeqCst))
            .count()
    }

    pub fn last_context(&self) -> Option<ContextId> {
        self.calls().into_iter().rev().find_map(|c| match c {
            HostCall::Open(id) => Some(id),
            _ => None,
        })
    }
}

#[async_trait]
impl BrowsingHost for SimulatedHost {
    async fn open_context(&self) -> Result<Arc<dyn BrowsingContext>, BrowserError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let context = Arc::new(SimulatedContext {
            id,
            shared: Arc::clone(&self.shared),
            closed: AtomicBool::new(false),
            page: Mutex::new(None),
            deliveries: AtomicU32::new(0),
        });
        self.contexts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id, Arc::clone(&context));
        self.shared.record(HostCall::Open(id));
        tracing::debug!(context_id = id, "simulated context opened");
        Ok(context)
    }

    fn subscribe(&self) -> broadcast::Receiver<ContextEvent> {
        self.shared.events.subscribe()
    }
}

/// 模拟窗口
pub struct SimulatedContext {
    id: ContextId,
    shared: Arc<Shared>,
    closed: AtomicBool,
    /// 当前页面的 URL 与脚本
    page: Mutex<Option<(String, PageScript)>>,
    /// 当前页面收到的投递次数
    deliveries: AtomicU32,
}

impl SimulatedContext {
    fn ensure_open(&self) -> Result<(), BrowserError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrowserError::ContextClosed(self.id));
        }
        Ok(())
    }
}

#[async_trait]
impl BrowsingContext for SimulatedContext {
    fn id(&self) -> ContextId {
        self.id
    }

    async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
        self.ensure_open()?;
        self.shared.record(HostCall::Navigate(self.id, url.to_string()));

        let script = self.shared.script_for(url);
        let loads = script.loads;
        let load_after = script.load_after;
        *self.page.lock().unwrap_or_else(|p| p.into_inner()) = Some((url.to_string(), script));
        self.deliveries.store(0, Ordering::SeqCst);

        if loads {
            let delay = load_after
                .unwrap_or_else(|| *self.shared.load_delay.lock().unwrap_or_else(|p| p.into_inner()));
            let events = self.shared.events.clone();
            let context_id = self.id;
            let url = url.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = events.send(ContextEvent::Loaded { context_id, url });
            });
        }
        Ok(())
    }

    async fn send(&self, message: Message) -> Result<(), BrowserError> {
        self.ensure_open()?;
        let Message::DeletePhoto { media_item_id } = message else {
            return Ok(());
        };
        self.shared
            .record(HostCall::Send(self.id, media_item_id.clone()));

        let Some((url, script)) = self.page.lock().unwrap_or_else(|p| p.into_inner()).clone()
        else {
            return Err(BrowserError::NoReceiver);
        };
        let attempt = self.deliveries.fetch_add(1, Ordering::SeqCst);
        if attempt < script.attach_after {
            return Err(BrowserError::NoReceiver);
        }

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let missing = match &script.outcome {
                AgentOutcome::MissingControl(selector) => Some(selector.clone()),
                _ => None,
            };
            let agent = InPageAgent::new(
                shared.agent.clone(),
                Arc::new(ScriptedPage { url, missing }),
                shared.bus.clone(),
            );

            match script.outcome {
                AgentOutcome::Silent => {
                    tracing::debug!(item_id = %media_item_id, "simulated agent stays silent");
                }
                AgentOutcome::Refuse(reason) => {
                    shared.publish_reply(ItemResult::failed(media_item_id, reason));
                }
                AgentOutcome::Duplicate => {
                    let result = agent.delete(&media_item_id).await;
                    shared.publish_reply(result.clone());
                    shared.publish_reply(result);
                }
                AgentOutcome::Delete | AgentOutcome::MissingControl(_) => {
                    let result = agent.delete(&media_item_id).await;
                    shared.publish_reply(result);
                }
            }
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), BrowserError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(BrowserError::ContextClosed(self.id));
        }
        self.shared.record(HostCall::Close(self.id));
        // 真实浏览器里自己关闭窗口同样会触发移除事件
        let _ = self
            .shared
            .events
            .send(ContextEvent::Removed { context_id: self.id });
        Ok(())
    }
}

/// 脚本化的假页面
struct ScriptedPage {
    url: String,
    missing: Option<String>,
}

#[async_trait]
impl PageDriver for ScriptedPage {
    async fn wait_for(&self, selector: &str, timeout: Duration) -> Result<bool, String> {
        if self.missing.as_deref() == Some(selector) {
            tokio::time::sleep(timeout).await;
            return Ok(false);
        }
        Ok(true)
    }

    async fn click(&self, _selector: &str) -> Result<(), String> {
        Ok(())
    }

    async fn current_url(&self) -> Result<String, String> {
        Ok(self.url.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DEFAULT_APP_TAG;

    fn host() -> (SimulatedHost, Bus) {
        let bus = Bus::new(DEFAULT_APP_TAG, 16);
        (SimulatedHost::new(bus.clone(), AgentSection::default()), bus)
    }

    #[tokio::test]
    async fn test_navigate_emits_loaded() {
        let (host, _bus) = host();
        let mut events = host.subscribe();
        let ctx = host.open_context().await.unwrap();

        ctx.navigate("u1").await.unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            ContextEvent::Loaded {
                context_id: ctx.id(),
                url: "u1".to_string()
            }
        );
        assert_eq!(host.navigations(), vec!["u1".to_string()]);
    }

    #[tokio::test]
    async fn test_agent_attaches_after_failures() {
        let (host, bus) = host();
        host.script("u1", PageScript::default().attach_after(2));
        let mut rx = bus.subscribe();
        let ctx = host.open_context().await.unwrap();
        ctx.navigate("u1").await.unwrap();

        let cmd = || Message::DeletePhoto {
            media_item_id: "a".to_string(),
        };
        assert_eq!(ctx.send(cmd()).await, Err(BrowserError::NoReceiver));
        assert_eq!(ctx.send(cmd()).await, Err(BrowserError::NoReceiver));
        assert_eq!(ctx.send(cmd()).await, Ok(()));

        match rx.recv().await {
            Some(Message::DeletePhotoResult(r)) => {
                assert!(r.success);
                assert_eq!(r.user_url.as_deref(), Some("u1"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_destroy_emits_removed_once() {
        let (host, _bus) = host();
        let mut events = host.subscribe();
        let ctx = host.open_context().await.unwrap();

        host.destroy(ctx.id());
        host.destroy(ctx.id());
        assert_eq!(
            events.recv().await.unwrap(),
            ContextEvent::Removed {
                context_id: ctx.id()
            }
        );
        assert!(events.try_recv().is_err());
        assert_eq!(host.open_count(), 0);
        assert_eq!(
            ctx.navigate("u1").await,
            Err(BrowserError::ContextClosed(ctx.id()))
        );
    }
}
