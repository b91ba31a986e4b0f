//! 后台服务：唯一的消息路由
//!
//! 同时消费两路输入：
//! - 总线：客户端请求（healthCheck / startDeletionTask / stopDeletionTask）与页内代理回复
//! - 浏览器宿主的上下文事件：加载完成、窗口被关闭

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::browser::ContextEvent;
use crate::core::TaskOrchestrator;
use crate::protocol::{Bus, BusReceiver, Envelope, Message};

pub struct Service {
    app: String,
    bus: BusReceiver,
    events: broadcast::Receiver<ContextEvent>,
    orchestrator: Arc<TaskOrchestrator>,
    client: mpsc::UnboundedSender<Envelope>,
    /// 已处理的客户端请求数；输入桥据此等待路由完成
    routed: watch::Sender<u64>,
}

impl Service {
    /// 构造时即订阅，之后发布的消息不会丢
    pub fn new(
        bus: &Bus,
        orchestrator: Arc<TaskOrchestrator>,
        events: broadcast::Receiver<ContextEvent>,
        client: mpsc::UnboundedSender<Envelope>,
    ) -> Self {
        Self {
            app: bus.app().to_string(),
            bus: bus.subscribe(),
            events,
            orchestrator,
            client,
            routed: watch::channel(0).0,
        }
    }

    /// 订阅已路由的客户端请求计数（须在 `run` 之前取得）
    pub fn routed(&self) -> watch::Receiver<u64> {
        self.routed.subscribe()
    }

    /// 路由循环，直到关闭或总线关闭
    pub async fn run(mut self, shutdown: CancellationToken) {
        tracing::info!(app = %self.app, "service started");
        let mut events_open = true;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                message = self.bus.recv() => match message {
                    Some(message) => self.handle_message(message),
                    None => break,
                },
                event = self.events.recv(), if events_open => match event {
                    Ok(event) => self.handle_event(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "context events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::debug!("context event stream closed");
                        events_open = false;
                    }
                },
            }
        }
        tracing::info!("service stopped");
    }

    fn handle_message(&self, message: Message) {
        let action = message.action();
        tracing::debug!(%action, "routing message");
        self.route(message);
        if action.is_client_request() {
            self.routed.send_modify(|n| *n += 1);
        }
    }

    fn route(&self, message: Message) {
        match message {
            Message::HealthCheck => {
                let reply = Message::HealthCheckResult {
                    success: true,
                    version: env!("CARGO_PKG_VERSION").to_string(),
                };
                if self.client.send(Envelope::new(self.app.clone(), reply)).is_err() {
                    tracing::warn!("client outbox closed, healthCheck.result dropped");
                }
            }
            Message::StartDeletionTask { media_items } => {
                if let Err(e) = self.orchestrator.start_task(media_items) {
                    tracing::warn!(error = %e, "startDeletionTask rejected");
                }
            }
            Message::StopDeletionTask => {
                self.orchestrator.cancel_task();
            }
            Message::DeletePhotoResult(result) => {
                self.orchestrator.deliver_result(result);
            }
            Message::HealthCheckResult { .. }
            | Message::StartDeletionTaskResult(_)
            | Message::DeletePhoto { .. } => {}
        }
    }

    fn handle_event(&self, event: ContextEvent) {
        match event {
            ContextEvent::Loaded { context_id, url } => {
                tracing::debug!(context_id, url = %url, "page loaded");
                self.orchestrator.page_loaded(context_id, &url);
            }
            ContextEvent::Removed { context_id } => {
                self.orchestrator.on_context_removed(context_id);
            }
        }
    }
}
