//! 任务编排器：删除任务的主控循环
//!
//! 负责：打开浏览上下文、按提交顺序逐项执行「导航 → 等待加载 → 投递 deletePhoto → 等待结果」，
//! 每项结果立即转发给客户端，最后关闭上下文并恰好发出一条 startDeletionTask.result。
//!
//! 页面加载与删除结果都通过关联表等待；Service 把上下文事件和总线回复交给
//! [`TaskOrchestrator::page_loaded`] / [`TaskOrchestrator::deliver_result`]。

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::browser::{BrowsingContext, BrowsingHost, ContextId};
use crate::config::OrchestratorSection;
use crate::core::{DeletionTask, ItemError, TaskError, TaskSnapshot, TaskStatus, TaskSupervisor};
use crate::protocol::{
    Envelope, ItemResult, Message, PendingTable, TargetItem, TaskResult, WaitError,
};

/// 单个任务的执行策略（由配置转换而来）
#[derive(Debug, Clone, PartialEq)]
pub struct TaskPolicy {
    pub send_attempts: u32,
    pub send_backoff: Duration,
    pub result_timeout: Duration,
    /// None 表示只受任务级中止约束
    pub page_ready_timeout: Option<Duration>,
    pub interrupt_in_flight: bool,
    pub fail_task_on_item_failure: bool,
}

impl From<&OrchestratorSection> for TaskPolicy {
    fn from(cfg: &OrchestratorSection) -> Self {
        Self {
            send_attempts: cfg.send_attempts.max(1),
            send_backoff: Duration::from_millis(cfg.send_backoff_ms),
            result_timeout: Duration::from_millis(cfg.result_timeout_ms),
            page_ready_timeout: cfg.page_ready_timeout_ms.map(Duration::from_millis),
            interrupt_in_flight: cfg.interrupt_in_flight,
            fail_task_on_item_failure: cfg.fail_task_on_item_failure,
        }
    }
}

impl Default for TaskPolicy {
    fn default() -> Self {
        Self::from(&OrchestratorSection::default())
    }
}

/// 正在运行的任务
struct ActiveTask {
    task_id: Uuid,
    supervisor: Arc<TaskSupervisor>,
    /// 任务持有的上下文；被外部关闭或由编排器自己关闭前清空
    context_id: Option<ContextId>,
}

pub struct TaskOrchestrator {
    policy: TaskPolicy,
    app: String,
    host: Arc<dyn BrowsingHost>,
    /// 发往客户端的出站信封
    client: mpsc::UnboundedSender<Envelope>,
    /// 按 (上下文, 目标 URL) 等待加载，上一项迟到的加载事件不会误触发
    ready: PendingTable<(ContextId, String), ()>,
    replies: PendingTable<String, ItemResult>,
    active: Mutex<Option<ActiveTask>>,
    state_tx: watch::Sender<TaskSnapshot>,
}

impl TaskOrchestrator {
    pub fn new(
        policy: TaskPolicy,
        app: impl Into<String>,
        host: Arc<dyn BrowsingHost>,
        client: mpsc::UnboundedSender<Envelope>,
    ) -> Arc<Self> {
        // 可能没有订阅者，更新一律用 send_replace
        let (state_tx, _) = watch::channel(TaskSnapshot::default());
        Arc::new(Self {
            policy,
            app: app.into(),
            host,
            client,
            ready: PendingTable::new("page-ready"),
            replies: PendingTable::new("delete-photo"),
            active: Mutex::new(None),
            state_tx,
        })
    }

    fn active(&self) -> MutexGuard<'_, Option<ActiveTask>> {
        self.active.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// 开始新任务；已有任务在运行时拒绝
    pub fn start_task(self: &Arc<Self>, items: Vec<TargetItem>) -> Result<Uuid, TaskError> {
        let mut task = DeletionTask::new(items);
        let supervisor = Arc::new(TaskSupervisor::new(self.policy.interrupt_in_flight));
        {
            let mut active = self.active();
            if let Some(running) = active.as_ref() {
                tracing::warn!(
                    running_task = %running.task_id,
                    "startDeletionTask ignored, a task is already running"
                );
                return Err(TaskError::AlreadyRunning);
            }
            task.transition(TaskStatus::Running);
            *active = Some(ActiveTask {
                task_id: task.id,
                supervisor: Arc::clone(&supervisor),
                context_id: None,
            });
        }

        let task_id = task.id;
        tracing::info!(task_id = %task_id, items = task.items().len(), "deletion task started");
        self.state_tx.send_replace(task.snapshot());

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run(task, supervisor).await;
        });
        Ok(task_id)
    }

    /// 协作式取消；空闲时无操作
    pub fn cancel_task(&self) -> bool {
        match self.active().as_ref() {
            Some(running) => {
                tracing::info!(task_id = %running.task_id, "stop requested");
                running.supervisor.abort(TaskError::Cancelled);
                true
            }
            None => {
                tracing::debug!("stop requested with no running task");
                false
            }
        }
    }

    /// 上下文被销毁；若是当前任务的窗口则以 WindowClosed 中止
    pub fn on_context_removed(&self, context_id: ContextId) {
        let mut active = self.active();
        let Some(running) = active.as_mut() else {
            return;
        };
        if running.context_id != Some(context_id) {
            return;
        }
        running.context_id = None;
        tracing::warn!(task_id = %running.task_id, context_id, "task window was closed");
        running.supervisor.abort(TaskError::WindowClosed);
    }

    /// 页面加载完成；只唤醒等待同一 URL 的条目
    pub fn page_loaded(&self, context_id: ContextId, url: &str) -> bool {
        self.ready.settle(&(context_id, url.to_string()), ())
    }

    /// 页内代理的回复；重复或迟到的回复被丢弃
    pub fn deliver_result(&self, result: ItemResult) -> bool {
        let item_id = result.media_item_id.clone();
        let settled = self.replies.settle(&item_id, result);
        if !settled {
            tracing::debug!(item_id = %item_id, "deletePhoto.result without a waiter ignored");
        }
        settled
    }

    pub fn subscribe_state(&self) -> watch::Receiver<TaskSnapshot> {
        self.state_tx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.active().is_some()
    }

    /// 等待当前任务发出最终结果（空闲时立即返回）
    pub async fn wait_until_idle(&self) {
        let mut rx = self.state_tx.subscribe();
        let _ = rx.wait_for(|s| s.status != TaskStatus::Running).await;
    }

    fn send_client(&self, message: Message) {
        let action = message.action();
        if self.client.send(Envelope::new(self.app.clone(), message)).is_err() {
            tracing::warn!(%action, "client outbox closed, message dropped");
        }
    }

    async fn run(self: Arc<Self>, mut task: DeletionTask, supervisor: Arc<TaskSupervisor>) {
        let outcome = self.drive(&mut task, &supervisor).await;

        let total = task.items().len();
        let failed = task.failed_count();
        let (status, result) = match outcome {
            Ok(()) if self.policy.fail_task_on_item_failure && failed > 0 => (
                TaskStatus::Failed,
                TaskResult::failed(format!("{} of {} items failed to delete.", failed, total)),
            ),
            Ok(()) => (TaskStatus::Succeeded, TaskResult::ok()),
            Err(TaskError::Cancelled) => (
                TaskStatus::Cancelled,
                TaskResult::failed(TaskError::Cancelled.to_string()),
            ),
            Err(TaskError::Unexpected(detail)) => {
                tracing::error!(task_id = %task.id, detail = %detail, "deletion task failed unexpectedly");
                (
                    TaskStatus::Failed,
                    TaskResult::failed(TaskError::Unexpected(detail).to_string()),
                )
            }
            Err(e) => (TaskStatus::Failed, TaskResult::failed(e.to_string())),
        };

        task.transition(status);
        tracing::info!(
            task_id = %task.id,
            status = ?status,
            total,
            failed,
            "deletion task finished"
        );

        *self.active() = None;
        self.send_client(Message::StartDeletionTaskResult(result));
        self.state_tx.send_replace(task.snapshot());
    }

    async fn drive(
        &self,
        task: &mut DeletionTask,
        supervisor: &TaskSupervisor,
    ) -> Result<(), TaskError> {
        let context = self
            .host
            .open_context()
            .await
            .map_err(|e| TaskError::Unexpected(format!("could not open browsing context: {}", e)))?;
        self.attach(context.id());

        let outcome = self.process_items(task, supervisor, context.as_ref()).await;
        self.detach(context.as_ref()).await;
        outcome
    }

    fn attach(&self, context_id: ContextId) {
        if let Some(running) = self.active().as_mut() {
            running.context_id = Some(context_id);
        }
        tracing::debug!(context_id, "browsing context attached");
    }

    /// 关闭仍由任务持有的上下文
    async fn detach(&self, context: &dyn BrowsingContext) {
        let owned = match self.active().as_mut() {
            Some(running) if running.context_id == Some(context.id()) => {
                running.context_id = None;
                true
            }
            _ => false,
        };
        if !owned {
            return;
        }
        if let Err(e) = context.close().await {
            tracing::debug!(context_id = context.id(), error = %e, "closing browsing context failed");
        }
    }

    async fn process_items(
        &self,
        task: &mut DeletionTask,
        supervisor: &TaskSupervisor,
        context: &dyn BrowsingContext,
    ) -> Result<(), TaskError> {
        let items = task.items().to_vec();
        for (index, item) in items.iter().enumerate() {
            if supervisor.is_aborted() {
                let reason = supervisor.reason().unwrap_or(TaskError::Cancelled);
                tracing::info!(task_id = %task.id, remaining = items.len() - index, "task aborted: {}", reason);
                return Err(reason);
            }

            let result = match self.process_item(item, context, supervisor).await {
                Ok(result) => result,
                Err(e) => {
                    tracing::warn!(item_id = %item.id, kind = e.kind(), error = %e, "item failed");
                    ItemResult::failed(&item.id, e.to_string())
                }
            };
            self.forward(task, result);
        }

        match supervisor.reason() {
            Some(reason) => Err(reason),
            None => Ok(()),
        }
    }

    async fn process_item(
        &self,
        item: &TargetItem,
        context: &dyn BrowsingContext,
        supervisor: &TaskSupervisor,
    ) -> Result<ItemResult, ItemError> {
        let abort = supervisor.in_flight_token();

        let ready = self.ready.register((context.id(), item.product_url.clone()));
        context
            .navigate(&item.product_url)
            .await
            .map_err(|e| ItemError::Navigation(e.to_string()))?;
        ready
            .wait(self.policy.page_ready_timeout, abort)
            .await
            .map_err(|e| wait_failure(e, supervisor, ItemError::LoadStall))?;
        tracing::debug!(item_id = %item.id, url = %item.product_url, "page ready");

        // 先登记再投递，回复不会早于等待者
        let reply = self.replies.register(item.id.clone());
        self.deliver(context, &item.id, supervisor).await?;
        let result = reply
            .wait(Some(self.policy.result_timeout), abort)
            .await
            .map_err(|e| wait_failure(e, supervisor, ItemError::ResultTimeout))?;

        if !result.success {
            let reason = result.error.unwrap_or_else(|| "unknown error".to_string());
            return Err(ItemError::AgentReported(reason));
        }
        Ok(result)
    }

    /// 投递 deletePhoto；页内代理未就绪时按策略退避重试
    async fn deliver(
        &self,
        context: &dyn BrowsingContext,
        item_id: &str,
        supervisor: &TaskSupervisor,
    ) -> Result<(), ItemError> {
        let attempts = self.policy.send_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let message = Message::DeletePhoto {
                media_item_id: item_id.to_string(),
            };
            match context.send(message).await {
                Ok(()) => {
                    tracing::debug!(item_id, attempt, "deletePhoto delivered");
                    return Ok(());
                }
                Err(e) if e.is_transient() && attempt < attempts => {
                    tracing::warn!(item_id, attempt, error = %e, "deletePhoto delivery failed, retrying");
                    tokio::select! {
                        biased;
                        _ = supervisor.in_flight_token().cancelled() => {
                            return Err(ItemError::Interrupted(
                                supervisor.reason().unwrap_or(TaskError::Cancelled),
                            ));
                        }
                        _ = tokio::time::sleep(self.policy.send_backoff) => {}
                    }
                }
                Err(e) => {
                    return Err(ItemError::SendFailure {
                        attempts: attempt,
                        detail: e.to_string(),
                    });
                }
            }
        }
    }

    /// 记录并立即转发单项结果
    fn forward(&self, task: &mut DeletionTask, result: ItemResult) {
        let item_id = result.media_item_id.clone();
        if !task.record(result.clone()) {
            tracing::warn!(item_id = %item_id, "item already has a result, not forwarded");
            return;
        }
        tracing::info!(item_id = %item_id, success = result.success, "item finished");
        self.send_client(Message::DeletePhotoResult(result));
        self.state_tx.send_replace(task.snapshot());
    }
}

fn wait_failure(error: WaitError, supervisor: &TaskSupervisor, on_timeout: ItemError) -> ItemError {
    match error {
        WaitError::Aborted => {
            ItemError::Interrupted(supervisor.reason().unwrap_or(TaskError::Cancelled))
        }
        WaitError::TimedOut | WaitError::Abandoned => on_timeout,
    }
}
