//! 优雅关闭
//!
//! 收到 Ctrl+C / SIGTERM 或客户端输入结束后：
//! - 取消正在运行的删除任务，让它关闭窗口并发出最终结果
//! - 在超时内等待清理完成，再退出

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::core::TaskOrchestrator;

/// 关闭信号管理器
#[derive(Clone)]
pub struct ShutdownManager {
    shutdown_token: CancellationToken,
    reason_tx: broadcast::Sender<ShutdownReason>,
}

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
    FatalError(String),
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (reason_tx, _) = broadcast::channel(1);
        Self {
            shutdown_token: CancellationToken::new(),
            reason_tx,
        }
    }

    /// 关闭 token（交给各后台任务）
    pub fn token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        if self.shutdown_token.is_cancelled() {
            return;
        }
        let _ = self.reason_tx.send(reason);
        self.shutdown_token.cancel();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.reason_tx.subscribe()
    }

    pub async fn wait_for_shutdown(&self) {
        self.shutdown_token.cancelled().await;
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, initiating graceful shutdown...");
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 关闭时需要执行的清理任务
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    /// 日志用名称
    fn name(&self) -> &'static str;
}

/// 关闭协调器：按注册顺序执行清理，每一步受同一个超时约束（`app.shutdown_timeout_secs`）
pub struct ShutdownCoordinator {
    steps: Vec<Box<dyn ShutdownCleanup>>,
    step_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(step_timeout: Duration) -> Self {
        Self {
            steps: Vec::new(),
            step_timeout,
        }
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, step: T) {
        self.steps.push(Box::new(step));
    }

    pub async fn run_cleanup(&self) {
        tracing::info!(steps = self.steps.len(), "running shutdown cleanup");
        for step in &self.steps {
            let name = step.name();
            match tokio::time::timeout(self.step_timeout, step.cleanup()).await {
                Ok(Ok(())) => tracing::info!(step = name, "cleanup step done"),
                Ok(Err(e)) => tracing::warn!(step = name, "cleanup step failed: {:#}", e),
                Err(_) => tracing::warn!(
                    step = name,
                    timeout_secs = self.step_timeout.as_secs(),
                    "cleanup step timed out"
                ),
            }
        }
    }
}

/// 取消正在运行的删除任务，并等待它发出最终结果
pub struct TaskCleanup {
    orchestrator: Arc<TaskOrchestrator>,
}

impl TaskCleanup {
    pub fn new(orchestrator: Arc<TaskOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for TaskCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        if self.orchestrator.cancel_task() {
            tracing::info!("Cancelled running deletion task");
        }
        self.orchestrator.wait_until_idle().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "DeletionTask"
    }
}

/// 运行主应用直到它结束或收到关闭信号，然后执行清理
pub async fn run_with_graceful_shutdown<F, Fut>(
    shutdown_manager: Arc<ShutdownManager>,
    app: F,
    cleanup: impl FnOnce() -> Fut,
) where
    F: Future<Output = ()>,
    Fut: Future<Output = ()>,
{
    let mut reasons = shutdown_manager.subscribe();
    shutdown_manager.install_signal_handlers();

    tokio::select! {
        _ = app => {
            tracing::info!("Application finished normally");
        }
        _ = shutdown_manager.wait_for_shutdown() => {
            match reasons.try_recv() {
                Ok(reason) => tracing::info!(?reason, "Shutdown signal received"),
                Err(_) => tracing::info!("Shutdown signal received"),
            }
        }
    }

    cleanup().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use tokio::sync::mpsc;

    use crate::browser::{PageScript, SimulatedHost};
    use crate::config::AgentSection;
    use crate::core::TaskPolicy;
    use crate::protocol::{Bus, TargetItem, DEFAULT_APP_TAG};

    #[test]
    fn test_shutdown_manager_token() {
        let manager = ShutdownManager::new();
        let token = manager.token();
        assert!(!token.is_cancelled());
        manager.shutdown(ShutdownReason::UserInitiated);
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_first_reason_is_broadcast_once() {
        let manager = ShutdownManager::new();
        let mut reasons = manager.subscribe();
        manager.shutdown(ShutdownReason::Signal);
        manager.shutdown(ShutdownReason::UserInitiated);
        assert_eq!(reasons.try_recv().ok(), Some(ShutdownReason::Signal));
        assert!(reasons.try_recv().is_err());
    }

    struct MockCleanup {
        called: Arc<AtomicBool>,
    }

    #[async_trait::async_trait]
    impl ShutdownCleanup for MockCleanup {
        async fn cleanup(&self) -> anyhow::Result<()> {
            self.called.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "MockCleanup"
        }
    }

    #[tokio::test]
    async fn test_shutdown_coordinator() {
        let mut coordinator = ShutdownCoordinator::new(Duration::from_secs(1));

        let called = Arc::new(AtomicBool::new(false));
        coordinator.register(MockCleanup {
            called: called.clone(),
        });

        coordinator.run_cleanup().await;
        assert!(called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_task_cleanup_cancels_running_task() {
        let bus = Bus::new(DEFAULT_APP_TAG, 16);
        let host = SimulatedHost::new(bus, AgentSection::default());
        // 页面永远不加载，任务只能被取消
        host.default_script(PageScript::stalled());
        let (client, mut outbox) = mpsc::unbounded_channel();
        let orchestrator =
            TaskOrchestrator::new(TaskPolicy::default(), DEFAULT_APP_TAG, Arc::new(host), client);

        orchestrator
            .start_task(vec![TargetItem::new("a", "u1")])
            .unwrap();
        let mut coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        coordinator.register(TaskCleanup::new(orchestrator.clone()));
        coordinator.run_cleanup().await;

        assert!(!orchestrator.is_running());
        let mut last = None;
        while let Ok(envelope) = outbox.try_recv() {
            last = Some(envelope);
        }
        let last = last.unwrap();
        assert_eq!(last.action(), crate::protocol::Action::StartDeletionTaskResult);
    }
}
