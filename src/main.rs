//! deduper - 重复照片删除任务编排器
//!
//! 入口：初始化日志、加载配置、创建浏览器宿主与编排器，
//! 通过 stdin/stdout 与客户端交换 JSON Lines，直到输入结束或收到关闭信号。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use deduper::browser::create_host;
use deduper::config::{load_config, AppConfig};
use deduper::core::shutdown::run_with_graceful_shutdown;
use deduper::core::{
    ShutdownCoordinator, ShutdownManager, ShutdownReason, TaskCleanup, TaskOrchestrator,
    TaskPolicy,
};
use deduper::protocol::Bus;
use deduper::service::Service;
use deduper::{bridge, observability};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    // 可选参数：额外的配置文件
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });

    let bus = Bus::new(cfg.app.app_tag.clone(), cfg.bus.capacity);
    let host = create_host(&cfg, &bus).context("Failed to start browsing host")?;
    let events = host.subscribe();

    let (client_tx, client_rx) = mpsc::unbounded_channel();
    let orchestrator = TaskOrchestrator::new(
        TaskPolicy::from(&cfg.orchestrator),
        cfg.app.app_tag.clone(),
        host,
        client_tx.clone(),
    );
    let service = Service::new(&bus, Arc::clone(&orchestrator), events, client_tx);
    let routed = service.routed();

    let shutdown = Arc::new(ShutdownManager::new());
    let writer = tokio::spawn(bridge::forward_outbound(tokio::io::stdout(), client_rx));
    // 清理期间服务仍需路由页面事件与代理回复，单独停止
    let service_stop = CancellationToken::new();
    let service_task = tokio::spawn(service.run(service_stop.clone()));

    let mut coordinator =
        ShutdownCoordinator::new(Duration::from_secs(cfg.app.shutdown_timeout_secs));
    coordinator.register(TaskCleanup::new(Arc::clone(&orchestrator)));

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        app = %cfg.app.app_tag,
        "deduper ready"
    );

    let app = {
        let bus = bus.clone();
        let manager = Arc::clone(&shutdown);
        let orchestrator = Arc::clone(&orchestrator);
        async move {
            match bridge::forward_inbound(tokio::io::stdin(), &bus, routed, manager.token()).await {
                Ok(published) => tracing::debug!(published, "client input drained"),
                Err(e) => {
                    tracing::error!("Client input failed: {}", e);
                    manager.shutdown(ShutdownReason::FatalError(e.to_string()));
                    return;
                }
            }
            // 输入中的请求都已路由，让正在运行的任务自然完成
            orchestrator.wait_until_idle().await;
        }
    };
    run_with_graceful_shutdown(Arc::clone(&shutdown), app, move || async move {
        coordinator.run_cleanup().await;
    })
    .await;

    service_stop.cancel();
    service_task.await.context("Service task panicked")?;
    drop(orchestrator);

    match writer.await.context("Writer task panicked")? {
        Ok(_) => tracing::info!("deduper stopped"),
        Err(e) => tracing::warn!("Client output failed: {}", e),
    }

    // stdin 的阻塞读线程不会自行结束，直接退出进程
    std::process::exit(0);
}
