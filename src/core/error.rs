//! 删除任务错误类型
//!
//! 单项错误（ItemError）只影响当前媒体项，任务继续；任务级错误（TaskError）终止整个任务。

use thiserror::Error;

/// 任务级错误：中止剩余所有项
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// 浏览上下文被外部关闭
    #[error("Window was closed.")]
    WindowClosed,

    /// 客户端发出 stopDeletionTask
    #[error("Cancelled.")]
    Cancelled,

    /// 编排逻辑本身的意外失败，细节只写日志
    #[error("Whoops! An unexpected error occurred. Check the deduper logs for more details.")]
    Unexpected(String),

    /// 已有任务在运行
    #[error("A deletion task is already running.")]
    AlreadyRunning,
}

/// 单项错误：记录为 success=false 的 ItemResult 后继续下一项
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ItemError {
    /// 页面一直没有加载完成
    #[error("page never finished loading")]
    LoadStall,

    #[error("navigation failed: {0}")]
    Navigation(String),

    /// 重试用尽仍无法把 deletePhoto 投递给页内代理
    #[error("could not reach the page after {attempts} attempts: {detail}")]
    SendFailure { attempts: u32, detail: String },

    /// 页内代理自己报告的失败原因
    #[error("{0}")]
    AgentReported(String),

    #[error("timeout")]
    ResultTimeout,

    /// 等待途中任务被中止
    #[error("{0}")]
    Interrupted(TaskError),
}

impl ItemError {
    /// 日志用的分类标签
    pub fn kind(&self) -> &'static str {
        match self {
            ItemError::LoadStall => "load-stall",
            ItemError::Navigation(_) => "navigation",
            ItemError::SendFailure { .. } => "send-failure-after-retries",
            ItemError::AgentReported(_) => "agent-reported-failure",
            ItemError::ResultTimeout => "result-timeout",
            ItemError::Interrupted(_) => "interrupted",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_error_messages() {
        assert_eq!(TaskError::Cancelled.to_string(), "Cancelled.");
        assert_eq!(TaskError::WindowClosed.to_string(), "Window was closed.");
        let unexpected = TaskError::Unexpected("boom".into()).to_string();
        assert!(unexpected.contains("logs"));
        assert!(!unexpected.contains("boom"));
    }

    #[test]
    fn test_item_error_messages() {
        assert_eq!(ItemError::ResultTimeout.to_string(), "timeout");
        assert_eq!(
            ItemError::AgentReported("trash button missing".into()).to_string(),
            "trash button missing"
        );
        assert_eq!(
            ItemError::Interrupted(TaskError::Cancelled).to_string(),
            "Cancelled."
        );
        assert_eq!(
            ItemError::SendFailure {
                attempts: 3,
                detail: "no receiver".into()
            }
            .kind(),
            "send-failure-after-retries"
        );
    }
}
