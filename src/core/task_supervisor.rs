//! 任务监管：中止原因与取消令牌
//!
//! 持有两个 CancellationToken：
//! - `in_flight`：打断正在进行的等待（页面加载、投递退避、结果等待）
//! - `boundary`：`in_flight` 的子 token，在两项之间检查
//!
//! 窗口关闭总是取消 `in_flight`；Stop 是否取消 `in_flight` 由 `interrupt_in_flight` 决定，否则只取消 `boundary`。
//! 中止原因先到先得，唯一例外是窗口关闭：它会覆盖之前的 Stop。

use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

use crate::core::TaskError;

#[derive(Debug)]
pub struct TaskSupervisor {
    in_flight: CancellationToken,
    boundary: CancellationToken,
    /// 第一个中止原因生效，WindowClosed 可覆盖
    reason: Mutex<Option<TaskError>>,
    interrupt_in_flight: bool,
}

impl TaskSupervisor {
    pub fn new(interrupt_in_flight: bool) -> Self {
        let in_flight = CancellationToken::new();
        let boundary = in_flight.child_token();
        Self {
            in_flight,
            boundary,
            reason: Mutex::new(None),
            interrupt_in_flight,
        }
    }

    /// 请求中止；返回原因是否被记录（已有原因时通常保留原有的）
    pub fn abort(&self, reason: TaskError) -> bool {
        let window_closed = reason == TaskError::WindowClosed;
        let interrupt = self.interrupt_in_flight || window_closed;
        let recorded = {
            let mut slot = self.reason.lock().unwrap_or_else(|p| p.into_inner());
            let replace = match slot.as_ref() {
                None => true,
                Some(current) => window_closed && *current != TaskError::WindowClosed,
            };
            if replace {
                *slot = Some(reason);
            }
            replace
        };

        if interrupt {
            self.in_flight.cancel();
        } else {
            self.boundary.cancel();
        }
        recorded
    }

    pub fn reason(&self) -> Option<TaskError> {
        self.reason
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn is_aborted(&self) -> bool {
        self.boundary.is_cancelled()
    }

    /// 单项等待使用的 token
    pub fn in_flight_token(&self) -> &CancellationToken {
        &self.in_flight
    }
}
