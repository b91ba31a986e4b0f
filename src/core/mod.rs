//! 核心编排层：错误、任务状态、中止监管、任务编排、优雅关闭

pub mod error;
pub mod orchestrator;
pub mod shutdown;
pub mod state;
pub mod task_supervisor;

pub use error::{ItemError, TaskError};
pub use orchestrator::{TaskOrchestrator, TaskPolicy};
pub use shutdown::{ShutdownCoordinator, ShutdownManager, ShutdownReason, TaskCleanup};
pub use state::{DeletionTask, TaskSnapshot, TaskStatus};
pub use task_supervisor::TaskSupervisor;
