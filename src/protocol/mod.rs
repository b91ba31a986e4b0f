//! 跨上下文消息协议：信封、广播总线、回复关联表

mod bus;
mod correlation;
mod envelope;

use thiserror::Error;

pub use bus::{Bus, BusReceiver};
pub use correlation::{Pending, PendingTable, WaitError};
pub use envelope::{
    Action, Envelope, ItemResult, Message, TargetItem, TaskResult, DEFAULT_APP_TAG,
};

/// 编解码错误
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("transport error: {0}")]
    Transport(String),
}
