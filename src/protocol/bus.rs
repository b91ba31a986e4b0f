//! 广播消息总线
//!
//! 所有参与方都能收发；订阅端在 [`BusReceiver::recv`] 统一按应用标签过滤，
//! 下游只看到本应用的 [`Message`]。

use std::sync::Arc;

use tokio::sync::broadcast;

use super::{Envelope, Message};

/// 进程内广播总线（tokio broadcast）
#[derive(Clone)]
pub struct Bus {
    app: Arc<str>,
    sender: broadcast::Sender<Envelope>,
    capacity: usize,
}

impl Bus {
    pub fn new(app: impl Into<String>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            app: Arc::from(app.into()),
            sender,
            capacity,
        }
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    /// 每个订阅者最多缓存的消息数，超出后慢订阅者会丢消息
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 用本应用标签封装消息
    pub fn envelope(&self, message: Message) -> Envelope {
        Envelope::new(self.app.to_string(), message)
    }

    /// 发布本应用消息，返回收到该消息的订阅者数量（无订阅者时为 0）
    pub fn publish(&self, message: Message) -> usize {
        self.publish_envelope(self.envelope(message))
    }

    /// 发布任意信封（包括其它应用的流量）
    pub fn publish_envelope(&self, envelope: Envelope) -> usize {
        tracing::debug!(app = %envelope.app, action = %envelope.action(), "bus publish");
        self.sender.send(envelope).unwrap_or(0)
    }

    pub fn subscribe(&self) -> BusReceiver {
        BusReceiver {
            app: Arc::clone(&self.app),
            rx: self.sender.subscribe(),
        }
    }
}

/// 过滤后的订阅端
pub struct BusReceiver {
    app: Arc<str>,
    rx: broadcast::Receiver<Envelope>,
}

impl BusReceiver {
    /// 接收下一条本应用消息；总线关闭时返回 None
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) if envelope.is_for(&self.app) => return Some(envelope.message),
                Ok(envelope) => {
                    tracing::trace!(app = %envelope.app, "ignoring foreign envelope");
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "bus receiver lagged, messages dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DEFAULT_APP_TAG;

    #[tokio::test]
    async fn test_receiver_filters_foreign_app() {
        let bus = Bus::new(DEFAULT_APP_TAG, 8);
        let mut rx = bus.subscribe();

        bus.publish_envelope(Envelope::new("OtherApp", Message::StopDeletionTask));
        bus.publish(Message::HealthCheck);

        assert_eq!(rx.recv().await, Some(Message::HealthCheck));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = Bus::new(DEFAULT_APP_TAG, 8);
        assert_eq!(bus.publish(Message::HealthCheck), 0);

        let _rx = bus.subscribe();
        assert_eq!(bus.publish(Message::HealthCheck), 1);
    }

    #[tokio::test]
    async fn test_every_subscriber_sees_broadcast() {
        let bus = Bus::new(DEFAULT_APP_TAG, 8);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(Message::StopDeletionTask);

        assert_eq!(a.recv().await, Some(Message::StopDeletionTask));
        assert_eq!(b.recv().await, Some(Message::StopDeletionTask));
    }
}
