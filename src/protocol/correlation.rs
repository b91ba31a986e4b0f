//! 关联表：单次等待的回复
//!
//! 每个等待者以 key 登记一次，回复到达时 [`PendingTable::settle`] 取走条目并唤醒等待者；
//! 同一 key 的重复回复找不到条目，直接被丢弃。等待者被 drop（超时、中止）时自动注销。

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// 等待失败的原因
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    #[error("timed out waiting for reply")]
    TimedOut,
    #[error("wait aborted")]
    Aborted,
    /// 条目被同 key 的新登记替换
    #[error("pending entry was replaced")]
    Abandoned,
}

type Entries<K, V> = HashMap<K, (u64, oneshot::Sender<V>)>;

/// 按 key 关联的待回复表
pub struct PendingTable<K, V> {
    name: &'static str,
    entries: Arc<Mutex<Entries<K, V>>>,
    next_ticket: AtomicU64,
}

impl<K, V> PendingTable<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
{
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: Arc::new(Mutex::new(HashMap::new())),
            next_ticket: AtomicU64::new(0),
        }
    }

    /// 登记一个等待者；应在触发回复的动作之前调用，避免回复先到
    pub fn register(&self, key: K) -> Pending<K, V> {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let replaced = lock(&self.entries).insert(key.clone(), (ticket, tx));
        if replaced.is_some() {
            tracing::warn!(table = self.name, ?key, "replacing pending entry");
        }
        Pending {
            key,
            ticket,
            rx,
            entries: Arc::clone(&self.entries),
        }
    }

    /// 交付回复；没有等待者（已交付、已超时或从未登记）时返回 false
    pub fn settle(&self, key: &K, value: V) -> bool {
        let entry = lock(&self.entries).remove(key);
        match entry {
            Some((_, tx)) => tx.send(value).is_ok(),
            None => {
                tracing::debug!(table = self.name, ?key, "no pending entry, reply dropped");
                false
            }
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock<K, V>(entries: &Mutex<Entries<K, V>>) -> std::sync::MutexGuard<'_, Entries<K, V>> {
    // 持锁区只有 insert/remove，不会在持锁时 panic
    entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// 已登记的等待者
pub struct Pending<K, V>
where
    K: Eq + Hash,
{
    key: K,
    ticket: u64,
    rx: oneshot::Receiver<V>,
    entries: Arc<Mutex<Entries<K, V>>>,
}

impl<K, V> Pending<K, V>
where
    K: Eq + Hash,
{
    /// 等待回复，与可选超时和中止令牌赛跑；先到者胜出，其余分支随之 drop
    pub async fn wait(
        mut self,
        limit: Option<Duration>,
        abort: &CancellationToken,
    ) -> Result<V, WaitError> {
        let deadline = async move {
            match limit {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            reply = &mut self.rx => reply.map_err(|_| WaitError::Abandoned),
            _ = abort.cancelled() => Err(WaitError::Aborted),
            _ = deadline => Err(WaitError::TimedOut),
        }
    }
}

impl<K, V> Drop for Pending<K, V>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if entries.get(&self.key).map(|(t, _)| *t) == Some(self.ticket) {
            entries.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_settle_wakes_waiter_once() {
        let table: PendingTable<String, u32> = PendingTable::new("test");
        let pending = table.register("a".to_string());

        assert!(table.settle(&"a".to_string(), 1));
        // 重复回复不会再次交付
        assert!(!table.settle(&"a".to_string(), 2));

        let token = CancellationToken::new();
        assert_eq!(pending.wait(None, &token).await, Ok(1));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_deregisters() {
        let table: PendingTable<String, u32> = PendingTable::new("test");
        let pending = table.register("a".to_string());
        assert_eq!(table.len(), 1);

        let token = CancellationToken::new();
        let result = pending.wait(Some(Duration::from_millis(20)), &token).await;
        assert_eq!(result, Err(WaitError::TimedOut));
        assert!(table.is_empty());
        assert!(!table.settle(&"a".to_string(), 1));
    }

    #[tokio::test]
    async fn test_abort_wins_over_missing_reply() {
        let table: PendingTable<u64, ()> = PendingTable::new("test");
        let pending = table.register(7);
        let token = CancellationToken::new();
        token.cancel();

        assert_eq!(pending.wait(None, &token).await, Err(WaitError::Aborted));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_settled_reply_preferred_over_abort() {
        let table: PendingTable<u64, u32> = PendingTable::new("test");
        let pending = table.register(1);
        table.settle(&1, 9);
        let token = CancellationToken::new();
        token.cancel();

        assert_eq!(pending.wait(None, &token).await, Ok(9));
    }

    #[tokio::test]
    async fn test_reregister_abandons_old_waiter() {
        let table: PendingTable<u64, u32> = PendingTable::new("test");
        let old = table.register(1);
        let new = table.register(1);

        // 旧等待者 drop 时不能删掉新条目
        drop(old);
        assert_eq!(table.len(), 1);

        assert!(table.settle(&1, 3));
        let token = CancellationToken::new();
        assert_eq!(new.wait(None, &token).await, Ok(3));
    }

    #[tokio::test]
    async fn test_replaced_waiter_sees_abandoned() {
        let table: PendingTable<u64, u32> = PendingTable::new("test");
        let old = table.register(1);
        let _new = table.register(1);

        let token = CancellationToken::new();
        assert_eq!(old.wait(None, &token).await, Err(WaitError::Abandoned));
    }
}
