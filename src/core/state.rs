//! 状态定义：DeletionTask 与对外投影的 TaskSnapshot
//!
//! 任务完整状态只由编排器持有；观察者通过 watch 通道拿到轻量的 TaskSnapshot。

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::protocol::{ItemResult, TargetItem};

/// 任务状态；只能单向前进：Idle → Running → {Succeeded | Failed | Cancelled}
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum TaskStatus {
    Idle,
    Running,
    Cancelled,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Cancelled | TaskStatus::Succeeded | TaskStatus::Failed
        )
    }

    fn can_become(&self, next: TaskStatus) -> bool {
        match self {
            TaskStatus::Idle => next == TaskStatus::Running,
            TaskStatus::Running => next.is_terminal(),
            _ => false,
        }
    }
}

/// 当前唯一的删除任务
#[derive(Debug, Clone)]
pub struct DeletionTask {
    pub id: Uuid,
    items: Vec<TargetItem>,
    status: TaskStatus,
    /// 只追加，按 media_item_id 去重
    results: Vec<ItemResult>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl DeletionTask {
    /// 同一 id 只保留第一次出现的条目，每个 id 恰好产生一条结果
    pub fn new(items: Vec<TargetItem>) -> Self {
        let id = Uuid::new_v4();
        let submitted = items.len();
        let mut seen = HashSet::new();
        let items: Vec<TargetItem> = items
            .into_iter()
            .filter(|item| seen.insert(item.id.clone()))
            .collect();
        if items.len() < submitted {
            tracing::warn!(
                task_id = %id,
                dropped = submitted - items.len(),
                "duplicate media item ids dropped"
            );
        }
        Self {
            id,
            items,
            status: TaskStatus::Idle,
            results: Vec::new(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn items(&self) -> &[TargetItem] {
        &self.items
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn results(&self) -> &[ItemResult] {
        &self.results
    }

    /// 推进状态；非法跳转返回 false 且不修改
    pub fn transition(&mut self, next: TaskStatus) -> bool {
        if !self.status.can_become(next) {
            tracing::warn!(task_id = %self.id, from = ?self.status, to = ?next, "illegal task transition");
            return false;
        }
        match next {
            TaskStatus::Running => self.started_at = Some(Utc::now()),
            s if s.is_terminal() => self.finished_at = Some(Utc::now()),
            _ => {}
        }
        self.status = next;
        true
    }

    /// 追加单项结果；同一项已有结果时拒绝（返回 false）
    pub fn record(&mut self, result: ItemResult) -> bool {
        if self
            .results
            .iter()
            .any(|r| r.media_item_id == result.media_item_id)
        {
            return false;
        }
        self.results.push(result);
        true
    }

    pub fn failed_count(&self) -> usize {
        self.results.iter().filter(|r| !r.success).count()
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            task_id: Some(self.id),
            status: self.status,
            total: self.items.len(),
            completed: self.results.len(),
            failed: self.failed_count(),
            last_error: self
                .results
                .iter()
                .rev()
                .find_map(|r| r.error.clone()),
        }
    }
}

/// 观察者看到的「投影」状态
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TaskSnapshot {
    pub task_id: Option<Uuid>,
    pub status: TaskStatus,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub last_error: Option<String>,
}

impl Default for TaskSnapshot {
    fn default() -> Self {
        Self {
            task_id: None,
            status: TaskStatus::Idle,
            total: 0,
            completed: 0,
            failed: 0,
            last_error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> DeletionTask {
        DeletionTask::new(vec![
            TargetItem::new("a", "u1"),
            TargetItem::new("b", "u2"),
        ])
    }

    #[test]
    fn test_transitions_only_move_forward() {
        let mut t = task();
        assert!(!t.transition(TaskStatus::Succeeded));
        assert!(t.transition(TaskStatus::Running));
        assert!(t.started_at.is_some());
        assert!(!t.transition(TaskStatus::Idle));
        assert!(t.transition(TaskStatus::Cancelled));
        assert!(t.finished_at.is_some());
        assert!(!t.transition(TaskStatus::Running));
        assert!(!t.transition(TaskStatus::Succeeded));
        assert_eq!(t.status(), TaskStatus::Cancelled);
    }

    #[test]
    fn test_results_are_append_only() {
        let mut t = task();
        assert!(t.record(ItemResult::deleted("a", None)));
        assert!(!t.record(ItemResult::failed("a", "late duplicate")));
        assert!(t.record(ItemResult::failed("b", "timeout")));

        assert_eq!(t.results().len(), 2);
        assert!(t.results()[0].success);
        assert_eq!(t.failed_count(), 1);
    }

    #[test]
    fn test_duplicate_ids_keep_first_occurrence() {
        let t = DeletionTask::new(vec![
            TargetItem::new("a", "u1"),
            TargetItem::new("b", "u2"),
            TargetItem::new("a", "u3"),
        ]);
        let urls: Vec<&str> = t.items().iter().map(|i| i.product_url.as_str()).collect();
        assert_eq!(urls, vec!["u1", "u2"]);
        assert_eq!(t.snapshot().total, 2);
    }

    #[test]
    fn test_snapshot_projection() {
        let mut t = task();
        t.transition(TaskStatus::Running);
        t.record(ItemResult::failed("a", "timeout"));

        let snap = t.snapshot();
        assert_eq!(snap.task_id, Some(t.id));
        assert_eq!(snap.status, TaskStatus::Running);
        assert_eq!(snap.total, 2);
        assert_eq!(snap.completed, 1);
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.last_error.as_deref(), Some("timeout"));
    }
}
