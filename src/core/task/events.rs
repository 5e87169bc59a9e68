//! 任务事件与按任务 id 分发的订阅中心

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::debug;
use serde::Serialize;
use uuid::Uuid;

use crate::core::task::state::TaskStatus;

/// 订阅者可能收到重复或乱序的进度，只以单调递增的 `progress` 为准
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    /// 每个新订阅者收到一次的状态快照
    Status {
        task_id: Uuid,
        status: TaskStatus,
        progress: u8,
        current_frame: u64,
        total_frames: u64,
        message: String,
        error_message: Option<String>,
    },
    Progress {
        task_id: Uuid,
        status: TaskStatus,
        progress: u8,
        current_frame: u64,
        total_frames: u64,
        message: String,
    },
    Completed {
        task_id: Uuid,
        status: TaskStatus,
        message: String,
        result_count: usize,
    },
    Failed {
        task_id: Uuid,
        status: TaskStatus,
        error_message: String,
    },
}

impl TaskEvent {
    pub fn task_id(&self) -> Uuid {
        match self {
            TaskEvent::Status { task_id, .. }
            | TaskEvent::Progress { task_id, .. }
            | TaskEvent::Completed { task_id, .. }
            | TaskEvent::Failed { task_id, .. } => *task_id,
        }
    }

    pub fn status(&self) -> TaskStatus {
        match self {
            TaskEvent::Status { status, .. }
            | TaskEvent::Progress { status, .. }
            | TaskEvent::Completed { status, .. }
            | TaskEvent::Failed { status, .. } => *status,
        }
    }

    pub fn progress(&self) -> Option<u8> {
        match self {
            TaskEvent::Status { progress, .. } | TaskEvent::Progress { progress, .. } => {
                Some(*progress)
            }
            TaskEvent::Completed { .. } => Some(100),
            TaskEvent::Failed { .. } => None,
        }
    }
}

#[derive(Default)]
pub struct ProgressHub {
    subscribers: Mutex<HashMap<Uuid, Vec<Sender<TaskEvent>>>>,
}

impl ProgressHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// 接收端先收到快照；任务已结束时只收到快照，随后断开
    ///
    /// `snapshot` 在 hub 锁内执行，并发发布的终态事件要么已体现在快照中，要么随后送达。
    /// `snapshot` 找不到任务时返回 `None`
    pub fn subscribe<F>(&self, task_id: Uuid, snapshot: F) -> Option<Receiver<TaskEvent>>
    where
        F: FnOnce() -> Option<TaskEvent>,
    {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let snapshot = snapshot()?;
        let terminal = snapshot.status().is_terminal();
        let (tx, rx) = unbounded();
        let _ = tx.send(snapshot);
        if !terminal {
            subscribers.entry(task_id).or_default().push(tx);
        }
        Some(rx)
    }

    /// 发给该任务的所有订阅者，已断开的订阅者被移除
    pub fn publish(&self, event: TaskEvent) {
        let task_id = event.task_id();
        let terminal = event.status().is_terminal();

        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(senders) = subscribers.get_mut(&task_id) {
            senders.retain(|tx| tx.send(event.clone()).is_ok());
            debug!("📣 {} event for {} to {} subscribers", event.status(), task_id, senders.len());
        }

        // 终态事件之后不会再有消息，断开所有订阅者
        if terminal {
            subscribers.remove(&task_id);
        }
    }

    pub fn subscriber_count(&self, task_id: &Uuid) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(task_id)
            .map_or(0, Vec::len)
    }

    pub fn close(&self, task_id: &Uuid) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(task_id: Uuid, status: TaskStatus) -> TaskEvent {
        TaskEvent::Status {
            task_id,
            status,
            progress: 0,
            current_frame: 0,
            total_frames: 0,
            message: String::new(),
            error_message: None,
        }
    }

    fn progress(task_id: Uuid, value: u8) -> TaskEvent {
        TaskEvent::Progress {
            task_id,
            status: TaskStatus::Processing,
            progress: value,
            current_frame: value as u64,
            total_frames: 100,
            message: format!("frame {value}"),
        }
    }

    #[test]
    fn test_snapshot_first_then_live_events() {
        let hub = ProgressHub::new();
        let id = Uuid::new_v4();
        let rx = hub.subscribe(id, || Some(snapshot(id, TaskStatus::Processing))).unwrap();

        hub.publish(progress(id, 10));
        hub.publish(TaskEvent::Completed {
            task_id: id,
            status: TaskStatus::Completed,
            message: "done".into(),
            result_count: 2,
        });

        let events: Vec<TaskEvent> = rx.iter().collect();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], TaskEvent::Status { .. }));
        assert_eq!(events[1].progress(), Some(10));
        assert_eq!(events[2].status(), TaskStatus::Completed);
        assert_eq!(hub.subscriber_count(&id), 0);
    }

    #[test]
    fn test_events_routed_by_task_id() {
        let hub = ProgressHub::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let rx_a = hub.subscribe(a, || Some(snapshot(a, TaskStatus::Pending))).unwrap();

        hub.publish(progress(b, 50));
        hub.publish(progress(a, 5));

        let _ = rx_a.recv().unwrap();
        assert_eq!(rx_a.try_recv().unwrap().task_id(), a);
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn test_dropped_subscriber_pruned() {
        let hub = ProgressHub::new();
        let id = Uuid::new_v4();
        let rx = hub.subscribe(id, || Some(snapshot(id, TaskStatus::Processing))).unwrap();
        let _keep = hub.subscribe(id, || Some(snapshot(id, TaskStatus::Processing))).unwrap();
        drop(rx);

        hub.publish(progress(id, 1));
        assert_eq!(hub.subscriber_count(&id), 1);
    }

    #[test]
    fn test_terminal_task_subscription_closes() {
        let hub = ProgressHub::new();
        let id = Uuid::new_v4();
        let rx = hub.subscribe(id, || Some(snapshot(id, TaskStatus::Failed))).unwrap();
        assert_eq!(rx.iter().count(), 1);
    }

    #[test]
    fn test_event_json_shape() {
        let id = Uuid::nil();
        let json = serde_json::to_value(TaskEvent::Failed {
            task_id: id,
            status: TaskStatus::Failed,
            error_message: "cancelled".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "failed");
        assert_eq!(json["status"], "failed");
        assert_eq!(json["error_message"], "cancelled");
    }
}
