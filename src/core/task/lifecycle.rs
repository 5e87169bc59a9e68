//! 任务生命周期：任务表 + 唯一写入者 TaskController

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use log::{error, info};
use serde::Serialize;
use uuid::Uuid;

use crate::core::aggregate::ResultRecord;
use crate::core::config::ScanParams;
use crate::core::error::ScanError;
use crate::core::task::events::{ProgressHub, TaskEvent};
use crate::core::task::state::TaskStatus;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessingTask {
    pub id: Uuid,
    pub video_path: PathBuf,
    pub status: TaskStatus,
    /// 0-100，只有完成时才到 100
    pub progress: u8,
    pub current_frame: u64,
    pub total_frames: u64,
    pub message: String,
    pub error_message: Option<String>,
    pub result_count: usize,
    pub params: ScanParams,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ProcessingTask {
    pub fn new(video_path: &Path, params: ScanParams) -> Self {
        Self {
            id: Uuid::new_v4(),
            video_path: video_path.to_path_buf(),
            status: TaskStatus::Pending,
            progress: 0,
            current_frame: 0,
            total_frames: 0,
            message: String::new(),
            error_message: None,
            result_count: 0,
            params,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn status_event(&self) -> TaskEvent {
        TaskEvent::Status {
            task_id: self.id,
            status: self.status,
            progress: self.progress,
            current_frame: self.current_frame,
            total_frames: self.total_frames,
            message: self.message.clone(),
            error_message: self.error_message.clone(),
        }
    }
}

/// `floor(current / total * 100)`，最多 99；总帧数未知时返回 `None`
pub fn progress_percent(current_frame: u64, total_frames: u64) -> Option<u8> {
    if total_frames == 0 {
        return None;
    }
    let percent = (current_frame as u128 * 100 / total_frames as u128).min(99);
    Some(percent as u8)
}

struct TaskEntry {
    task: ProcessingTask,
    results: Vec<ResultRecord>,
}

/// 内存任务表，服务与工作线程共享
#[derive(Default)]
pub struct TaskStore {
    tasks: Mutex<HashMap<Uuid, TaskEntry>>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, TaskEntry>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, task: ProcessingTask) -> Uuid {
        let id = task.id;
        self.lock().insert(
            id,
            TaskEntry {
                task,
                results: Vec::new(),
            },
        );
        id
    }

    pub fn get(&self, id: &Uuid) -> Option<ProcessingTask> {
        self.lock().get(id).map(|entry| entry.task.clone())
    }

    /// 已完成任务的结果，按首次出现时间排序
    pub fn results(&self, id: &Uuid) -> Result<Vec<ResultRecord>, ScanError> {
        let tasks = self.lock();
        let entry = tasks
            .get(id)
            .ok_or_else(|| ScanError::TaskNotFound(id.to_string()))?;
        if entry.task.status != TaskStatus::Completed {
            return Err(ScanError::TaskNotCompleted(entry.task.status));
        }
        Ok(entry.results.clone())
    }

    /// 按创建时间倒序
    pub fn list(&self, status: Option<TaskStatus>, limit: usize) -> Vec<ProcessingTask> {
        let mut tasks: Vec<ProcessingTask> = self
            .lock()
            .values()
            .filter(|entry| status.map_or(true, |s| entry.task.status == s))
            .map(|entry| entry.task.clone())
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        tasks.truncate(limit);
        tasks
    }

    pub fn remove(&self, id: &Uuid) -> Option<ProcessingTask> {
        self.lock().remove(id).map(|entry| entry.task)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn update<R>(
        &self,
        id: &Uuid,
        f: impl FnOnce(&mut TaskEntry) -> Result<R, ScanError>,
    ) -> Result<R, ScanError> {
        let mut tasks = self.lock();
        let entry = tasks
            .get_mut(id)
            .ok_or_else(|| ScanError::TaskNotFound(id.to_string()))?;
        f(entry)
    }
}

/// 单个任务状态和进度的唯一写入者，每次修改都会发布给订阅者
#[derive(Clone)]
pub struct TaskController {
    task_id: Uuid,
    store: Arc<TaskStore>,
    hub: Arc<ProgressHub>,
}

impl TaskController {
    pub fn new(task_id: Uuid, store: Arc<TaskStore>, hub: Arc<ProgressHub>) -> Self {
        Self {
            task_id,
            store,
            hub,
        }
    }

    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    pub fn start(&self) -> Result<(), ScanError> {
        let event = self.store.update(&self.task_id, |entry| {
            let task = &mut entry.task;
            task.status = task.status.transition(TaskStatus::Processing)?;
            task.started_at = Some(Utc::now());
            task.message = "Starting video processing...".to_string();

            info!(
                "🚀 Starting task {} ({}, region {}, {} fps sampling, min confidence {})",
                task.id,
                task.video_path.display(),
                task.params.region,
                task.params.sample_fps,
                task.params.min_confidence
            );
            Ok(progress_event(task))
        })?;

        self.hub.publish(event);
        Ok(())
    }

    /// 返回实际记录的进度（不会回退）
    pub fn report_progress(
        &self,
        current_frame: u64,
        total_frames: u64,
        message: &str,
    ) -> Result<u8, ScanError> {
        let event = self.store.update(&self.task_id, |entry| {
            let task = &mut entry.task;
            if task.status != TaskStatus::Processing {
                return Err(ScanError::InvalidTransition {
                    from: task.status,
                    to: TaskStatus::Processing,
                });
            }

            if let Some(percent) = progress_percent(current_frame, total_frames) {
                task.progress = task.progress.max(percent);
            }
            task.current_frame = current_frame;
            task.total_frames = total_frames;
            task.message = message.to_string();
            Ok(progress_event(task))
        })?;

        let recorded = event.progress().unwrap_or(0);
        self.hub.publish(event);
        Ok(recorded)
    }

    pub fn complete(&self, results: Vec<ResultRecord>) -> Result<(), ScanError> {
        let count = results.len();
        let event = self.store.update(&self.task_id, |entry| {
            let task = &mut entry.task;
            task.status = task.status.transition(TaskStatus::Completed)?;
            task.progress = 100;
            task.result_count = count;
            task.completed_at = Some(Utc::now());
            task.message = format!("Processing completed! Found {} phone numbers.", count);
            entry.results = results;

            Ok(TaskEvent::Completed {
                task_id: task.id,
                status: task.status,
                message: task.message.clone(),
                result_count: count,
            })
        })?;

        info!("🎉 Task {} completed with {} numbers", self.task_id, count);
        self.hub.publish(event);
        Ok(())
    }

    pub fn fail(&self, error_message: &str) -> Result<(), ScanError> {
        let event = self.store.update(&self.task_id, |entry| {
            let task = &mut entry.task;
            task.status = task.status.transition(TaskStatus::Failed)?;
            task.error_message = Some(error_message.to_string());
            task.completed_at = Some(Utc::now());

            Ok(TaskEvent::Failed {
                task_id: task.id,
                status: task.status,
                error_message: error_message.to_string(),
            })
        })?;

        error!("❌ Task {} failed: {}", self.task_id, error_message);
        self.hub.publish(event);
        Ok(())
    }
}

fn progress_event(task: &ProcessingTask) -> TaskEvent {
    TaskEvent::Progress {
        task_id: task.id,
        status: task.status,
        progress: task.progress,
        current_frame: task.current_frame,
        total_frames: task.total_frames,
        message: task.message.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Arc<TaskStore>, Arc<ProgressHub>, TaskController) {
        let store = Arc::new(TaskStore::new());
        let hub = Arc::new(ProgressHub::new());
        let id = store.insert(ProcessingTask::new(Path::new("clip.mp4"), ScanParams::default()));
        let controller = TaskController::new(id, store.clone(), hub.clone());
        (store, hub, controller)
    }

    fn record(canonical: &str) -> ResultRecord {
        ResultRecord {
            canonical_number: canonical.to_string(),
            national_number: String::new(),
            first_seen_seconds: Some(0.0),
            frame_count: 1,
            example_raw_text: String::new(),
            validated: true,
        }
    }

    #[test]
    fn test_progress_percent() {
        assert_eq!(progress_percent(0, 200), Some(0));
        assert_eq!(progress_percent(199, 200), Some(99));
        assert_eq!(progress_percent(200, 200), Some(99));
        assert_eq!(progress_percent(500, 200), Some(99));
        assert_eq!(progress_percent(10, 0), None);
    }

    #[test]
    fn test_progress_never_decreases() {
        let (store, _, controller) = setup();
        controller.start().unwrap();

        assert_eq!(controller.report_progress(50, 100, "half").unwrap(), 50);
        assert_eq!(controller.report_progress(30, 100, "late event").unwrap(), 50);
        assert_eq!(controller.report_progress(10, 0, "unknown total").unwrap(), 50);
        assert_eq!(controller.report_progress(100, 100, "last frame").unwrap(), 99);

        let task = store.get(&controller.task_id()).unwrap();
        assert_eq!(task.progress, 99);
        assert_eq!(task.message, "last frame");
    }

    #[test]
    fn test_published_progress_is_monotonic_and_ends_at_100() {
        let (store, hub, controller) = setup();
        let id = controller.task_id();
        let rx = hub
            .subscribe(id, || store.get(&id).map(|t| t.status_event()))
            .unwrap();

        controller.start().unwrap();
        for frame in [0, 40, 20, 80, 120] {
            controller.report_progress(frame, 100, "working").unwrap();
        }
        controller.complete(vec![record("+972531234567")]).unwrap();

        let values: Vec<u8> = rx.iter().filter_map(|e| e.progress()).collect();
        assert!(values.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(values.last(), Some(&100));
        assert_eq!(values.iter().filter(|v| **v == 100).count(), 1);
    }

    #[test]
    fn test_complete_stores_results() {
        let (store, _, controller) = setup();
        let id = controller.task_id();
        assert!(matches!(
            store.results(&id),
            Err(ScanError::TaskNotCompleted(TaskStatus::Pending))
        ));

        controller.start().unwrap();
        controller
            .complete(vec![record("+972531234567"), record("+972541234567")])
            .unwrap();

        let task = store.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress, 100);
        assert_eq!(task.result_count, 2);
        assert_eq!(task.message, "Processing completed! Found 2 phone numbers.");
        assert!(task.completed_at.is_some());
        assert_eq!(store.results(&id).unwrap().len(), 2);
    }

    #[test]
    fn test_fail_is_terminal() {
        let (store, _, controller) = setup();
        controller.start().unwrap();
        controller.fail("Cannot open video source: missing.mp4").unwrap();

        let task = store.get(&controller.task_id()).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error_message.as_deref(), Some("Cannot open video source: missing.mp4"));

        assert!(controller.report_progress(1, 2, "too late").is_err());
        assert!(controller.complete(Vec::new()).is_err());
        assert!(controller.fail("again").is_err());
    }

    #[test]
    fn test_list_newest_first_with_filter() {
        let store = TaskStore::new();
        let mut older = ProcessingTask::new(Path::new("a.mp4"), ScanParams::default());
        older.created_at = Utc::now() - chrono::Duration::seconds(60);
        let older_id = store.insert(older);
        let newer_id = store.insert(ProcessingTask::new(Path::new("b.mp4"), ScanParams::default()));

        let listed: Vec<Uuid> = store.list(None, 10).into_iter().map(|t| t.id).collect();
        assert_eq!(listed, vec![newer_id, older_id]);
        assert_eq!(store.list(None, 1).len(), 1);
        assert!(store.list(Some(TaskStatus::Completed), 10).is_empty());

        assert!(store.remove(&older_id).is_some());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_unknown_task() {
        let store = Arc::new(TaskStore::new());
        let controller = TaskController::new(Uuid::new_v4(), store.clone(), Arc::new(ProgressHub::new()));
        assert!(matches!(controller.start(), Err(ScanError::TaskNotFound(_))));
        assert!(matches!(store.results(&Uuid::new_v4()), Err(ScanError::TaskNotFound(_))));
    }
}
