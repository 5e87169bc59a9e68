//! 视频号码扫描服务
//!
//! ```ignore
//! let service = PhoneScanService::new(config, opener, ocr, validator)?;
//! let id = service.submit(Path::new("promo.mp4"), None)?;
//! for event in service.subscribe(id)? {
//!     println!("{:?}", event);
//! }
//! let numbers = service.results(id)?;
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use crossbeam_channel::Receiver;
use log::{error, info, warn};
use rayon::{ThreadPool, ThreadPoolBuilder};
use uuid::Uuid;

use crate::core::aggregate::ResultRecord;
use crate::core::config::{ScanParams, ServiceConfig};
use crate::core::error::ScanError;
use crate::core::ocr::recognizer::OcrEngine;
use crate::core::phone::validator::PhoneValidator;
use crate::core::pipeline::{PhonePipeline, ScanReport};
use crate::core::task::events::{ProgressHub, TaskEvent};
use crate::core::task::lifecycle::{ProcessingTask, TaskController, TaskStore};
use crate::core::task::state::TaskStatus;
use crate::core::video::sampler::ScanControl;
use crate::core::video::source::FrameSourceOpener;

type Controls = Arc<Mutex<HashMap<Uuid, ScanControl>>>;

/// 后台任务服务 - 提交后立即返回任务 id，由线程池执行
pub struct PhoneScanService {
    config: ServiceConfig,
    pool: ThreadPool,
    store: Arc<TaskStore>,
    hub: Arc<ProgressHub>,
    controls: Controls,
    opener: Arc<dyn FrameSourceOpener>,
    ocr: Arc<dyn OcrEngine>,
    validator: Arc<dyn PhoneValidator>,
}

impl PhoneScanService {
    pub fn new(
        config: ServiceConfig,
        opener: Arc<dyn FrameSourceOpener>,
        ocr: Arc<dyn OcrEngine>,
        validator: Arc<dyn PhoneValidator>,
    ) -> Result<Self, ScanError> {
        crate::init_logging();
        config.validate()?;

        let pool = ThreadPoolBuilder::new()
            .num_threads(config.workers)
            .thread_name(|i| format!("phone-scan-{i}"))
            .panic_handler(|_| error!("❌ Scan worker panicked outside job boundary"))
            .build()
            .map_err(|e| ScanError::Config(format!("worker pool: {e}")))?;

        info!("🎬 PhoneScanService: created with {} workers", config.workers);
        Ok(Self {
            config,
            pool,
            store: Arc::new(TaskStore::new()),
            hub: Arc::new(ProgressHub::new()),
            controls: Arc::new(Mutex::new(HashMap::new())),
            opener,
            ocr,
            validator,
        })
    }

    /// FFmpeg 解码 + Tesseract OCR + libphonenumber 校验
    #[cfg(all(feature = "ffmpeg", feature = "tesseract"))]
    pub fn with_system_engines(config: ServiceConfig) -> Result<Self, ScanError> {
        Self::new(
            config,
            Arc::new(crate::core::video::source::FfmpegOpener),
            Arc::new(crate::core::ocr::tesseract::TesseractEngine::new()),
            Arc::new(crate::core::phone::validator::LibPhoneValidator::new()),
        )
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// 提交扫描任务，`params` 为空时使用服务默认参数
    pub fn submit(&self, video_path: &Path, params: Option<ScanParams>) -> Result<Uuid, ScanError> {
        self.config.check_extension(video_path)?;
        let params = params.unwrap_or_else(|| self.config.defaults.clone());
        params.validate()?;

        let task = ProcessingTask::new(video_path, params.clone());
        let task_id = self.store.insert(task);

        let control = ScanControl::new().with_budget(params.time_budget());
        lock_controls(&self.controls).insert(task_id, control.clone());

        let job = Job {
            task_id,
            video_path: video_path.to_path_buf(),
            params,
            control,
            controller: TaskController::new(task_id, self.store.clone(), self.hub.clone()),
            controls: self.controls.clone(),
            opener: self.opener.clone(),
            ocr: self.ocr.clone(),
            validator: self.validator.clone(),
        };
        self.pool.spawn(move || job.run());

        info!("📥 Task {} queued for {}", task_id, video_path.display());
        Ok(task_id)
    }

    pub fn status(&self, task_id: Uuid) -> Result<ProcessingTask, ScanError> {
        self.store
            .get(&task_id)
            .ok_or_else(|| ScanError::TaskNotFound(task_id.to_string()))
    }

    /// 仅在任务完成后可用
    pub fn results(&self, task_id: Uuid) -> Result<Vec<ResultRecord>, ScanError> {
        self.store.results(&task_id)
    }

    /// 按创建时间倒序，可按状态过滤
    pub fn list(&self, status: Option<TaskStatus>, limit: usize) -> Vec<ProcessingTask> {
        self.store.list(status, limit)
    }

    /// 取消排队中或运行中的任务，在下一个采样帧生效
    pub fn cancel(&self, task_id: Uuid) -> Result<(), ScanError> {
        let task = self.status(task_id)?;
        if task.status.is_terminal() {
            return Ok(());
        }
        if let Some(control) = lock_controls(&self.controls).get(&task_id) {
            control.cancel();
            info!("🛑 Cancellation requested for {}", task_id);
        }
        Ok(())
    }

    /// 删除任务及结果，运行中的任务先取消
    pub fn delete(&self, task_id: Uuid) -> Result<ProcessingTask, ScanError> {
        if let Some(control) = lock_controls(&self.controls).remove(&task_id) {
            control.cancel();
        }
        let task = self
            .store
            .remove(&task_id)
            .ok_or_else(|| ScanError::TaskNotFound(task_id.to_string()))?;
        self.hub.close(&task_id);

        info!("🗑️ Task {} deleted", task_id);
        Ok(task)
    }

    /// 订阅单个任务的事件流：先收到状态快照，任务完成或失败后流结束
    pub fn subscribe(&self, task_id: Uuid) -> Result<Receiver<TaskEvent>, ScanError> {
        let store = &self.store;
        self.hub
            .subscribe(task_id, || store.get(&task_id).map(|t| t.status_event()))
            .ok_or_else(|| ScanError::TaskNotFound(task_id.to_string()))
    }

    /// 使用服务的引擎在调用线程上同步扫描
    pub fn scan_now(&self, video_path: &Path, params: Option<ScanParams>) -> Result<ScanReport, ScanError> {
        self.config.check_extension(video_path)?;
        let params = params.unwrap_or_else(|| self.config.defaults.clone());
        scan_video(
            self.opener.as_ref(),
            video_path,
            self.ocr.clone(),
            self.validator.clone(),
            &params,
        )
    }
}

impl Drop for PhoneScanService {
    fn drop(&mut self) {
        info!("🗑️ PhoneScanService: released");
    }
}

/// 在当前线程上一次性扫描视频文件
pub fn scan_video(
    opener: &dyn FrameSourceOpener,
    video_path: &Path,
    ocr: Arc<dyn OcrEngine>,
    validator: Arc<dyn PhoneValidator>,
    params: &ScanParams,
) -> Result<ScanReport, ScanError> {
    params.validate()?;
    info!("🚀 Scanning {} (region {})", video_path.display(), params.region);

    let mut source = opener.open(video_path)?;
    let pipeline = PhonePipeline::new(ocr, validator, params.clone());
    let control = ScanControl::new().with_budget(params.time_budget());
    let log_progress = |current: u64, total: u64, message: &str| {
        info!("📈 {}/{} {}", current, total, message);
    };

    pipeline.run(source.as_mut(), &log_progress, &control)
}

struct Job {
    task_id: Uuid,
    video_path: PathBuf,
    params: ScanParams,
    control: ScanControl,
    controller: TaskController,
    controls: Controls,
    opener: Arc<dyn FrameSourceOpener>,
    ocr: Arc<dyn OcrEngine>,
    validator: Arc<dyn PhoneValidator>,
}

impl Job {
    /// 任务边界：任何错误或 panic 都落到 fail，不影响其他任务
    fn run(self) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.execute()));

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(payload) => Some(panic_message(payload.as_ref())),
        };

        if let Some(message) = failure {
            if let Err(e) = self.controller.fail(&message) {
                warn!("⚠️ Could not record failure of {}: {}", self.task_id, e);
            }
        }

        lock_controls(&self.controls).remove(&self.task_id);
    }

    fn execute(&self) -> Result<(), ScanError> {
        if self.control.is_cancelled() {
            return Err(ScanError::Cancelled);
        }
        self.controller.start()?;

        // source 在本函数返回时释放，无论成功失败
        let mut source = self.opener.open(&self.video_path)?;
        let pipeline = PhonePipeline::new(self.ocr.clone(), self.validator.clone(), self.params.clone());
        let report = pipeline.run(source.as_mut(), &self.controller, &self.control)?;

        self.controller.complete(report.results)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("worker panicked: {detail}")
}

fn lock_controls(controls: &Controls) -> std::sync::MutexGuard<'_, HashMap<Uuid, ScanControl>> {
    controls.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::core::ocr::recognizer::{tokens_for_lines, ScriptedOcrEngine};
    use crate::core::phone::validator::testing::TableValidator;
    use crate::core::video::frame::Frame;
    use crate::core::video::source::{FrameSource, MemoryFrameSource};

    const NUMBER: &str = "+972531234567";

    struct FakeOpener {
        frames: u64,
        fail_at: Option<u64>,
        released: Arc<AtomicBool>,
    }

    impl FakeOpener {
        fn new(frames: u64) -> Self {
            Self {
                frames,
                fail_at: None,
                released: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    impl FrameSourceOpener for FakeOpener {
        fn open(&self, path: &Path) -> Result<Box<dyn FrameSource>, ScanError> {
            match path.file_stem().and_then(|s| s.to_str()) {
                Some("missing") => Err(ScanError::SourceOpen(format!("{}", path.display()))),
                Some("explode") => panic!("decoder blew up"),
                _ => {
                    let frames = (0..self.frames)
                        .map(|n| Frame::new(8, 8, vec![200u8; 8 * 8 * 4], n))
                        .collect();
                    let mut source = MemoryFrameSource::new(frames, Some(25.0))
                        .with_release_flag(self.released.clone());
                    if let Some(index) = self.fail_at {
                        source = source.failing_at(index);
                    }
                    Ok(Box::new(source))
                }
            }
        }
    }

    fn number_every_frame() -> Arc<ScriptedOcrEngine> {
        Arc::new(ScriptedOcrEngine::with_script(|_| {
            Ok(tokens_for_lines(&["Call 053-123-4567"], 92.0))
        }))
    }

    fn slow_engine() -> Arc<ScriptedOcrEngine> {
        Arc::new(ScriptedOcrEngine::with_script(|_| {
            std::thread::sleep(Duration::from_millis(5));
            Ok(Vec::new())
        }))
    }

    fn service(opener: FakeOpener, ocr: Arc<ScriptedOcrEngine>) -> PhoneScanService {
        let config = ServiceConfig {
            workers: 2,
            ..Default::default()
        };
        PhoneScanService::new(
            config,
            Arc::new(opener),
            ocr,
            Arc::new(TableValidator::new(&[NUMBER])),
        )
        .unwrap()
    }

    /// 读完事件流，返回全部事件和最终任务状态
    fn wait(service: &PhoneScanService, id: Uuid) -> (Vec<TaskEvent>, ProcessingTask) {
        let events: Vec<TaskEvent> = service.subscribe(id).unwrap().iter().collect();
        (events, service.status(id).unwrap())
    }

    #[test]
    fn test_submit_runs_to_completion() {
        let svc = service(FakeOpener::new(20), number_every_frame());
        let id = svc.submit(Path::new("promo.mp4"), None).unwrap();

        let (events, task) = wait(&svc, id);
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress, 100);
        assert_eq!(task.result_count, 1);
        assert!(task.started_at.is_some() && task.completed_at.is_some());
        assert!(matches!(events.last(), Some(TaskEvent::Completed { result_count: 1, .. })));

        let progress: Vec<u8> = events.iter().filter_map(|e| e.progress()).collect();
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));

        let results = svc.results(id).unwrap();
        assert_eq!(results[0].canonical_number, NUMBER);
        // 20 frames at 25 fps, sampled at 4 fps -> every 6th frame
        assert_eq!(results[0].frame_count, 4);
    }

    #[test]
    fn test_unsupported_extension_rejected() {
        let svc = service(FakeOpener::new(1), number_every_frame());
        assert!(matches!(
            svc.submit(Path::new("notes.txt"), None),
            Err(ScanError::UnsupportedFormat(_))
        ));
        assert!(svc.list(None, 10).is_empty());
    }

    #[test]
    fn test_invalid_params_rejected() {
        let svc = service(FakeOpener::new(1), number_every_frame());
        let params = ScanParams {
            sample_fps: -1.0,
            ..Default::default()
        };
        assert!(matches!(
            svc.submit(Path::new("clip.mp4"), Some(params)),
            Err(ScanError::Config(_))
        ));
    }

    #[test]
    fn test_oversized_time_budget_rejected() {
        let svc = service(FakeOpener::new(1), number_every_frame());
        let params = ScanParams {
            time_budget_secs: Some(1e30),
            ..Default::default()
        };
        assert!(matches!(
            svc.submit(Path::new("clip.mp4"), Some(params)),
            Err(ScanError::Config(_))
        ));
        assert!(svc.list(None, 10).is_empty());
    }

    #[test]
    fn test_open_failure_fails_task() {
        let svc = service(FakeOpener::new(1), number_every_frame());
        let id = svc.submit(Path::new("missing.mp4"), None).unwrap();

        let (events, task) = wait(&svc, id);
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task
            .error_message
            .as_deref()
            .unwrap()
            .starts_with("Cannot open video source"));
        assert!(matches!(events.last(), Some(TaskEvent::Failed { .. })));
        assert!(matches!(
            svc.results(id),
            Err(ScanError::TaskNotCompleted(TaskStatus::Failed))
        ));
    }

    #[test]
    fn test_decode_failure_releases_source() {
        let mut opener = FakeOpener::new(30);
        opener.fail_at = Some(12);
        let released = opener.released.clone();
        let svc = service(opener, number_every_frame());

        let id = svc.submit(Path::new("clip.mov"), None).unwrap();
        let (_, task) = wait(&svc, id);

        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error_message.unwrap().starts_with("Frame decode failed"));
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn test_panic_contained_at_job_boundary() {
        let svc = service(FakeOpener::new(5), number_every_frame());
        let bad = svc.submit(Path::new("explode.mp4"), None).unwrap();
        let good = svc.submit(Path::new("fine.mp4"), None).unwrap();

        let (_, bad_task) = wait(&svc, bad);
        assert_eq!(bad_task.status, TaskStatus::Failed);
        assert_eq!(
            bad_task.error_message.as_deref(),
            Some("worker panicked: decoder blew up")
        );

        let (_, good_task) = wait(&svc, good);
        assert_eq!(good_task.status, TaskStatus::Completed);
    }

    #[test]
    fn test_cancel_ends_failed() {
        let svc = service(FakeOpener::new(500), slow_engine());
        let id = svc.submit(Path::new("long.mkv"), None).unwrap();
        svc.cancel(id).unwrap();

        let (_, task) = wait(&svc, id);
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error_message.as_deref(), Some("cancelled"));
    }

    #[test]
    fn test_time_budget_ends_failed() {
        let svc = service(FakeOpener::new(100), slow_engine());
        let params = ScanParams {
            time_budget_secs: Some(0.0),
            ..Default::default()
        };
        let id = svc.submit(Path::new("long.mp4"), Some(params)).unwrap();

        let (_, task) = wait(&svc, id);
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error_message.unwrap().contains("Time budget"));
    }

    #[test]
    fn test_concurrent_jobs_are_isolated() {
        let svc = service(FakeOpener::new(10), number_every_frame());
        let ids: Vec<Uuid> = (0..4)
            .map(|n| svc.submit(Path::new(&format!("clip{n}.mp4")), None).unwrap())
            .collect();

        for id in &ids {
            let (_, task) = wait(&svc, *id);
            assert_eq!(task.status, TaskStatus::Completed);
            let results = svc.results(*id).unwrap();
            assert_eq!(results.len(), 1);
            assert_eq!(results[0].frame_count, 2);
        }

        assert_eq!(svc.list(Some(TaskStatus::Completed), 10).len(), 4);
        assert_eq!(svc.list(None, 2).len(), 2);
    }

    #[test]
    fn test_delete_and_unknown_ids() {
        let svc = service(FakeOpener::new(5), number_every_frame());
        let id = svc.submit(Path::new("clip.mp4"), None).unwrap();
        wait(&svc, id);

        assert_eq!(svc.delete(id).unwrap().id, id);
        assert!(matches!(svc.status(id), Err(ScanError::TaskNotFound(_))));
        assert!(matches!(svc.delete(id), Err(ScanError::TaskNotFound(_))));
        assert!(matches!(svc.subscribe(id), Err(ScanError::TaskNotFound(_))));
        assert!(matches!(svc.cancel(Uuid::new_v4()), Err(ScanError::TaskNotFound(_))));
    }

    #[test]
    fn test_scan_now_shares_pipeline() {
        let svc = service(FakeOpener::new(10), number_every_frame());
        let report = svc.scan_now(Path::new("clip.avi"), None).unwrap();

        assert_eq!(report.decoded_frames, 10);
        assert_eq!(report.sampled_frames, 2);
        assert_eq!(report.results.len(), 1);
        assert!(svc.list(None, 10).is_empty());
    }
}
