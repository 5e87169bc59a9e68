//! 单任务流水线：采样 → 预处理 → OCR → 号码提取 → 聚合
//!
//! 后台任务和同步扫描共用这一份实现，只是进度观察者不同。

use std::sync::Arc;

use log::{debug, info, warn};
use serde::Serialize;

use crate::core::aggregate::{Aggregator, ResultRecord};
use crate::core::config::ScanParams;
use crate::core::error::ScanError;
use crate::core::ocr::recognizer::{texts_to_scan, OcrEngine, TextRecognizer};
use crate::core::phone::extractor::{CandidateExtractor, PhoneCandidate};
use crate::core::phone::validator::PhoneValidator;
use crate::core::task::lifecycle::TaskController;
use crate::core::video::frame::Frame;
use crate::core::video::preprocess::Preprocessor;
use crate::core::video::sampler::{FrameSampler, ScanControl};
use crate::core::video::source::FrameSource;

pub trait ProgressObserver {
    fn on_progress(&self, current_frame: u64, total_frames: u64, message: &str);
}

impl<F> ProgressObserver for F
where
    F: Fn(u64, u64, &str),
{
    fn on_progress(&self, current_frame: u64, total_frames: u64, message: &str) {
        self(current_frame, total_frames, message)
    }
}

impl ProgressObserver for TaskController {
    fn on_progress(&self, current_frame: u64, total_frames: u64, message: &str) {
        match self.report_progress(current_frame, total_frames, message) {
            Ok(progress) => info!("📈 Progress: {}% - {}", progress, message),
            Err(e) => warn!("⚠️ Progress update for {} dropped: {}", self.task_id(), e),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanReport {
    pub fps: f64,
    pub interval: u64,
    pub total_frames: Option<u64>,
    pub decoded_frames: u64,
    pub sampled_frames: u64,
    pub results: Vec<ResultRecord>,
}

pub struct PhonePipeline {
    preprocessor: Preprocessor,
    recognizer: TextRecognizer,
    extractor: CandidateExtractor,
    params: ScanParams,
}

impl PhonePipeline {
    pub fn new(
        ocr: Arc<dyn OcrEngine>,
        validator: Arc<dyn PhoneValidator>,
        params: ScanParams,
    ) -> Self {
        Self {
            preprocessor: Preprocessor::new(),
            recognizer: TextRecognizer::new(ocr),
            extractor: CandidateExtractor::new(validator).with_best_effort(params.allow_best_effort),
            params,
        }
    }

    pub fn with_preprocessor(mut self, preprocessor: Preprocessor) -> Self {
        self.preprocessor = preprocessor;
        self
    }

    pub fn params(&self) -> &ScanParams {
        &self.params
    }

    /// 单个采样帧中的候选号码，只有帧数据损坏才返回错误
    pub fn process_frame(&self, frame: &Frame) -> Result<Vec<PhoneCandidate>, ScanError> {
        let image = self.preprocessor.preprocess(frame)?;
        let blocks = self.recognizer.recognize(&image, self.params.min_confidence);

        if !blocks.is_empty() {
            debug!(
                "📝 Frame {}: Found {} text lines",
                frame.frame_number,
                blocks.len()
            );
            for block in blocks.iter().take(2) {
                debug!("   Text: {}", block.text);
            }
        }

        let mut candidates = Vec::new();
        for text in texts_to_scan(&blocks) {
            candidates.extend(self.extractor.extract(&text, &self.params.region));
        }
        Ok(candidates)
    }

    pub fn run(
        &self,
        source: &mut dyn FrameSource,
        observer: &dyn ProgressObserver,
        control: &ScanControl,
    ) -> Result<ScanReport, ScanError> {
        let sampler = FrameSampler::new(self.params.sample_fps)
            .with_default_fps(self.params.default_fps);
        let plan = sampler.plan(source);
        let total = plan.total_frames.unwrap_or(0);
        let every = self.params.progress_every.max(1);

        observer.on_progress(0, total, "Starting video processing...");

        let mut aggregator = Aggregator::new();
        let stats = sampler.run(source, control, |_, sampled| {
            let candidates = self.process_frame(&sampled.frame)?;

            if sampled.ordinal == 1 || sampled.ordinal % every == 0 {
                let message = format!(
                    "Processing frame {}/{} (Time: {:.1}s)",
                    sampled.index, total, sampled.timestamp
                );
                observer.on_progress(sampled.index, total, &message);
            }

            if !candidates.is_empty() {
                debug!(
                    "   Found {} phone numbers in frame {}",
                    candidates.len(),
                    sampled.index
                );
            }
            aggregator.ingest(&candidates, sampled.index, sampled.timestamp);
            Ok(())
        })?;

        let results = aggregator.finalize(self.extractor.validator().as_ref());
        info!(
            "✅ Processed {} of {} decoded frames, {} unique phone numbers",
            stats.sampled_frames,
            stats.decoded_frames,
            results.len()
        );

        Ok(ScanReport {
            fps: plan.fps,
            interval: plan.interval,
            total_frames: plan.total_frames,
            decoded_frames: stats.decoded_frames,
            sampled_frames: stats.sampled_frames,
            results,
        })
    }
}
