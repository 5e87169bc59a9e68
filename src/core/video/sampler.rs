use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::core::error::ScanError;
use crate::core::video::frame::Frame;
use crate::core::video::source::FrameSource;

/// 容器没有报告帧率时使用
pub const DEFAULT_FPS: f64 = 25.0;

/// `max(round(fps / target), 1)`
pub fn frame_interval(nominal_fps: f64, target_fps: f64) -> u64 {
    if !target_fps.is_finite() || target_fps <= 0.0 {
        return 1;
    }
    let interval = (nominal_fps / target_fps).round();
    if interval.is_finite() && interval >= 1.0 {
        interval as u64
    } else {
        1
    }
}

/// 取消标志 + 可选时间预算，每个采样帧检查一次
#[derive(Debug, Clone, Default)]
pub struct ScanControl {
    cancelled: Arc<AtomicBool>,
    budget: Option<Duration>,
}

impl ScanControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_budget(mut self, budget: Option<Duration>) -> Self {
        self.budget = budget;
        self
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn check(&self, started: Instant) -> Result<(), ScanError> {
        if self.is_cancelled() {
            return Err(ScanError::Cancelled);
        }
        if let Some(budget) = self.budget {
            if started.elapsed() > budget {
                return Err(ScanError::TimedOut(budget.as_secs_f64()));
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct SampledFrame {
    pub frame: Frame,
    /// 解码序号（从 0 开始，所有解码帧都计数）
    pub index: u64,
    /// 秒，`index / fps`
    pub timestamp: f64,
    /// 已采样帧数（从 1 开始）
    pub ordinal: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingPlan {
    pub fps: f64,
    pub interval: u64,
    pub total_frames: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerStats {
    pub decoded_frames: u64,
    pub sampled_frames: u64,
}

#[derive(Debug, Clone)]
pub struct FrameSampler {
    target_fps: f64,
    default_fps: f64,
}

impl FrameSampler {
    pub fn new(target_fps: f64) -> Self {
        Self {
            target_fps,
            default_fps: DEFAULT_FPS,
        }
    }

    pub fn with_default_fps(mut self, default_fps: f64) -> Self {
        self.default_fps = default_fps;
        self
    }

    pub fn plan(&self, source: &dyn FrameSource) -> SamplingPlan {
        let fps = source
            .nominal_fps()
            .filter(|fps| fps.is_finite() && *fps > 0.0)
            .unwrap_or(self.default_fps);

        SamplingPlan {
            fps,
            interval: frame_interval(fps, self.target_fps),
            total_frames: source.frame_count_hint(),
        }
    }

    /// 读完 `source`，每隔 `interval` 帧交给 `on_sampled` 处理
    ///
    /// 遇到流结束、解码错误、取消或超时即停止；回调的错误原样返回
    pub fn run<F>(
        &self,
        source: &mut dyn FrameSource,
        control: &ScanControl,
        mut on_sampled: F,
    ) -> Result<SamplerStats, ScanError>
    where
        F: FnMut(&SamplingPlan, SampledFrame) -> Result<(), ScanError>,
    {
        let plan = self.plan(source);
        info!(
            "🎥 Video info: {} FPS, {:?} total frames, sampling every {} frames",
            plan.fps, plan.total_frames, plan.interval
        );

        let started = Instant::now();
        let mut stats = SamplerStats {
            decoded_frames: 0,
            sampled_frames: 0,
        };

        while let Some(frame) = source.next_frame()? {
            let index = stats.decoded_frames;
            stats.decoded_frames += 1;

            if index % plan.interval != 0 {
                continue;
            }

            control.check(started)?;

            stats.sampled_frames += 1;
            on_sampled(
                &plan,
                SampledFrame {
                    frame,
                    index,
                    timestamp: index as f64 / plan.fps,
                    ordinal: stats.sampled_frames,
                },
            )?;
        }

        debug!(
            "📊 Sampler drained: {} decoded, {} sampled",
            stats.decoded_frames, stats.sampled_frames
        );
        Ok(stats)
    }
}
