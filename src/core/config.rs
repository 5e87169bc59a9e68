//! 扫描参数与服务配置，支持 JSON5 文件加载

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::error::ScanError;
use crate::core::phone::region::Region;
use crate::core::video::sampler::DEFAULT_FPS;

/// 单个任务的扫描参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanParams {
    pub region: Region,
    /// 每秒分析的帧数
    pub sample_fps: f64,
    /// OCR 最低置信度 (0-100)
    pub min_confidence: f32,
    /// 接受未通过校验、仅符合手机号前缀的匹配
    /// 提高受损字幕的召回率，误报率相应上升
    pub allow_best_effort: bool,
    /// 每 N 个采样帧上报一次进度（第一帧也上报）
    pub progress_every: u64,
    /// 墙钟时间预算（秒）
    pub time_budget_secs: Option<f64>,
    /// 容器没有帧率信息时使用
    pub default_fps: f64,
}

impl Default for ScanParams {
    fn default() -> Self {
        Self {
            region: Region::default(),
            sample_fps: 4.0,
            min_confidence: 55.0,
            allow_best_effort: true,
            progress_every: 5,
            time_budget_secs: None,
            default_fps: DEFAULT_FPS,
        }
    }
}

impl ScanParams {
    pub fn for_fast_scan() -> Self {
        Self {
            sample_fps: 2.0,
            min_confidence: 60.0,
            progress_every: 10,
            ..Default::default()
        }
    }

    pub fn for_thorough_scan() -> Self {
        Self {
            sample_fps: 10.0,
            min_confidence: 40.0,
            progress_every: 5,
            ..Default::default()
        }
    }

    /// 未设置或超出 `Duration` 范围时为 `None`，后者会被 `validate` 拒绝
    pub fn time_budget(&self) -> Option<Duration> {
        self.time_budget_secs
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }

    pub fn validate(&self) -> Result<(), ScanError> {
        if !self.sample_fps.is_finite() || self.sample_fps <= 0.0 {
            return Err(ScanError::Config(format!(
                "sample_fps must be positive, got {}",
                self.sample_fps
            )));
        }
        if !(0.0..=100.0).contains(&self.min_confidence) {
            return Err(ScanError::Config(format!(
                "min_confidence must be within 0-100, got {}",
                self.min_confidence
            )));
        }
        if self.progress_every == 0 {
            return Err(ScanError::Config("progress_every must be at least 1".into()));
        }
        if !self.default_fps.is_finite() || self.default_fps <= 0.0 {
            return Err(ScanError::Config(format!(
                "default_fps must be positive, got {}",
                self.default_fps
            )));
        }
        if let Some(budget) = self.time_budget_secs {
            if Duration::try_from_secs_f64(budget).is_err() {
                return Err(ScanError::Config(format!(
                    "time_budget_secs must be a non-negative duration, got {}",
                    budget
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// 并发任务数
    pub workers: usize,
    pub defaults: ScanParams,
    /// 允许的视频扩展名（小写，不带点）
    pub allowed_extensions: Vec<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get().clamp(1, 4),
            defaults: ScanParams::default(),
            allowed_extensions: ["mp4", "avi", "mov", "mkv"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl ServiceConfig {
    pub fn from_json5(text: &str) -> Result<Self, ScanError> {
        let config: ServiceConfig =
            json5::from_str(text).map_err(|e| ScanError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ScanError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json5(&text)
    }

    pub fn validate(&self) -> Result<(), ScanError> {
        if self.workers == 0 {
            return Err(ScanError::Config("workers must be at least 1".into()));
        }
        if self.allowed_extensions.is_empty() {
            return Err(ScanError::Config("allowed_extensions is empty".into()));
        }
        self.defaults.validate()
    }

    /// 扩展名检查，不区分大小写
    pub fn check_extension(&self, path: &Path) -> Result<(), ScanError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);

        match ext {
            Some(ext) if self.allowed_extensions.iter().any(|a| a.eq_ignore_ascii_case(&ext)) => {
                Ok(())
            }
            _ => Err(ScanError::UnsupportedFormat(format!(
                "{}: only video files ({}) are allowed",
                path.display(),
                self.allowed_extensions.join(", ")
            ))),
        }
    }
}
