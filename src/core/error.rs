use thiserror::Error;

use crate::core::task::state::TaskStatus;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Cannot open video source: {0}")]
    SourceOpen(String),
    #[error("Frame decode failed: {0}")]
    Decode(String),
    #[error("Text recognition failed: {0}")]
    Recognition(String),
    #[error("Candidate extraction failed: {0}")]
    Extraction(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Unsupported video format: {0}")]
    UnsupportedFormat(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("cancelled")]
    Cancelled,
    #[error("Time budget of {0:.1}s exceeded")]
    TimedOut(f64),
    #[error("Invalid task transition: {from:?} -> {to:?}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },
    #[error("Task not found: {0}")]
    TaskNotFound(String),
    #[error("Task is not completed yet. Current status: {0:?}")]
    TaskNotCompleted(TaskStatus),
}

pub type Result<T> = std::result::Result<T, ScanError>;
