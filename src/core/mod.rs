pub mod aggregate;
pub mod config;
pub mod error;
pub mod ocr;
pub mod phone;
pub mod pipeline;
pub mod task;
pub mod video;
