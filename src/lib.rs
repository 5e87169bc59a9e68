pub mod api;
pub mod core;

pub use crate::api::scanner::{scan_video, PhoneScanService};
pub use crate::core::error::ScanError;

/// 初始化日志，重复调用无副作用（RUST_LOG 可覆盖默认 info 级别）
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .try_init();
}
