pub mod scanner;

pub use scanner::{scan_video, PhoneScanService};
