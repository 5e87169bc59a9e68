pub mod frame;
pub mod preprocess;
pub mod sampler;
pub mod source;

pub use frame::Frame;
pub use preprocess::{PreprocessConfig, Preprocessor};
pub use sampler::{frame_interval, FrameSampler, SampledFrame, ScanControl, DEFAULT_FPS};
pub use source::{FrameSource, FrameSourceOpener, MemoryFrameSource};

#[cfg(feature = "ffmpeg")]
pub use source::{FfmpegFrameSource, FfmpegOpener};
