//! 视频帧来源
//!
//! 解码器对流水线只暴露三件事：名义帧率（可能缺失）、帧数提示、惰性的逐帧读取。
//! 打开失败（`SourceOpen`）和读取中途失败（`Decode`）是两种不同的错误。

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::core::error::ScanError;
use crate::core::video::frame::Frame;

/// 有限、不可重来的解码帧序列
pub trait FrameSource {
    /// 容器报告的帧率，缺失或为 0 时返回 `None`
    fn nominal_fps(&self) -> Option<f64>;

    /// 容器已知的总帧数
    fn frame_count_hint(&self) -> Option<u64>;

    /// `Ok(None)` 表示流结束
    fn next_frame(&mut self) -> Result<Option<Frame>, ScanError>;
}

pub trait FrameSourceOpener: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn FrameSource>, ScanError>;
}

/// 内存帧序列，主要用于测试和宿主自行解码的场景
pub struct MemoryFrameSource {
    frames: VecDeque<Frame>,
    fps: Option<f64>,
    total: u64,
    yielded: u64,
    fail_at: Option<u64>,
    released: Option<Arc<AtomicBool>>,
}

impl MemoryFrameSource {
    pub fn new(frames: Vec<Frame>, fps: Option<f64>) -> Self {
        Self {
            total: frames.len() as u64,
            frames: frames.into(),
            fps,
            yielded: 0,
            fail_at: None,
            released: None,
        }
    }

    /// 在第 `index` 帧处返回 `Decode` 错误
    pub fn failing_at(mut self, index: u64) -> Self {
        self.fail_at = Some(index);
        self
    }

    /// 释放时置位
    pub fn with_release_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.released = Some(flag);
        self
    }
}

impl FrameSource for MemoryFrameSource {
    fn nominal_fps(&self) -> Option<f64> {
        self.fps.filter(|fps| fps.is_finite() && *fps > 0.0)
    }

    fn frame_count_hint(&self) -> Option<u64> {
        Some(self.total)
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, ScanError> {
        if self.fail_at == Some(self.yielded) {
            return Err(ScanError::Decode(format!(
                "corrupt packet at frame {}",
                self.yielded
            )));
        }
        let frame = self.frames.pop_front();
        if frame.is_some() {
            self.yielded += 1;
        }
        Ok(frame)
    }
}

impl Drop for MemoryFrameSource {
    fn drop(&mut self) {
        if let Some(flag) = &self.released {
            flag.store(true, Ordering::SeqCst);
        }
    }
}

#[cfg(feature = "ffmpeg")]
pub use self::ffmpeg_source::{FfmpegFrameSource, FfmpegOpener};

#[cfg(feature = "ffmpeg")]
mod ffmpeg_source {
    use std::path::{Path, PathBuf};

    use ffmpeg_next as ffmpeg;
    use log::{debug, info};

    use super::{FrameSource, FrameSourceOpener};
    use crate::core::error::ScanError;
    use crate::core::video::frame::Frame;

    /// 基于 ffmpeg-next 的逐包解码，输出 RGBA 帧
    pub struct FfmpegFrameSource {
        path: PathBuf,
        input: ffmpeg::format::context::Input,
        decoder: ffmpeg::decoder::Video,
        scaler: ffmpeg::software::scaling::Context,
        stream_index: usize,
        fps: Option<f64>,
        frame_hint: Option<u64>,
        decoded: ffmpeg::util::frame::video::Video,
        converted: ffmpeg::util::frame::video::Video,
        frame_number: u64,
        eof_sent: bool,
    }

    impl FfmpegFrameSource {
        pub fn open(path: &Path) -> Result<Self, ScanError> {
            ffmpeg::init().map_err(|e| ScanError::SourceOpen(format!("ffmpeg init: {e}")))?;

            let input = ffmpeg::format::input(&path)
                .map_err(|e| ScanError::SourceOpen(format!("{}: {e}", path.display())))?;

            let stream = input
                .streams()
                .best(ffmpeg::media::Type::Video)
                .ok_or_else(|| {
                    ScanError::SourceOpen(format!("{}: no video stream", path.display()))
                })?;

            let stream_index = stream.index();
            let rate = stream.avg_frame_rate();
            let fps = if rate.numerator() > 0 && rate.denominator() > 0 {
                Some(f64::from(rate.numerator()) / f64::from(rate.denominator()))
            } else {
                None
            };
            let frame_hint = u64::try_from(stream.frames()).ok().filter(|n| *n > 0);

            let decoder = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
                .map_err(|e| ScanError::SourceOpen(format!("codec context: {e}")))?
                .decoder()
                .video()
                .map_err(|e| ScanError::SourceOpen(format!("video decoder: {e}")))?;

            let scaler = ffmpeg::software::scaling::Context::get(
                decoder.format(),
                decoder.width(),
                decoder.height(),
                ffmpeg::format::Pixel::RGBA,
                decoder.width(),
                decoder.height(),
                ffmpeg::software::scaling::Flags::BILINEAR,
            )
            .map_err(|e| ScanError::SourceOpen(format!("scaler: {e}")))?;

            info!(
                "🎬 Opened {} ({}x{}, fps {:?}, frames {:?})",
                path.display(),
                decoder.width(),
                decoder.height(),
                fps,
                frame_hint
            );

            Ok(Self {
                path: path.to_path_buf(),
                input,
                decoder,
                scaler,
                stream_index,
                fps,
                frame_hint,
                decoded: ffmpeg::util::frame::video::Video::empty(),
                converted: ffmpeg::util::frame::video::Video::empty(),
                frame_number: 0,
                eof_sent: false,
            })
        }

        fn convert(&mut self) -> Result<Frame, ScanError> {
            self.scaler
                .run(&self.decoded, &mut self.converted)
                .map_err(|e| ScanError::Decode(format!("frame {}: {e}", self.frame_number)))?;

            let width = self.converted.width();
            let height = self.converted.height();
            let stride = self.converted.stride(0);
            let plane = self.converted.data(0);
            let row_len = width as usize * 4;

            let mut data = Vec::with_capacity(row_len * height as usize);
            for y in 0..height as usize {
                let start = y * stride;
                data.extend_from_slice(&plane[start..start + row_len]);
            }

            let frame = Frame::new(width, height, data, self.frame_number);
            self.frame_number += 1;
            Ok(frame)
        }
    }

    impl FrameSource for FfmpegFrameSource {
        fn nominal_fps(&self) -> Option<f64> {
            self.fps
        }

        fn frame_count_hint(&self) -> Option<u64> {
            self.frame_hint
        }

        fn next_frame(&mut self) -> Result<Option<Frame>, ScanError> {
            loop {
                let received = self.decoder.receive_frame(&mut self.decoded);
                match classify_receive(received, self.frame_number)? {
                    Receive::Frame => return self.convert().map(Some),
                    Receive::Drained => return Ok(None),
                    Receive::NeedInput if self.eof_sent => return Ok(None),
                    Receive::NeedInput => {}
                }

                let mut packet = ffmpeg::Packet::empty();
                match packet.read(&mut self.input) {
                    Ok(()) => {
                        if packet.stream() != self.stream_index {
                            continue;
                        }
                        self.decoder.send_packet(&packet).map_err(|e| {
                            ScanError::Decode(format!("packet near frame {}: {e}", self.frame_number))
                        })?;
                    }
                    Err(ffmpeg::Error::Eof) => {
                        debug!("📼 Demuxer drained, flushing decoder");
                        self.decoder
                            .send_eof()
                            .map_err(|e| ScanError::Decode(format!("flush: {e}")))?;
                        self.eof_sent = true;
                    }
                    Err(e) => {
                        return Err(ScanError::Decode(format!(
                            "read near frame {}: {e}",
                            self.frame_number
                        )))
                    }
                }
            }
        }
    }

    #[derive(Debug, PartialEq)]
    enum Receive {
        Frame,
        NeedInput,
        Drained,
    }

    /// 解码器的 EAGAIN / EOF 是正常流程，其余错误终止整个流
    fn classify_receive(
        result: Result<(), ffmpeg::Error>,
        frame_number: u64,
    ) -> Result<Receive, ScanError> {
        match result {
            Ok(()) => Ok(Receive::Frame),
            Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::util::error::EAGAIN => {
                Ok(Receive::NeedInput)
            }
            Err(ffmpeg::Error::Eof) => Ok(Receive::Drained),
            Err(e) => Err(ScanError::Decode(format!("frame {frame_number}: {e}"))),
        }
    }

    impl Drop for FfmpegFrameSource {
        fn drop(&mut self) {
            info!(
                "🔒 Released video source {} after {} frames",
                self.path.display(),
                self.frame_number
            );
        }
    }

    #[derive(Debug, Default, Clone, Copy)]
    pub struct FfmpegOpener;

    impl FrameSourceOpener for FfmpegOpener {
        fn open(&self, path: &Path) -> Result<Box<dyn FrameSource>, ScanError> {
            Ok(Box::new(FfmpegFrameSource::open(path)?))
        }
    }

}
