use crate::core::error::ScanError;

/// 解码后的帧（RGBA），只在处理单个采样帧期间存在
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>, // RGBA 格式
    pub frame_number: u64,
}

impl Frame {
    pub fn new(width: u32, height: u32, data: Vec<u8>, frame_number: u64) -> Self {
        Self {
            width,
            height,
            data,
            frame_number,
        }
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// 尺寸与数据长度一致才可进入流水线
    pub fn validate(&self) -> Result<(), ScanError> {
        if self.width == 0 || self.height == 0 {
            return Err(ScanError::Decode(format!(
                "frame {} has empty dimensions {}x{}",
                self.frame_number, self.width, self.height
            )));
        }
        let expected = self.pixel_count() * 4;
        if self.data.len() != expected {
            return Err(ScanError::Decode(format!(
                "frame {} carries {} bytes, expected {} for {}x{} RGBA",
                self.frame_number,
                self.data.len(),
                expected,
                self.width,
                self.height
            )));
        }
        Ok(())
    }

    /// RGB 转灰度（BT.601 整数权重）
    pub fn to_luma(&self) -> Vec<u8> {
        self.data
            .chunks_exact(4)
            .map(|rgba| {
                let r = rgba[0] as u32;
                let g = rgba[1] as u32;
                let b = rgba[2] as u32;
                ((r * 299 + g * 587 + b * 114) / 1000) as u8
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_creation() {
        let data = vec![255u8; 100 * 100 * 4];
        let frame = Frame::new(100, 100, data, 30);

        assert_eq!(frame.pixel_count(), 10000);
        assert_eq!(frame.frame_number, 30);
        assert!(frame.validate().is_ok());
    }

    #[test]
    fn test_malformed_frame_is_decode_error() {
        let frame = Frame::new(10, 10, vec![0u8; 12], 3);
        assert!(matches!(frame.validate(), Err(ScanError::Decode(_))));

        let empty = Frame::new(0, 10, vec![], 4);
        assert!(matches!(empty.validate(), Err(ScanError::Decode(_))));
    }

    #[test]
    fn test_luma_weights() {
        let frame = Frame::new(2, 1, vec![255, 255, 255, 255, 255, 0, 0, 255], 0);
        assert_eq!(frame.to_luma(), vec![255, 76]);
    }
}
