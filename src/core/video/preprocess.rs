//! OCR 前的帧预处理：灰度 → 分块对比度均衡 (CLAHE) → 自适应高斯二值化 → 形态学开运算

use image::GrayImage;
use imageproc::distance_transform::Norm;
use imageproc::filter::gaussian_blur_f32;
use imageproc::morphology;

use crate::core::error::ScanError;
use crate::core::video::frame::Frame;

#[derive(Debug, Clone)]
pub struct PreprocessConfig {
    /// CLAHE 分块网格（列, 行）
    pub tile_grid: (u32, u32),
    pub clip_limit: f32,
    /// 自适应阈值邻域大小（奇数）
    pub block_size: u32,
    /// 从邻域加权均值中减去的偏置
    pub bias: f32,
    /// 开运算半径，0 即 1x1 结构元素（不改变图像）
    pub open_radius: u8,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            tile_grid: (8, 8),
            clip_limit: 2.0,
            block_size: 31,
            bias: 9.0,
            open_radius: 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Preprocessor {
    config: PreprocessConfig,
}

impl Preprocessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: PreprocessConfig) -> Self {
        Self { config }
    }

    pub fn preprocess(&self, frame: &Frame) -> Result<GrayImage, ScanError> {
        frame.validate()?;

        let gray = GrayImage::from_raw(frame.width, frame.height, frame.to_luma()).ok_or_else(
            || ScanError::Decode(format!("frame {}: luminance buffer mismatch", frame.frame_number)),
        )?;

        let (tiles_x, tiles_y) = self.config.tile_grid;
        let equalized = equalize_tiles(&gray, tiles_x, tiles_y, self.config.clip_limit);
        let binary = adaptive_threshold(&equalized, self.config.block_size, self.config.bias);

        Ok(morphology::open(&binary, Norm::LInf, self.config.open_radius))
    }
}

/// 限制对比度的自适应直方图均衡，相邻分块查找表之间双线性插值
fn equalize_tiles(gray: &GrayImage, tiles_x: u32, tiles_y: u32, clip_limit: f32) -> GrayImage {
    let (w, h) = gray.dimensions();
    let tile_w = w.div_ceil(tiles_x.clamp(1, w));
    let tile_h = h.div_ceil(tiles_y.clamp(1, h));
    let tiles_x = w.div_ceil(tile_w) as usize;
    let tiles_y = h.div_ceil(tile_h) as usize;

    let mut luts = Vec::with_capacity(tiles_x * tiles_y);
    for ty in 0..tiles_y as u32 {
        for tx in 0..tiles_x as u32 {
            let x0 = tx * tile_w;
            let y0 = ty * tile_h;
            let x1 = (x0 + tile_w).min(w);
            let y1 = (y0 + tile_h).min(h);
            luts.push(tile_lut(gray, x0, y0, x1, y1, clip_limit));
        }
    }

    let mut out = GrayImage::new(w, h);
    for y in 0..h {
        let gy = (y as f32 + 0.5) / tile_h as f32 - 0.5;
        let ty0 = (gy.floor().max(0.0) as usize).min(tiles_y - 1);
        let ty1 = (ty0 + 1).min(tiles_y - 1);
        let ay = (gy - ty0 as f32).clamp(0.0, 1.0);

        for x in 0..w {
            let gx = (x as f32 + 0.5) / tile_w as f32 - 0.5;
            let tx0 = (gx.floor().max(0.0) as usize).min(tiles_x - 1);
            let tx1 = (tx0 + 1).min(tiles_x - 1);
            let ax = (gx - tx0 as f32).clamp(0.0, 1.0);

            let v = gray.get_pixel(x, y)[0] as usize;
            let top = (1.0 - ax) * luts[ty0 * tiles_x + tx0][v] as f32
                + ax * luts[ty0 * tiles_x + tx1][v] as f32;
            let bottom = (1.0 - ax) * luts[ty1 * tiles_x + tx0][v] as f32
                + ax * luts[ty1 * tiles_x + tx1][v] as f32;
            let value = (1.0 - ay) * top + ay * bottom;

            out.put_pixel(x, y, image::Luma([value.round().clamp(0.0, 255.0) as u8]));
        }
    }
    out
}

fn tile_lut(gray: &GrayImage, x0: u32, y0: u32, x1: u32, y1: u32, clip_limit: f32) -> [u8; 256] {
    let mut hist = [0u32; 256];
    for y in y0..y1 {
        for x in x0..x1 {
            hist[gray.get_pixel(x, y)[0] as usize] += 1;
        }
    }

    let area = (x1 - x0) * (y1 - y0);
    let mut lut = [0u8; 256];
    if area == 0 {
        for (i, slot) in lut.iter_mut().enumerate() {
            *slot = i as u8;
        }
        return lut;
    }

    let clip = ((clip_limit * area as f32 / 256.0) as u32).max(1);
    let mut excess = 0u32;
    for bin in hist.iter_mut() {
        if *bin > clip {
            excess += *bin - clip;
            *bin = clip;
        }
    }
    let spread = excess / 256;
    let residual = (excess % 256) as usize;
    for (i, bin) in hist.iter_mut().enumerate() {
        *bin += spread + u32::from(i < residual);
    }

    let mut cdf = 0u32;
    for (i, bin) in hist.iter().enumerate() {
        cdf += bin;
        lut[i] = ((cdf as f32 * 255.0 / area as f32).round()).min(255.0) as u8;
    }
    lut
}

/// 高斯加权局部阈值：`pixel > mean - bias` 为白色
fn adaptive_threshold(gray: &GrayImage, block_size: u32, bias: f32) -> GrayImage {
    // sigma derived from the kernel size the same way OpenCV does
    let sigma = 0.3 * ((block_size.max(3) as f32 - 1.0) * 0.5 - 1.0) + 0.8;
    let mean = gaussian_blur_f32(gray, sigma);

    let mut out = GrayImage::new(gray.width(), gray.height());
    for (x, y, pixel) in gray.enumerate_pixels() {
        let threshold = mean.get_pixel(x, y)[0] as f32 - bias;
        let value = if pixel[0] as f32 > threshold { 255 } else { 0 };
        out.put_pixel(x, y, image::Luma([value]));
    }
    out
}
