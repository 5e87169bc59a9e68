//! Tesseract 适配（leptess）

use std::cell::RefCell;
use std::io::Cursor;

use image::GrayImage;
use leptess::{LepTess, Variable};
use log::debug;

use crate::core::error::ScanError;
use crate::core::ocr::recognizer::{parse_tsv, OcrEngine, OcrMode, WordToken};

thread_local! {
    // 每个工作线程复用一个 Tesseract 句柄，按 (data_path, 语言, psm) 区分
    static HANDLE: RefCell<Option<(HandleKey, LepTess)>> = const { RefCell::new(None) };
}

type HandleKey = (Option<String>, String, u32);

#[derive(Debug, Clone, Default)]
pub struct TesseractEngine {
    data_path: Option<String>,
}

impl TesseractEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data_path(data_path: Option<String>) -> Self {
        Self { data_path }
    }

    fn init(&self, mode: &OcrMode) -> Result<LepTess, ScanError> {
        // LepTess::new 使用 OEM_DEFAULT，即 legacy + LSTM 组合
        let mut lt = LepTess::new(self.data_path.as_deref(), &mode.language).map_err(|e| {
            ScanError::Recognition(format!(
                "Failed to initialize Tesseract with language '{}': {}",
                mode.language, e
            ))
        })?;
        lt.set_variable(
            Variable::TesseditPagesegMode,
            &mode.page_segmentation.to_string(),
        )
        .map_err(|e| ScanError::Recognition(format!("Failed to set PSM: {}", e)))?;

        debug!(
            "🔤 Tesseract ready: lang={}, psm={}, oem={}",
            mode.language, mode.page_segmentation, mode.engine_mode
        );
        Ok(lt)
    }
}

impl OcrEngine for TesseractEngine {
    fn recognize(&self, image: &GrayImage, mode: &OcrMode) -> Result<Vec<WordToken>, ScanError> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(ScanError::Recognition(format!(
                "empty image {}x{}",
                width, height
            )));
        }

        let mut png = Cursor::new(Vec::new());
        image
            .write_to(&mut png, image::ImageFormat::Png)
            .map_err(|e| ScanError::Recognition(format!("Failed to encode image: {}", e)))?;

        let key: HandleKey = (
            self.data_path.clone(),
            mode.language.clone(),
            mode.page_segmentation,
        );

        HANDLE.with(|cell| {
            let mut slot = cell.borrow_mut();
            if !matches!(slot.as_ref(), Some((k, _)) if *k == key) {
                *slot = Some((key, self.init(mode)?));
            }
            let Some((_, lt)) = slot.as_mut() else {
                return Ok(Vec::new());
            };

            lt.set_image_from_mem(png.get_ref())
                .map_err(|e| ScanError::Recognition(format!("Failed to set image: {}", e)))?;

            let tsv = lt
                .get_tsv_text(0)
                .map_err(|e| ScanError::Recognition(format!("TSV output not UTF-8: {}", e)))?;

            Ok(parse_tsv(&tsv))
        })
    }
}
