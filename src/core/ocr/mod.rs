pub mod recognizer;
#[cfg(feature = "tesseract")]
pub mod tesseract;

pub use recognizer::{
    group_lines, parse_tsv, texts_to_scan, tokens_for_lines, OcrEngine, OcrMode, ScriptedOcrEngine,
    TextBlock, TextRecognizer, WordToken,
};

#[cfg(feature = "tesseract")]
pub use tesseract::TesseractEngine;
