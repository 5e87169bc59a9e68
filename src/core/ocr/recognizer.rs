use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use image::GrayImage;
use log::{debug, warn};

use crate::core::error::ScanError;

/// 识别出的单词及其版面位置
#[derive(Debug, Clone, PartialEq)]
pub struct WordToken {
    pub text: String,
    /// 0-100，Tesseract 的置信度刻度
    pub confidence: f32,
    pub block: u32,
    pub paragraph: u32,
    pub line: u32,
}

impl WordToken {
    pub fn new(text: &str, confidence: f32, (block, paragraph, line): (u32, u32, u32)) -> Self {
        Self {
            text: text.to_string(),
            confidence,
            block,
            paragraph,
            line,
        }
    }

    fn line_key(&self) -> (u32, u32, u32) {
        (self.block, self.paragraph, self.line)
    }
}

/// 每次调用固定使用的识别模式
#[derive(Debug, Clone, PartialEq)]
pub struct OcrMode {
    pub language: String,
    /// 6 = 单个统一文本块
    pub page_segmentation: u32,
    /// 3 = 传统引擎 + LSTM
    pub engine_mode: u32,
}

impl Default for OcrMode {
    fn default() -> Self {
        Self {
            language: "eng".to_string(),
            page_segmentation: 6,
            engine_mode: 3,
        }
    }
}

pub trait OcrEngine: Send + Sync {
    /// 没有识别结果时返回空列表
    fn recognize(&self, image: &GrayImage, mode: &OcrMode) -> Result<Vec<WordToken>, ScanError>;
}

/// 一行识别文本（非空）
#[derive(Debug, Clone, PartialEq)]
pub struct TextBlock {
    pub text: String,
    pub block: u32,
    pub paragraph: u32,
    pub line: u32,
}

pub struct TextRecognizer {
    engine: Arc<dyn OcrEngine>,
    mode: OcrMode,
}

impl TextRecognizer {
    pub fn new(engine: Arc<dyn OcrEngine>) -> Self {
        Self {
            engine,
            mode: OcrMode::default(),
        }
    }

    pub fn with_mode(mut self, mode: OcrMode) -> Self {
        self.mode = mode;
        self
    }

    /// 引擎出错时视为本帧无文字，不中断任务
    pub fn recognize(&self, image: &GrayImage, confidence_floor: f32) -> Vec<TextBlock> {
        match self.engine.recognize(image, &self.mode) {
            Ok(tokens) => group_lines(tokens, confidence_floor),
            Err(e) => {
                warn!("⚠️ OCR failed on frame, treating as empty: {}", e);
                Vec::new()
            }
        }
    }
}

/// 丢弃低于置信度下限的单词，其余按 (block, paragraph, line) 拼成行
pub fn group_lines(tokens: Vec<WordToken>, confidence_floor: f32) -> Vec<TextBlock> {
    let mut lines: BTreeMap<(u32, u32, u32), Vec<String>> = BTreeMap::new();

    for token in tokens {
        if token.confidence < confidence_floor {
            continue;
        }
        lines.entry(token.line_key()).or_default().push(token.text);
    }

    lines
        .into_iter()
        .filter_map(|((block, paragraph, line), words)| {
            let text = words.join(" ").trim().to_string();
            if text.is_empty() {
                None
            } else {
                Some(TextBlock {
                    text,
                    block,
                    paragraph,
                    line,
                })
            }
        })
        .collect()
}

/// 逐行文本 + 换行拼接后的整页文本（去重）。
/// 跨行断开的号码只能在整页文本中找到
pub fn texts_to_scan(blocks: &[TextBlock]) -> Vec<String> {
    if blocks.is_empty() {
        return Vec::new();
    }

    let mut texts: Vec<String> = Vec::with_capacity(blocks.len() + 1);
    for block in blocks {
        if !texts.contains(&block.text) {
            texts.push(block.text.clone());
        }
    }

    let joined = blocks
        .iter()
        .map(|b| b.text.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    if !texts.contains(&joined) {
        texts.push(joined);
    }
    texts
}

/// 解析 Tesseract TSV 输出，只保留单词级 (level 5) 的行
///
/// 列：level page block par line word left top width height conf text
/// 表头行的数字列无法解析，自然被跳过
pub fn parse_tsv(tsv: &str) -> Vec<WordToken> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .flexible(true)
        .quoting(false)
        .from_reader(tsv.as_bytes());

    let mut tokens = Vec::new();
    for record in reader.records() {
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                debug!("skipping unreadable TSV row: {}", e);
                continue;
            }
        };

        let field = |i: usize| record.get(i).map(str::trim);
        let Some(level) = field(0).and_then(|v| v.parse::<u32>().ok()) else {
            continue;
        };
        if level != 5 {
            continue;
        }

        let (Some(block), Some(paragraph), Some(line)) = (
            field(2).and_then(|v| v.parse::<u32>().ok()),
            field(3).and_then(|v| v.parse::<u32>().ok()),
            field(4).and_then(|v| v.parse::<u32>().ok()),
        ) else {
            continue;
        };

        // 非数字置信度按 -1 处理，和 Tesseract 自身对非文字行的标记一致
        let confidence = field(10)
            .and_then(|v| v.parse::<f32>().ok())
            .unwrap_or(-1.0);
        let text = record.get(11).unwrap_or("").to_string();

        tokens.push(WordToken {
            text,
            confidence,
            block,
            paragraph,
            line,
        });
    }
    tokens
}

type Script = Box<dyn Fn(u64) -> Result<Vec<WordToken>, ScanError> + Send + Sync>;

/// 按调用次序返回预设结果的 OCR 引擎（测试和无 Tesseract 环境使用）
///
/// 第 n 次调用（从 0 开始）对应任务的第 n 个采样帧
pub struct ScriptedOcrEngine {
    script: Script,
    calls: AtomicU64,
}

impl ScriptedOcrEngine {
    pub fn new() -> Self {
        Self::with_script(|_| Ok(Vec::new()))
    }

    pub fn with_script<F>(script: F) -> Self
    where
        F: Fn(u64) -> Result<Vec<WordToken>, ScanError> + Send + Sync + 'static,
    {
        Self {
            script: Box::new(script),
            calls: AtomicU64::new(0),
        }
    }

    /// 第 `n` 次调用返回 `pages[n]`，之后返回空
    pub fn with_pages(pages: Vec<Vec<&str>>) -> Self {
        let pages: Vec<Vec<WordToken>> = pages
            .into_iter()
            .map(|lines| tokens_for_lines(&lines, 90.0))
            .collect();
        Self::with_script(move |call| Ok(pages.get(call as usize).cloned().unwrap_or_default()))
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for ScriptedOcrEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl OcrEngine for ScriptedOcrEngine {
    fn recognize(&self, _image: &GrayImage, _mode: &OcrMode) -> Result<Vec<WordToken>, ScanError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        (self.script)(call)
    }
}

/// 按空白拆分每一行，同一行的单词共享行号
pub fn tokens_for_lines(lines: &[&str], confidence: f32) -> Vec<WordToken> {
    lines
        .iter()
        .enumerate()
        .flat_map(|(n, line)| {
            line.split_whitespace()
                .map(move |word| WordToken::new(word, confidence, (1, 1, n as u32 + 1)))
        })
        .collect()
}
