//! 跨帧号码聚合
//!
//! 以规范号码为键的登记表，每个任务独占一份，只被该任务的流水线顺序写入。

use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use log::info;
use serde::{Deserialize, Serialize};

use crate::core::error::ScanError;
use crate::core::phone::extractor::PhoneCandidate;
use crate::core::phone::validator::PhoneValidator;

/// 每个号码保留的原始文本样例上限
pub const MAX_RAW_EXAMPLES: usize = 32;
/// 导出 `example_raw_text` 的字符上限
pub const EXAMPLE_TEXT_LIMIT: usize = 500;

#[derive(Debug, Clone, PartialEq)]
pub struct NumberRecord {
    pub canonical: String,
    pub national: String,
    /// 秒，所有命中帧中最早的时间戳
    pub first_seen: Option<f64>,
    pub frame_indices: BTreeSet<u64>,
    pub raw_examples: BTreeSet<String>,
    /// 至少有一次命中通过了号码规则校验
    pub validated: bool,
}

impl NumberRecord {
    fn new(candidate: &PhoneCandidate) -> Self {
        Self {
            canonical: candidate.canonical.clone(),
            national: candidate.national.clone(),
            first_seen: None,
            frame_indices: BTreeSet::new(),
            raw_examples: BTreeSet::new(),
            validated: false,
        }
    }

    pub fn frame_count(&self) -> usize {
        self.frame_indices.len()
    }
}

#[derive(Debug, Default)]
pub struct Aggregator {
    records: HashMap<String, NumberRecord>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 返回本帧首次出现的号码数量
    pub fn ingest(&mut self, candidates: &[PhoneCandidate], frame_index: u64, timestamp: f64) -> usize {
        let mut new_numbers = 0;

        for candidate in candidates {
            let record = self
                .records
                .entry(candidate.canonical.clone())
                .or_insert_with(|| {
                    new_numbers += 1;
                    info!(
                        "🆕 New phone number found: {} ({}) at {:.1}s",
                        candidate.canonical, candidate.national, timestamp
                    );
                    NumberRecord::new(candidate)
                });

            record.first_seen = Some(match record.first_seen {
                Some(seen) => seen.min(timestamp),
                None => timestamp,
            });
            record.frame_indices.insert(frame_index);
            if record.raw_examples.len() < MAX_RAW_EXAMPLES
                || record.raw_examples.contains(&candidate.raw)
            {
                record.raw_examples.insert(candidate.raw.clone());
            }
            record.validated |= candidate.kind.is_validated();
        }

        new_numbers
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, canonical: &str) -> Option<&NumberRecord> {
        self.records.get(canonical)
    }

    /// 按 first_seen 升序（未设置的排最后），再按号码排序
    pub fn snapshot(&self) -> Vec<NumberRecord> {
        let mut records: Vec<NumberRecord> = self.records.values().cloned().collect();
        records.sort_by(|a, b| {
            let by_time = match (a.first_seen, b.first_seen) {
                (Some(x), Some(y)) => x.total_cmp(&y),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            };
            by_time.then_with(|| a.canonical.cmp(&b.canonical))
        });
        records
    }

    /// 导出记录，国内格式由规范号码重新推导
    pub fn finalize(&self, validator: &dyn PhoneValidator) -> Vec<ResultRecord> {
        self.snapshot()
            .iter()
            .map(|record| ResultRecord::from_record(record, validator))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub canonical_number: String,
    pub national_number: String,
    pub first_seen_seconds: Option<f64>,
    pub frame_count: usize,
    pub example_raw_text: String,
    /// 所有命中都来自手机号前缀兜底时为 false
    pub validated: bool,
}

impl ResultRecord {
    pub fn from_record(record: &NumberRecord, validator: &dyn PhoneValidator) -> Self {
        let national_number = validator
            .national_format(&record.canonical)
            .unwrap_or_else(|| record.national.clone());

        // BTreeSet 已按字典序排列
        let joined = record
            .raw_examples
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("; ");

        Self {
            canonical_number: record.canonical.clone(),
            national_number,
            first_seen_seconds: record.first_seen.map(|t| (t * 1000.0).round() / 1000.0),
            frame_count: record.frame_count(),
            example_raw_text: joined.chars().take(EXAMPLE_TEXT_LIMIT).collect(),
            validated: record.validated,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

impl ExportFormat {
    pub fn from_path(path: &Path) -> Result<Self, ScanError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("json") => Ok(ExportFormat::Json),
            Some("csv") => Ok(ExportFormat::Csv),
            _ => Err(ScanError::Config(format!(
                "unknown export format for {}",
                path.display()
            ))),
        }
    }
}

pub fn write_json<W: Write>(records: &[ResultRecord], writer: W) -> Result<(), ScanError> {
    serde_json::to_writer_pretty(writer, records)?;
    Ok(())
}

pub fn write_csv<W: Write>(records: &[ResultRecord], writer: W) -> Result<(), ScanError> {
    let mut csv = csv::Writer::from_writer(writer);
    if records.is_empty() {
        csv.write_record([
            "canonical_number",
            "national_number",
            "first_seen_seconds",
            "frame_count",
            "example_raw_text",
            "validated",
        ])?;
    }
    for record in records {
        csv.serialize(record)?;
    }
    csv.flush()?;
    Ok(())
}

pub fn export_results(records: &[ResultRecord], path: &Path) -> Result<(), ScanError> {
    let format = ExportFormat::from_path(path)?;
    let mut writer = BufWriter::new(File::create(path)?);
    match format {
        ExportFormat::Json => write_json(records, &mut writer)?,
        ExportFormat::Csv => write_csv(records, &mut writer)?,
    }
    writer.flush()?;
    info!("💾 Exported {} results to {}", records.len(), path.display());
    Ok(())
}
