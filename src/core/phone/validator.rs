//! 号码规则接口
//!
//! 号码规则由外部库提供，这里只定义提取器需要的接口，以及基于 `parse` 的号码片段匹配。

use std::panic::{self, AssertUnwindSafe};

use log::debug;
use once_cell::sync::Lazy;
use phonenumber::{country, Mode};
use regex::{Match, Regex};

use crate::core::error::ScanError;
use crate::core::phone::region::Region;

/// 疑似号码片段：可选的 `+`，数字之间用常见分隔符连接
static SPAN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\+?\(?\d[\d \t\r\n().\-/]*\d").expect("valid span pattern"));
static TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\S+").expect("valid token pattern"));

const MIN_SPAN_DIGITS: usize = 6;
const MAX_WINDOW_TOKENS: usize = 8;
const MIN_E164_DIGITS: usize = 7;
const MAX_E164_DIGITS: usize = 15;

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedNumber {
    /// E.164 格式，如 `+972531234567`
    pub canonical: String,
    pub national: String,
    pub possible: bool,
    pub valid: bool,
}

impl ParsedNumber {
    pub fn is_confirmed(&self) -> bool {
        self.possible && self.valid
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PhoneMatch {
    /// 原文中的精确子串
    pub raw: String,
    pub number: ParsedNumber,
}

pub trait PhoneValidator: Send + Sync {
    fn parse(&self, text: &str, region: &Region) -> Result<ParsedNumber, ScanError>;

    /// 不依赖地区代码，从规范号码推导国内格式
    fn national_format(&self, canonical: &str) -> Option<String>;

    /// 在文本中查找通过校验的号码。
    ///
    /// 每个片段先整体解析；失败时在有限窗口内从长到短尝试连续的子片段，
    /// 这样同一行的两个号码、或号码后紧跟下一行的数字串，都能被找到。
    fn find_numbers(&self, text: &str, region: &Region) -> Vec<PhoneMatch> {
        let mut matches = Vec::new();

        for span in SPAN.find_iter(text).map(|m| m.as_str()) {
            if digit_count(span) < MIN_SPAN_DIGITS {
                continue;
            }

            if let Some(number) = self.confirmed(span, region) {
                matches.push(PhoneMatch {
                    raw: span.to_string(),
                    number,
                });
                continue;
            }

            let tokens: Vec<Match<'_>> = TOKEN.find_iter(span).collect();

            let mut start = 0;
            while start < tokens.len() {
                let mut next = start + 1;
                let last = (start + MAX_WINDOW_TOKENS).min(tokens.len());
                for end in (start + 1..=last).rev() {
                    if start == 0 && end == tokens.len() {
                        continue;
                    }
                    if !window_is_plausible(&tokens[start..end]) {
                        continue;
                    }
                    let raw = span[tokens[start].start()..tokens[end - 1].end()]
                        .trim_end_matches(|c: char| !c.is_ascii_digit() && c != ')');
                    if digit_count(raw) < MIN_SPAN_DIGITS {
                        continue;
                    }
                    if let Some(number) = self.confirmed(raw, region) {
                        matches.push(PhoneMatch {
                            raw: raw.to_string(),
                            number,
                        });
                        next = end;
                        break;
                    }
                }
                start = next;
            }
        }

        matches
    }

    fn confirmed(&self, raw: &str, region: &Region) -> Option<ParsedNumber> {
        match self.parse(raw, region) {
            Ok(number) if number.is_confirmed() => Some(number),
            Ok(_) => None,
            Err(e) => {
                debug!("span '{}' rejected: {}", raw, e);
                None
            }
        }
    }
}

/// 子串中的每个分组至少两位数字，只有开头的 `+国家码` 例外，
/// 避免把一串零散的个位数拼成号码
fn window_is_plausible(tokens: &[Match<'_>]) -> bool {
    tokens.iter().enumerate().all(|(i, token)| {
        digit_count(token.as_str()) >= 2 || (i == 0 && token.as_str().starts_with('+'))
    })
}

pub fn digit_count(text: &str) -> usize {
    text.chars().filter(|c| c.is_ascii_digit()).count()
}

/// 基于 libphonenumber（`phonenumber` crate）的校验器
#[derive(Debug, Default, Clone, Copy)]
pub struct LibPhoneValidator;

impl LibPhoneValidator {
    pub fn new() -> Self {
        Self
    }

    fn parse_raw(
        region: Option<country::Id>,
        text: &str,
    ) -> Result<phonenumber::PhoneNumber, ScanError> {
        // the parser has panicked on some malformed inputs; keep that local
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| phonenumber::parse(region, text)));
        match outcome {
            Ok(Ok(number)) => Ok(number),
            Ok(Err(e)) => Err(ScanError::Extraction(format!("'{}': {}", text, e))),
            Err(_) => Err(ScanError::Extraction(format!("'{}': parser panicked", text))),
        }
    }
}

impl PhoneValidator for LibPhoneValidator {
    fn parse(&self, text: &str, region: &Region) -> Result<ParsedNumber, ScanError> {
        let id = region.as_str().parse::<country::Id>().ok();
        let number = Self::parse_raw(id, text)?;

        let canonical = number.format().mode(Mode::E164).to_string();
        let national = number.format().mode(Mode::National).to_string();
        // length-only approximation of libphonenumber's "possible"
        let digits = digit_count(&canonical);
        let possible = (MIN_E164_DIGITS..=MAX_E164_DIGITS).contains(&digits);
        let valid = phonenumber::is_valid(&number);

        Ok(ParsedNumber {
            canonical,
            national,
            possible,
            valid,
        })
    }

    fn national_format(&self, canonical: &str) -> Option<String> {
        Self::parse_raw(None, canonical)
            .ok()
            .map(|number| number.format().mode(Mode::National).to_string())
    }
}

/// 测试用的确定性校验器，只支持以色列号码
#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashSet;

    use super::*;

    pub struct TableValidator {
        valid: HashSet<String>,
    }

    impl TableValidator {
        pub fn new(valid: &[&str]) -> Self {
            Self {
                valid: valid.iter().map(|s| s.to_string()).collect(),
            }
        }

        fn canonical(text: &str) -> Option<String> {
            let trimmed = text.trim();
            let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();
            if digits.is_empty() {
                return None;
            }
            if trimmed.starts_with('+') {
                Some(format!("+{}", digits))
            } else if let Some(rest) = digits.strip_prefix('0') {
                Some(format!("+972{}", rest))
            } else {
                Some(format!("+972{}", digits))
            }
        }
    }

    impl PhoneValidator for TableValidator {
        fn parse(&self, text: &str, _region: &Region) -> Result<ParsedNumber, ScanError> {
            let canonical = Self::canonical(text)
                .ok_or_else(|| ScanError::Extraction(format!("no digits in '{}'", text)))?;
            let national = self
                .national_format(&canonical)
                .unwrap_or_else(|| canonical.clone());
            Ok(ParsedNumber {
                possible: digit_count(&canonical) == 12,
                valid: self.valid.contains(&canonical),
                canonical,
                national,
            })
        }

        fn national_format(&self, canonical: &str) -> Option<String> {
            let nsn = canonical.strip_prefix("+972")?;
            if nsn.len() != 9 {
                return None;
            }
            Some(format!("0{}-{}-{}", &nsn[..2], &nsn[2..5], &nsn[5..]))
        }
    }
}
