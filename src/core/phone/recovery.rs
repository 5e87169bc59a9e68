//! 按地区的 OCR 损坏号码恢复语法
//!
//! 叠加字幕里的号码经常丢分隔符，或者把 8 识别成 B、0 识别成 O。
//! 这里为有定义的地区提供宽松匹配模式、字形修正表和候选重组规则。

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::core::phone::region::Region;

static GRAMMARS: Lazy<HashMap<&'static str, RecoveryGrammar>> = Lazy::new(|| {
    let mut grammars = HashMap::new();
    grammars.insert("IL", RecoveryGrammar::israel());
    grammars
});

/// 按固定长度分组的原始命中，误识别字符已修正
#[derive(Debug, Clone, PartialEq)]
pub struct DigitGroups {
    pub raw: String,
    pub lead: String,
    pub middle: String,
    pub tail: String,
}

impl DigitGroups {
    pub fn digits(&self) -> String {
        format!("{}{}{}", self.lead, self.middle, self.tail)
    }

    pub fn is_numeric(&self) -> bool {
        self.digits().chars().all(|c| c.is_ascii_digit())
    }
}

pub struct RecoveryGrammar {
    country_code: &'static str,
    trunk_prefix: &'static str,
    /// 按顺序尝试，第一个有结果的模式生效
    patterns: Vec<Regex>,
    /// (误识别字形, 正确数字)
    substitutions: &'static [(char, char)],
    mobile_prefix: Regex,
    national_digits: usize,
}

impl RecoveryGrammar {
    pub fn for_region(region: &Region) -> Option<&'static RecoveryGrammar> {
        GRAMMARS.get(region.as_str())
    }

    /// 以色列手机号：5X-XXX-XXXX，国家码 972，长途前缀 0
    fn israel() -> Self {
        let glyph = r"[\dBOoSIl]";
        let patterns = [
            format!(r"0?(\d{{2}})-?({g}{{3}})-?({g}{{4}})", g = glyph),
            format!(r"0?(\d{{2}})\s+({g}{{3}})\s+({g}{{4}})", g = glyph),
        ];

        Self {
            country_code: "972",
            trunk_prefix: "0",
            patterns: patterns
                .iter()
                .map(|p| Regex::new(p).expect("valid recovery pattern"))
                .collect(),
            substitutions: &[('B', '8'), ('O', '0'), ('o', '0'), ('S', '5'), ('I', '1'), ('l', '1')],
            mobile_prefix: Regex::new(r"^5\d$").expect("valid mobile prefix pattern"),
            national_digits: 9,
        }
    }

    pub fn patterns(&self) -> &[Regex] {
        &self.patterns
    }

    pub fn fix_glyphs(&self, text: &str) -> String {
        text.chars()
            .map(|c| {
                self.substitutions
                    .iter()
                    .find(|(wrong, _)| *wrong == c)
                    .map(|(_, right)| *right)
                    .unwrap_or(c)
            })
            .collect()
    }

    pub fn groups(&self, caps: &Captures<'_>) -> Option<DigitGroups> {
        let raw = caps.get(0)?.as_str();
        Some(DigitGroups {
            raw: raw.to_string(),
            lead: caps.get(1)?.as_str().to_string(),
            middle: self.fix_glyphs(caps.get(2)?.as_str()),
            tail: self.fix_glyphs(caps.get(3)?.as_str()),
        })
    }

    /// 重组候选串：带/不带国家码、带/不带分隔符、带/不带长途前缀
    pub fn constructions(&self, groups: &DigitGroups) -> Vec<String> {
        let cc = self.country_code;
        let trunk = self.trunk_prefix;
        let (a, b, c) = (&groups.lead, &groups.middle, &groups.tail);
        vec![
            format!("+{cc}{a}{b}{c}"),
            format!("+{cc} {a}-{b}-{c}"),
            format!("{trunk}{a}-{b}-{c}"),
            format!("{trunk}{a}{b}{c}"),
            format!("{a}{b}{c}"),
        ]
    }

    /// 校验失败时的兜底：前缀像手机号且位数正确就接受，但不代表号码真实有效
    pub fn best_effort(&self, groups: &DigitGroups) -> Option<(String, String)> {
        if !groups.is_numeric()
            || groups.digits().len() != self.national_digits
            || !self.mobile_prefix.is_match(&groups.lead)
        {
            return None;
        }

        let canonical = format!("+{}{}", self.country_code, groups.digits());
        let national = format!(
            "{}{}-{}-{}",
            self.trunk_prefix, groups.lead, groups.middle, groups.tail
        );
        Some((canonical, national))
    }
}
