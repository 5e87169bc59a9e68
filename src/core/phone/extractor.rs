use std::sync::Arc;

use log::{debug, warn};
use serde::Serialize;

use crate::core::phone::recovery::{DigitGroups, RecoveryGrammar};
use crate::core::phone::region::Region;
use crate::core::phone::validator::PhoneValidator;

/// 候选号码的来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateKind {
    /// 号码规则直接命中（possible 且 valid）
    Matched,
    /// 从受损文本重组后通过校验
    Recovered,
    /// 仅凭手机号前缀接受，未通过号码规则校验，误报率明显更高
    BestEffort,
}

impl CandidateKind {
    pub fn is_validated(self) -> bool {
        !matches!(self, CandidateKind::BestEffort)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PhoneCandidate {
    pub canonical: String,
    pub national: String,
    pub raw: String,
    pub kind: CandidateKind,
}

pub struct CandidateExtractor {
    validator: Arc<dyn PhoneValidator>,
    allow_best_effort: bool,
}

impl CandidateExtractor {
    pub fn new(validator: Arc<dyn PhoneValidator>) -> Self {
        Self {
            validator,
            allow_best_effort: true,
        }
    }

    pub fn with_best_effort(mut self, allow: bool) -> Self {
        self.allow_best_effort = allow;
        self
    }

    pub fn validator(&self) -> &Arc<dyn PhoneValidator> {
        &self.validator
    }

    /// 先走号码规则；没有结果时才尝试受损文本恢复
    pub fn extract(&self, text: &str, region: &Region) -> Vec<PhoneCandidate> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        let matched = self.grammar_tier(text, region);
        if !matched.is_empty() {
            return matched;
        }

        match RecoveryGrammar::for_region(region) {
            Some(grammar) => {
                debug!("🔍 No direct hits for '{}', trying recovery", text);
                self.recovery_tier(text, region, grammar)
            }
            None => Vec::new(),
        }
    }

    fn grammar_tier(&self, text: &str, region: &Region) -> Vec<PhoneCandidate> {
        self.validator
            .find_numbers(text, region)
            .into_iter()
            .filter(|m| m.number.is_confirmed())
            .map(|m| PhoneCandidate {
                canonical: m.number.canonical,
                national: m.number.national,
                raw: m.raw,
                kind: CandidateKind::Matched,
            })
            .collect()
    }

    fn recovery_tier(
        &self,
        text: &str,
        region: &Region,
        grammar: &RecoveryGrammar,
    ) -> Vec<PhoneCandidate> {
        for pattern in grammar.patterns() {
            let mut hits = Vec::new();

            for caps in pattern.captures_iter(text) {
                let Some(groups) = grammar.groups(&caps) else {
                    continue;
                };

                if let Some(candidate) = self.first_valid(grammar, &groups, region) {
                    hits.push(candidate);
                    continue;
                }

                if !self.allow_best_effort {
                    continue;
                }
                if let Some((canonical, national)) = grammar.best_effort(&groups) {
                    warn!(
                        "⚠️ Accepting unvalidated {} from '{}' on mobile prefix only",
                        canonical, groups.raw
                    );
                    hits.push(PhoneCandidate {
                        canonical,
                        national,
                        raw: groups.raw.clone(),
                        kind: CandidateKind::BestEffort,
                    });
                }
            }

            if !hits.is_empty() {
                return hits;
            }
        }

        Vec::new()
    }

    fn first_valid(
        &self,
        grammar: &RecoveryGrammar,
        groups: &DigitGroups,
        region: &Region,
    ) -> Option<PhoneCandidate> {
        if !groups.is_numeric() {
            return None;
        }

        for construction in grammar.constructions(groups) {
            match self.validator.parse(&construction, region) {
                Ok(number) if number.is_confirmed() => {
                    debug!("✅ Recovered {} via '{}'", number.canonical, construction);
                    return Some(PhoneCandidate {
                        canonical: number.canonical,
                        national: number.national,
                        raw: groups.raw.clone(),
                        kind: CandidateKind::Recovered,
                    });
                }
                Ok(_) => {}
                Err(e) => debug!("construction '{}' rejected: {}", construction, e),
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::phone::validator::testing::TableValidator;
    use crate::core::phone::validator::LibPhoneValidator;

    fn il() -> Region {
        Region::new("IL").unwrap()
    }

    fn extractor(valid: &[&str]) -> CandidateExtractor {
        CandidateExtractor::new(Arc::new(TableValidator::new(valid)))
    }

    #[test]
    fn test_grammar_tier_scenario() {
        let extractor = CandidateExtractor::new(Arc::new(LibPhoneValidator::new()));
        let found = extractor.extract("+972 53-123-4567", &il());

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].canonical, "+972531234567");
        assert!(found[0].national.contains("53-123-4567"));
        assert_eq!(found[0].raw, "+972 53-123-4567");
        assert_eq!(found[0].kind, CandidateKind::Matched);
    }

    #[test]
    fn test_grammar_tier_survives_leading_digit_noise() {
        let extractor = CandidateExtractor::new(Arc::new(LibPhoneValidator::new()));
        let found = extractor.extract("1 2 3 4 5 6 7 8 053-123-4567", &il());

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].canonical, "+972531234567");
        assert_eq!(found[0].raw, "053-123-4567");
        assert_eq!(found[0].kind, CandidateKind::Matched);
    }

    #[test]
    fn test_damaged_fragment_never_marked_confirmed() {
        let extractor = CandidateExtractor::new(Arc::new(LibPhoneValidator::new()));
        let found = extractor.extract(". 421-4567]", &il());

        assert!(found.len() <= 1);
        for candidate in &found {
            assert_eq!(candidate.kind, CandidateKind::BestEffort);
            assert!(!candidate.kind.is_validated());
        }
    }

    #[test]
    fn test_recovery_fixes_glyph() {
        let found = extractor(&["+972548528105"]).extract("54-B52-8105", &il());

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].canonical, "+972548528105");
        assert_eq!(found[0].raw, "54-B52-8105");
        assert_eq!(found[0].kind, CandidateKind::Recovered);
    }

    #[test]
    fn test_best_effort_is_flagged() {
        let found = extractor(&[]).extract("57-B12-3456", &il());

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].canonical, "+972578123456");
        assert_eq!(found[0].national, "057-812-3456");
        assert_eq!(found[0].raw, "57-B12-3456");
        assert_eq!(found[0].kind, CandidateKind::BestEffort);
    }

    #[test]
    fn test_best_effort_can_be_disabled() {
        let found = extractor(&[])
            .with_best_effort(false)
            .extract("57-B12-3456", &il());
        assert!(found.is_empty());
    }

    #[test]
    fn test_landline_prefix_not_guessed() {
        assert!(extractor(&[]).extract("31-234-5678", &il()).is_empty());
    }

    #[test]
    fn test_grammar_hit_short_circuits_recovery() {
        let found = extractor(&["+972531234567"]).extract("053-123-4567 or 57-B12-3456", &il());

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].canonical, "+972531234567");
        assert_eq!(found[0].kind, CandidateKind::Matched);
    }

    #[test]
    fn test_no_recovery_grammar_for_region() {
        let de = Region::new("DE").unwrap();
        assert!(extractor(&[]).extract("57-B12-3456", &de).is_empty());
    }

    #[test]
    fn test_blank_text() {
        assert!(extractor(&["+972531234567"]).extract("   \n", &il()).is_empty());
    }
}
