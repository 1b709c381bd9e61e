//! Carrier-specific fuzzy match rules

use serde::{Deserialize, Serialize};

/// How an aggregator code may relate to a declared code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchRule {
    /// Equality after trim + upper-case only
    Exact,
    /// Aggregator ends with declared, or contains a declared code of 7+ chars (CTT)
    SuffixEmbedded,
    /// Aggregator contains declared anywhere (SPRING)
    Embedded,
    /// Either contains the other (ASENDIA)
    Bidirectional,
}

/// Declared codes shorter than this only match a suffix-embedded aggregator code by suffix
pub const SUFFIX_EMBED_MIN_LEN: usize = 7;

impl MatchRule {
    /// Decide whether `aggregator` and `declared` name the same parcel
    ///
    /// Exact equality is always tried first. Empty inputs never match.
    pub fn matches(&self, aggregator: &str, declared: &str) -> bool {
        let agg = aggregator.trim().to_uppercase();
        let dec = declared.trim().to_uppercase();
        if agg.is_empty() || dec.is_empty() {
            return false;
        }
        if agg == dec {
            return true;
        }
        match self {
            MatchRule::Exact => false,
            MatchRule::SuffixEmbedded => {
                agg.ends_with(&dec) || (dec.len() >= SUFFIX_EMBED_MIN_LEN && agg.contains(&dec))
            }
            MatchRule::Embedded => agg.contains(&dec),
            MatchRule::Bidirectional => agg.contains(&dec) || dec.contains(&agg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_always_applies() {
        let rules =
            [MatchRule::Exact, MatchRule::SuffixEmbedded, MatchRule::Embedded, MatchRule::Bidirectional];
        for rule in rules {
            assert!(rule.matches(" abc123 ", "ABC123"));
            assert!(!rule.matches("", ""));
        }
        assert!(!MatchRule::Exact.matches("00ABC123", "ABC123"));
    }

    #[test]
    fn test_suffix_embedded() {
        let rule = MatchRule::SuffixEmbedded;
        assert!(rule.matches("00030100030197014347080", "4347080"));
        assert!(rule.matches("00030100030197014347080", "0197014"));
        assert!(rule.matches("0003010003019701434708099", "4347080"));
        // short declared codes only count at the end
        assert!(!rule.matches("0003010003019701434708099", "434708"));
    }

    #[test]
    fn test_embedded() {
        let rule = MatchRule::Embedded;
        assert!(rule.matches("LS123456789NL", "123456789"));
        assert!(!rule.matches("123456789", "LS123456789NL"));
    }

    #[test]
    fn test_bidirectional() {
        let rule = MatchRule::Bidirectional;
        assert!(rule.matches("6c2054423387", "6C20544233870"));
        assert!(rule.matches("XX6C20544233870YY", "6c20544233870"));
        assert!(!rule.matches("6C2054", "7C20544233870"));
    }
}
