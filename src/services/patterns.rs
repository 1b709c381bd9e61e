//! Tracking pattern extraction
//!
//! Turns a raw scanned symbol into candidate substrings that may be the
//! tracking code the order system knows about. Carriers embed that code at
//! different offsets inside the printed barcode, so the extractor is
//! generous and the caller filters (length floor, shipment state).
//!
//! The thresholds below are carrier folklore and have not been tuned
//! against data; change them only with someone who knows the labels.

use regex::Regex;
use std::sync::OnceLock;
use tracing::error;

/// Shortest candidate the resolver will send to the order system
pub const MIN_CANDIDATE_LEN: usize = 8;

/// Minimum digit run for the prefix+digits and plain digit rules
pub const MIN_DIGIT_RUN: usize = 10;

/// Codes longer than this get the prefix and window rules
pub const LONG_CODE_LEN: usize = 15;

/// Prefix lengths tried for long numeric codes
pub const MAX_PREFIX_LEN: usize = 22;
pub const MIN_PREFIX_LEN: usize = 12;

/// Sliding window width for long mixed codes
pub const WINDOW_LEN: usize = 13;

/// Canonical letter-digit tracking lengths (with and without check digit)
pub const HYBRID_LENS: [usize; 2] = [13, 12];

struct Rules {
    letter_prefix: Regex,
    digit_run: Regex,
    hybrid: Regex,
}

fn rules() -> Option<&'static Rules> {
    static RULES: OnceLock<Result<Rules, String>> = OnceLock::new();
    let rules = RULES.get_or_init(|| {
        let build = |pattern: &str| Regex::new(pattern).map_err(|e| e.to_string());
        Ok(Rules {
            letter_prefix: build(&format!(r"[A-Z]{{1,2}}\d{{{MIN_DIGIT_RUN},}}"))?,
            digit_run: build(&format!(r"\d{{{MIN_DIGIT_RUN},}}"))?,
            hybrid: build(r"\d*[A-Z]\d{8,}")?,
        })
    });
    match rules {
        Ok(rules) => Some(rules),
        Err(msg) => {
            error!(error = %msg, "pattern_rules_init_failed");
            None
        }
    }
}

/// Extract candidate tracking codes from a scanned symbol
///
/// Input is upper-cased and stripped of non-alphanumerics. Output is
/// deduplicated and sorted longest first; equal lengths keep the order in
/// which they were generated.
pub fn extract_candidates(raw: &str) -> Vec<String> {
    let clean = crate::domain::types::strip_code(raw);
    let mut out: Vec<String> = Vec::new();
    if clean.is_empty() {
        return out;
    }

    if let Some(rules) = rules() {
        for re in [&rules.letter_prefix, &rules.digit_run, &rules.hybrid] {
            out.extend(re.find_iter(&clean).map(|m| m.as_str().to_string()));
        }
    }

    let bytes = clean.as_bytes();
    let len = clean.len();

    if len > LONG_CODE_LEN && bytes.iter().all(u8::is_ascii_digit) {
        let longest = (len - 2).min(MAX_PREFIX_LEN);
        out.extend((MIN_PREFIX_LEN..=longest).rev().map(|n| clean[..n].to_string()));
    }

    if len > LONG_CODE_LEN {
        for window in bytes.windows(WINDOW_LEN) {
            if window.iter().any(u8::is_ascii_alphabetic) && window.iter().any(u8::is_ascii_digit) {
                out.push(String::from_utf8_lossy(window).into_owned());
            }
        }
    }

    // anchored hybrids: digit immediately followed by a letter
    for j in 1..len {
        if bytes[j].is_ascii_alphabetic() && bytes[j - 1].is_ascii_digit() {
            let start = j - 1;
            for n in HYBRID_LENS {
                if start + n <= len {
                    out.push(clean[start..start + n].to_string());
                }
            }
        }
    }

    let mut seen = std::collections::HashSet::with_capacity(out.len());
    out.retain(|c| seen.insert(c.clone()));
    out.sort_by(|a, b| b.len().cmp(&a.len()));
    out
}

/// Candidates long enough to use in a live query
pub fn live_candidates(raw: &str) -> Vec<String> {
    extract_candidates(raw).into_iter().filter(|c| c.len() >= MIN_CANDIDATE_LEN).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCANNED: &str = "%0078700116C2049311221802250";
    const DECLARED: &str = "6C20493112219";

    #[test]
    fn test_scanned_symbol_yields_declared_prefix() {
        let candidates = extract_candidates(SCANNED);
        assert!(candidates
            .iter()
            .any(|c| DECLARED.contains(c.as_str()) && c.len() >= MIN_CANDIDATE_LEN));
        assert!(candidates.contains(&"6C2049311221".to_string()));
    }

    #[test]
    fn test_longest_first_and_unique() {
        let candidates = extract_candidates(SCANNED);
        assert_eq!(candidates[0], "0078700116C2049311221802250");
        assert!(candidates.windows(2).all(|w| w[0].len() >= w[1].len()));
        let unique: std::collections::HashSet<_> = candidates.iter().collect();
        assert_eq!(unique.len(), candidates.len());
    }

    #[test]
    fn test_letter_prefix_and_digit_runs() {
        let candidates = extract_candidates("jj-d0003900071234");
        assert!(candidates.contains(&"JD0003900071234".to_string()));
        assert!(candidates.contains(&"0003900071234".to_string()));
    }

    #[test]
    fn test_long_numeric_prefixes() {
        let code = "0003010003019701434708012";
        let candidates = extract_candidates(code);
        // min(len - 2, 22) = 22 down to 12
        for n in MIN_PREFIX_LEN..=22 {
            assert!(candidates.contains(&code[..n].to_string()), "missing prefix of {n}");
        }
        assert!(!candidates.contains(&code[..23].to_string()));
        assert!(!candidates.contains(&code[..11].to_string()));
    }

    #[test]
    fn test_short_numeric_code_gets_no_prefixes() {
        let candidates = extract_candidates("123456789012");
        assert_eq!(candidates, vec!["123456789012".to_string()]);
    }

    #[test]
    fn test_ties_keep_generation_order() {
        let candidates = extract_candidates("X123456789012A12345678901");
        let twelve: Vec<&str> =
            candidates.iter().filter(|c| c.len() == 12).map(String::as_str).collect();
        assert_eq!(twelve, vec!["A12345678901", "123456789012", "2A1234567890"]);
    }

    #[test]
    fn test_empty_and_symbol_only_input() {
        assert!(extract_candidates("").is_empty());
        assert!(extract_candidates("%%--").is_empty());
    }

    #[test]
    fn test_live_candidates_respect_floor() {
        assert!(live_candidates(SCANNED).iter().all(|c| c.len() >= MIN_CANDIDATE_LEN));
        assert!(live_candidates("A1234567").is_empty());
    }
}
