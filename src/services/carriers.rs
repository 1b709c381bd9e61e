//! Carrier catalog
//!
//! Static mapping from aggregator carrier codes to normalized carrier names,
//! plus the per-carrier fuzzy correlation class.

use crate::domain::types::Carrier;
use crate::services::match_rule::MatchRule;

/// Carriers the dock works with, in display order
pub const KNOWN_CARRIERS: [&str; 6] = ["ASENDIA", "CORREOS", "CTT", "GLS", "INPOST", "SPRING"];

/// Carriers whose declared code differs from the aggregator code, in the
/// order the index builder tries them
pub const FUZZY_CARRIERS: [&str; 3] = ["CTT", "SPRING", "ASENDIA"];

/// Aggregator code (lower-case, `_`-separated) to carrier name
const CODE_MAP: [(&str, &str); 16] = [
    ("correos", "CORREOS"),
    ("correos_express", "CORREOS"),
    ("correos_de_espana", "CORREOS"),
    ("ctt", "CTT"),
    ("ctt_express", "CTT"),
    ("ctt_expresso", "CTT"),
    ("gls", "GLS"),
    ("gls_spain", "GLS"),
    ("gls_es", "GLS"),
    ("spring", "SPRING"),
    ("spring_gds", "SPRING"),
    ("inpost", "INPOST"),
    ("inpost_es", "INPOST"),
    ("inpost_spain", "INPOST"),
    ("asendia", "ASENDIA"),
    ("asendia_spain", "ASENDIA"),
];

/// Normalize a raw aggregator carrier code
///
/// Unknown codes are upper-cased verbatim; blank codes yield `None`.
pub fn normalize(code: &str) -> Option<Carrier> {
    let code = code.trim();
    if code.is_empty() {
        return None;
    }
    let key = code.to_lowercase().replace(['-', ' '], "_");
    let name = CODE_MAP
        .iter()
        .find(|(raw, _)| *raw == key)
        .map(|(_, name)| *name)
        .unwrap_or(code);
    Some(Carrier::new(name))
}

/// Recognize an order-system carrier hint ("CTT Express 24h", "gls_es")
///
/// A hint counts only when it starts with a known carrier name or is a
/// catalogued aggregator code.
pub fn from_hint(hint: &str) -> Option<Carrier> {
    let upper = hint.trim().to_uppercase();
    if upper.is_empty() {
        return None;
    }
    if let Some(name) = KNOWN_CARRIERS.iter().find(|name| {
        upper
            .strip_prefix(**name)
            .is_some_and(|rest| rest.chars().next().map_or(true, |c| !c.is_ascii_alphanumeric()))
    }) {
        return Some(Carrier::new(name));
    }
    let key = upper.to_lowercase().replace(['-', ' '], "_");
    CODE_MAP.iter().find(|(raw, _)| *raw == key).map(|(_, name)| Carrier::new(name))
}

/// Fuzzy rule for a carrier, `None` when only exact matches apply
pub fn match_rule(carrier: &Carrier) -> Option<MatchRule> {
    match carrier.as_str() {
        "CTT" => Some(MatchRule::SuffixEmbedded),
        "SPRING" => Some(MatchRule::Embedded),
        "ASENDIA" => Some(MatchRule::Bidirectional),
        _ => None,
    }
}

pub fn fuzzy_carriers() -> impl Iterator<Item = Carrier> {
    FUZZY_CARRIERS.into_iter().map(Carrier::new)
}
