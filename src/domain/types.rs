//! Shared types for the dock consolidator

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Newtype wrapper for order-system shipment ids
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct ShipmentId(pub i64);

impl std::fmt::Display for ShipmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Normalized carrier name (always upper-case, e.g. "CTT", "GLS")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Carrier(String);

impl Carrier {
    pub fn new(name: &str) -> Self {
        Self(name.trim().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Carrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Carrier {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Outbound shipment as stored by the order system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShipmentRecord {
    pub id: ShipmentId,
    /// Human reference (e.g. "WH/OUT/04512")
    pub name: String,
    /// Tracking reference as declared in the order system
    pub declared_code: String,
    pub order_ref: String,
    pub customer_name: String,
    #[serde(default)]
    pub scheduled_date: Option<NaiveDate>,
    pub state: String,
    /// Free-text delivery method, when the order system knows it
    #[serde(default)]
    pub carrier_hint: Option<String>,
    #[serde(default)]
    pub expedition_date: Option<NaiveDate>,
}

/// Parcel as reported by the tracking aggregator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParcelRecord {
    pub tracking: String,
    /// Raw aggregator carrier code (e.g. "ctt_express")
    #[serde(default)]
    pub carrier_code: Option<String>,
    /// Carrier normalized through the catalog at ingest
    #[serde(default)]
    pub carrier: Option<Carrier>,
    #[serde(default)]
    pub order_ref: Option<String>,
    #[serde(default)]
    pub external_ref: Option<String>,
    #[serde(default)]
    pub recipient: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

/// Which resolution tier produced a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Index,
    Hint,
    Cache,
    Live,
    NotFound,
    Unverified,
}

impl Provenance {
    pub const ALL: [Provenance; 6] = [
        Provenance::Index,
        Provenance::Hint,
        Provenance::Cache,
        Provenance::Live,
        Provenance::NotFound,
        Provenance::Unverified,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::Index => "index",
            Provenance::Hint => "hint",
            Provenance::Cache => "cache",
            Provenance::Live => "live",
            Provenance::NotFound => "not_found",
            Provenance::Unverified => "unverified",
        }
    }

    /// Slot used by per-provenance counters
    pub fn slot(&self) -> usize {
        *self as usize
    }
}

/// Trim and upper-case a tracking code (form used for external calls)
#[inline]
pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

/// Upper-case and drop every non-alphanumeric character (form used for index keys)
#[inline]
pub fn strip_code(code: &str) -> String {
    code.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Parse the date part of an order-system timestamp ("2026-01-05 10:00:00" or "2026-01-05")
pub fn parse_date_prefix(value: &str) -> Option<NaiveDate> {
    let date = value.get(..10)?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}
