//! Rejection taxonomy and upstream failures

use crate::domain::types::{Carrier, ShipmentRecord};
use thiserror::Error;

/// Structured refusal of a consolidation operation
///
/// A rejected operation never mutates state.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Rejection {
    #[error("no shipment found for tracking code {code}")]
    NotFound { code: String },

    #[error("package belongs to {detected}, not {expected}")]
    CarrierMismatch { detected: Carrier, expected: Carrier },

    #[error("carrier for {code} could not be verified; search by customer and add it manually")]
    Unverified { code: String, shipment: Box<ShipmentRecord> },

    #[error("package {code} is already scanned")]
    Duplicate { code: String },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("state could not be persisted: {0}")]
    Persistence(String),
}

impl Rejection {
    pub const KINDS: [&'static str; 8] = [
        "not_found",
        "carrier_mismatch",
        "unverified",
        "duplicate",
        "invalid_state",
        "invalid_input",
        "upstream_unavailable",
        "persistence",
    ];

    /// Slot of `kind()` in `KINDS`
    pub fn slot(&self) -> usize {
        match self {
            Rejection::NotFound { .. } => 0,
            Rejection::CarrierMismatch { .. } => 1,
            Rejection::Unverified { .. } => 2,
            Rejection::Duplicate { .. } => 3,
            Rejection::InvalidState(_) => 4,
            Rejection::InvalidInput(_) => 5,
            Rejection::UpstreamUnavailable(_) => 6,
            Rejection::Persistence(_) => 7,
        }
    }

    /// Stable machine-readable code
    pub fn kind(&self) -> &'static str {
        Self::KINDS[self.slot()]
    }

    /// Carrier detected for a mismatch rejection
    pub fn detected_carrier(&self) -> Option<&Carrier> {
        match self {
            Rejection::CarrierMismatch { detected, .. } => Some(detected),
            _ => None,
        }
    }
}

/// Which external system a failure came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upstream {
    OrderSystem,
    Aggregator,
}

impl Upstream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Upstream::OrderSystem => "order_system",
            Upstream::Aggregator => "aggregator",
        }
    }

    pub fn slot(&self) -> usize {
        *self as usize
    }
}

impl std::fmt::Display for Upstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure talking to the order system or the aggregator
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("RPC fault: {0}")]
    Rpc(String),

    #[error("authentication rejected")]
    Auth,

    #[error("unexpected response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for UpstreamError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            UpstreamError::Decode(e.to_string())
        } else {
            UpstreamError::Transport(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_kinds() {
        let mismatch = Rejection::CarrierMismatch {
            detected: Carrier::new("CTT"),
            expected: Carrier::new("GLS"),
        };
        assert_eq!(mismatch.kind(), "carrier_mismatch");
        assert_eq!(mismatch.detected_carrier(), Some(&Carrier::new("CTT")));
        assert_eq!(mismatch.to_string(), "package belongs to CTT, not GLS");

        let dup = Rejection::Duplicate { code: "X1".to_string() };
        assert_eq!(dup.kind(), "duplicate");
        assert_eq!(dup.detected_carrier(), None);

        let persist = Rejection::Persistence("disk full".to_string());
        assert_eq!(persist.kind(), "persistence");
    }
}
