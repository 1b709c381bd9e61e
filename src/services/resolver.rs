//! Resolution engine - scanned code to shipment and carrier
//!
//! Tiers run strictly in order and each one either settles the result or
//! hands over to the next:
//!
//! 1. installed index (aggregator code, declared code, carrier-scoped fuzzy)
//! 2. live order-system lookup (exact, contains, extracted candidates)
//! 3. carrier hint on the shipment
//! 4. raw parcel cache from the last build
//! 5. live aggregator lookup
//!
//! An upstream failure in any tier is a miss for that tier.

use crate::domain::error::{Upstream, UpstreamError};
use crate::domain::types::{normalize_code, Carrier, Provenance, ShipmentRecord};
use crate::infra::metrics::Metrics;
use crate::io::aggregator::CarrierAggregator;
use crate::io::order_system::OrderSystem;
use crate::services::carriers;
use crate::services::index::{IndexHandle, IndexSnapshot};
use crate::services::patterns;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Outcome of a resolution; a carrier is never reported without a shipment
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Resolution {
    Resolved { shipment: ShipmentRecord, carrier: Carrier, provenance: Provenance },
    Unverified { shipment: ShipmentRecord },
    /// `order_system_error` is set when the order system could not be asked
    NotFound { order_system_error: Option<String> },
}

impl Resolution {
    pub fn provenance(&self) -> Provenance {
        match self {
            Resolution::Resolved { provenance, .. } => *provenance,
            Resolution::Unverified { .. } => Provenance::Unverified,
            Resolution::NotFound { .. } => Provenance::NotFound,
        }
    }

    pub fn shipment(&self) -> Option<&ShipmentRecord> {
        match self {
            Resolution::Resolved { shipment, .. } | Resolution::Unverified { shipment } => Some(shipment),
            Resolution::NotFound { .. } => None,
        }
    }

    pub fn carrier(&self) -> Option<&Carrier> {
        match self {
            Resolution::Resolved { carrier, .. } => Some(carrier),
            _ => None,
        }
    }
}

pub struct ResolutionEngine {
    index: Arc<IndexHandle>,
    orders: Arc<dyn OrderSystem>,
    aggregator: Arc<dyn CarrierAggregator>,
    metrics: Arc<Metrics>,
}

impl ResolutionEngine {
    pub fn new(
        index: Arc<IndexHandle>,
        orders: Arc<dyn OrderSystem>,
        aggregator: Arc<dyn CarrierAggregator>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { index, orders, aggregator, metrics }
    }

    pub async fn resolve(&self, scanned: &str) -> Resolution {
        let started = Instant::now();
        let resolution = self.run_tiers(scanned).await;
        let latency_ms = started.elapsed().as_millis() as u64;
        self.metrics.record_resolution(resolution.provenance(), latency_ms);
        debug!(
            scanned = %scanned,
            provenance = resolution.provenance().as_str(),
            carrier = resolution.carrier().map(Carrier::as_str).unwrap_or("-"),
            latency_ms = latency_ms,
            "resolution_finished"
        );
        resolution
    }

    async fn run_tiers(&self, scanned: &str) -> Resolution {
        let code = normalize_code(scanned);
        if code.is_empty() {
            return Resolution::NotFound { order_system_error: None };
        }

        let snapshot = self.index.current();
        if let Some(resolution) = index_tier(&snapshot, &code) {
            return resolution;
        }

        let shipment = match self.lookup_shipment(&code).await {
            Ok(Some(shipment)) => shipment,
            Ok(None) => {
                debug!(code = %code, "resolution_no_shipment");
                return Resolution::NotFound { order_system_error: None };
            }
            Err(e) => {
                self.metrics.record_upstream_failure(Upstream::OrderSystem);
                warn!(code = %code, error = %e, "order_system_lookup_failed");
                return Resolution::NotFound { order_system_error: Some(e.to_string()) };
            }
        };

        // the live shipment may be indexed under its declared code
        if let Some(entry) = snapshot.index.by_declared_code(&shipment.declared_code) {
            return resolved(shipment, entry.carrier.clone(), Provenance::Index);
        }

        if let Some(carrier) = shipment.carrier_hint.as_deref().and_then(carriers::from_hint) {
            return resolved(shipment, carrier, Provenance::Hint);
        }

        if let Some(carrier) = snapshot.cache.get(&shipment.declared_code).and_then(|p| p.carrier.clone()) {
            return resolved(shipment, carrier, Provenance::Cache);
        }

        if let Some(carrier) = self.live_carrier(&shipment.declared_code, &code).await {
            return resolved(shipment, carrier, Provenance::Live);
        }

        Resolution::Unverified { shipment }
    }

    /// Exact, then contains, then extracted candidates longest first
    async fn lookup_shipment(&self, code: &str) -> Result<Option<ShipmentRecord>, UpstreamError> {
        if let Some(shipment) = self.orders.find_shipment_by_tracking_code(code).await? {
            return Ok(Some(shipment));
        }
        let candidates = patterns::live_candidates(code);
        if candidates.is_empty() {
            return Ok(None);
        }
        debug!(code = %code, candidates = candidates.len(), "resolution_candidate_search");
        self.orders.search_shipments_by_candidates(&candidates, None).await
    }

    /// Ask the aggregator with the declared code, then the scanned form
    async fn live_carrier(&self, declared: &str, scanned: &str) -> Option<Carrier> {
        let declared = normalize_code(declared);
        let mut queries = vec![declared.as_str()];
        if scanned != declared {
            queries.push(scanned);
        }
        for query in queries.into_iter().filter(|q| !q.is_empty()) {
            match self.aggregator.get_parcel_by_tracking(query).await {
                Ok(Some(parcel)) => {
                    if let Some(carrier) = parcel.carrier {
                        return Some(carrier);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    self.metrics.record_upstream_failure(Upstream::Aggregator);
                    warn!(code = %query, error = %e, "aggregator_lookup_failed");
                    return None;
                }
            }
        }
        None
    }
}

fn resolved(shipment: ShipmentRecord, carrier: Carrier, provenance: Provenance) -> Resolution {
    Resolution::Resolved { shipment, carrier, provenance }
}

fn index_tier(snapshot: &IndexSnapshot, code: &str) -> Option<Resolution> {
    let index = &snapshot.index;
    let entry = index
        .by_aggregator_code(code)
        .or_else(|| index.by_declared_code(code))
        .or_else(|| index.fuzzy_lookup_any(code))?;
    Some(resolved(entry.shipment.clone(), entry.carrier.clone(), Provenance::Index))
}
