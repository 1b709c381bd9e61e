//! Index builder - periodic join of shipments and parcels
//!
//! Fetches both sides, correlates them, persists the result and only then
//! installs it. Any failure leaves the installed snapshot untouched. At most
//! one build runs at a time; a second request is refused, not queued.

use crate::domain::error::{Upstream, UpstreamError};
use crate::domain::types::{strip_code, Carrier, ParcelRecord, ShipmentRecord};
use crate::infra::metrics::Metrics;
use crate::io::aggregator::CarrierAggregator;
use crate::io::order_system::OrderSystem;
use crate::io::snapshot::SnapshotFiles;
use crate::services::carriers;
use crate::services::index::{
    CorrelationEntry, CorrelationIndex, IndexHandle, IndexSnapshot, IndexSummary, MatchKind, ParcelCache,
};
use chrono::{DateTime, Duration, Utc};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("an index build is already running")]
    InFlight,

    #[error("{0} fetch failed: {1}")]
    Upstream(Upstream, UpstreamError),

    #[error("snapshot could not be persisted: {0:#}")]
    Persist(anyhow::Error),
}

impl BuildError {
    pub fn kind(&self) -> &'static str {
        match self {
            BuildError::InFlight => "in_flight",
            BuildError::Upstream(..) => "upstream",
            BuildError::Persist(_) => "persist",
        }
    }
}

/// Clears the in-flight flag when dropped
struct BuildGuard<'a>(&'a AtomicBool);

impl<'a> BuildGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).ok()?;
        Some(Self(flag))
    }
}

impl Drop for BuildGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct IndexBuilder {
    orders: Arc<dyn OrderSystem>,
    aggregator: Arc<dyn CarrierAggregator>,
    handle: Arc<IndexHandle>,
    files: SnapshotFiles,
    metrics: Arc<Metrics>,
    window_days: u32,
    in_flight: AtomicBool,
}

impl IndexBuilder {
    pub fn new(
        orders: Arc<dyn OrderSystem>,
        aggregator: Arc<dyn CarrierAggregator>,
        handle: Arc<IndexHandle>,
        files: SnapshotFiles,
        metrics: Arc<Metrics>,
        window_days: u32,
    ) -> Self {
        Self { orders, aggregator, handle, files, metrics, window_days, in_flight: AtomicBool::new(false) }
    }

    pub fn is_building(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Install the last persisted snapshot, if any
    pub fn restore(&self) -> anyhow::Result<Option<IndexSummary>> {
        let Some(snapshot) = self.files.load()? else {
            return Ok(None);
        };
        let summary = snapshot.summary.clone();
        self.metrics.set_index_size(snapshot.index.len(), summary.unmatched);
        self.handle.install(snapshot);
        info!(
            build_id = %summary.build_id,
            built_at = %summary.built_at,
            entries = summary.matched,
            "index_snapshot_restored"
        );
        Ok(Some(summary))
    }

    /// Build, persist and install a new snapshot
    ///
    /// Shared by the scheduler and the manual trigger.
    pub async fn rebuild_now(&self) -> Result<IndexSummary, BuildError> {
        let Some(_guard) = BuildGuard::acquire(&self.in_flight) else {
            self.metrics.record_index_build_rejected();
            warn!("index_build_rejected_in_flight");
            return Err(BuildError::InFlight);
        };

        let started = Instant::now();
        info!(window_days = self.window_days, "index_build_started");

        let result = self.fetch_and_join().await.and_then(|snapshot| {
            self.files.save(&snapshot).map_err(BuildError::Persist)?;
            Ok(snapshot)
        });

        match result {
            Ok(snapshot) => {
                let summary = snapshot.summary.clone();
                let elapsed_ms = started.elapsed().as_millis() as u64;
                self.handle.install(snapshot);
                self.metrics.record_index_build(elapsed_ms, summary.matched, summary.unmatched);
                info!(
                    build_id = %summary.build_id,
                    shipments = summary.total_shipments,
                    parcels = summary.total_parcels,
                    matched_exact = summary.matched_exact,
                    matched_pattern = summary.matched_pattern,
                    unmatched = summary.unmatched,
                    duplicates = summary.duplicates,
                    duration_ms = elapsed_ms,
                    "index_build_completed"
                );
                Ok(summary)
            }
            Err(e) => {
                self.metrics.record_index_build_failed();
                if let BuildError::Upstream(upstream, _) = &e {
                    self.metrics.record_upstream_failure(*upstream);
                }
                error!(error = %e, kind = e.kind(), "index_build_failed");
                Err(e)
            }
        }
    }

    async fn fetch_and_join(&self) -> Result<IndexSnapshot, BuildError> {
        let now = Utc::now();
        let since = now - Duration::days(i64::from(self.window_days));

        let shipments = self
            .orders
            .list_recent_outbound(since.date_naive())
            .await
            .map_err(|e| BuildError::Upstream(Upstream::OrderSystem, e))?;
        let parcels = self
            .aggregator
            .list_parcels_updated_since(since)
            .await
            .map_err(|e| BuildError::Upstream(Upstream::Aggregator, e))?;

        Ok(correlate(shipments, parcels, self.window_days, now))
    }
}

/// Join shipments to parcels
///
/// Exact declared-code matches first, then the carrier's fuzzy rule. Each
/// parcel is claimed by at most one shipment and each declared code is
/// indexed once.
pub fn correlate(
    shipments: Vec<ShipmentRecord>,
    parcels: Vec<ParcelRecord>,
    window_days: u32,
    built_at: DateTime<Utc>,
) -> IndexSnapshot {
    let mut exact: FxHashMap<String, usize> = FxHashMap::default();
    let mut by_carrier: FxHashMap<Carrier, Vec<usize>> = FxHashMap::default();
    for (i, parcel) in parcels.iter().enumerate() {
        // carrier-less parcels stay cache-only
        let Some(carrier) = &parcel.carrier else { continue };
        exact.entry(strip_code(&parcel.tracking)).or_insert(i);
        by_carrier.entry(carrier.clone()).or_default().push(i);
    }

    let mut index = CorrelationIndex::new();
    let mut summary = IndexSummary::empty();
    summary.build_id = Uuid::now_v7().to_string();
    summary.built_at = built_at;
    summary.window_days = window_days;
    summary.total_shipments = shipments.len();
    summary.total_parcels = parcels.len();

    for shipment in shipments {
        let declared = strip_code(&shipment.declared_code);
        if declared.is_empty() {
            summary.unmatched += 1;
            continue;
        }
        if index.has_declared_code(&declared) {
            summary.duplicates += 1;
            continue;
        }

        let claimable = |i: &usize| !index.has_aggregator_code(&parcels[*i].tracking);

        if let Some(i) = exact.get(&declared).copied().filter(claimable) {
            index.insert(make_entry(shipment, &parcels[i], MatchKind::Exact));
            summary.matched_exact += 1;
            continue;
        }

        let fuzzy = fuzzy_candidates(&shipment).into_iter().find_map(|carrier| {
            let rule = carriers::match_rule(&carrier)?;
            by_carrier.get(&carrier)?.iter().copied().find(|i| {
                claimable(i) && rule.matches(&strip_code(&parcels[*i].tracking), &declared)
            })
        });
        match fuzzy {
            Some(i) => {
                index.insert(make_entry(shipment, &parcels[i], MatchKind::Pattern));
                summary.matched_pattern += 1;
            }
            None => summary.unmatched += 1,
        }
    }

    summary.matched = index.len();
    for entry in index.entries() {
        *summary.by_carrier.entry(entry.carrier.clone()).or_default() += 1;
    }

    let cache = ParcelCache::from_parcels(built_at, &parcels);
    IndexSnapshot { summary, index, cache }
}

/// Carriers a shipment may be fuzzily matched under
///
/// A recognized hint pins the carrier (no fuzzy pass for exact-only
/// carriers); without one every fuzzy carrier is tried in catalog order.
fn fuzzy_candidates(shipment: &ShipmentRecord) -> Vec<Carrier> {
    match shipment.carrier_hint.as_deref().and_then(carriers::from_hint) {
        Some(carrier) if carriers::match_rule(&carrier).is_some() => vec![carrier],
        Some(_) => Vec::new(),
        None => carriers::fuzzy_carriers().collect(),
    }
}

fn make_entry(shipment: ShipmentRecord, parcel: &ParcelRecord, kind: MatchKind) -> CorrelationEntry {
    CorrelationEntry {
        aggregator_code: parcel.tracking.clone(),
        declared_code: shipment.declared_code.clone(),
        carrier: parcel.carrier.clone().unwrap_or_else(|| Carrier::new("UNKNOWN")),
        match_kind: kind,
        shipment,
        parcel: parcel.clone(),
    }
}
