//! Consolidation service - scans, pallets, pickups and manifests
//!
//! Wraps `ConsolidationState` with:
//! - per-carrier lanes serializing mutations for one carrier, held across
//!   resolution and order-system calls
//! - transactional commits (mutate a draft, persist it, then install)
//! - rejection accounting and structured logs
//!
//! Read accessors take the state lock briefly and return owned copies.

mod handlers;

use crate::domain::consolidation::{
    ConsolidationState, Manifest, Package, Pallet, PalletCheck, PalletsForDay, Pickup, PickupDocument,
    SearchResults, Session, SessionOverview, Stats,
};
use crate::domain::error::Rejection;
use crate::domain::types::{Carrier, Provenance, ShipmentId, ShipmentRecord};
use crate::infra::metrics::Metrics;
use crate::infra::store::StateStore;
use crate::io::order_system::OrderSystem;
use crate::services::resolver::{Resolution, ResolutionEngine};
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Shortest accepted free-text search term
pub const MIN_SEARCH_LEN: usize = 3;

/// Accepted scan
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanAccepted {
    pub carrier: Carrier,
    pub package: Package,
    pub session_size: usize,
    pub provenance: Provenance,
}

/// Operator-entered package, used when a scan could not be verified
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ManualEntry {
    pub tracking: String,
    pub carrier: String,
    #[serde(default)]
    pub shipment_id: Option<ShipmentId>,
    #[serde(default)]
    pub order_ref: Option<String>,
    #[serde(default)]
    pub customer_name: Option<String>,
}

/// Order-system shipment found by customer or order reference
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientSearchHit {
    pub shipment: ShipmentRecord,
    /// Carrier recognized from the shipment's hint
    pub carrier: Option<Carrier>,
    /// Already in a session or a pallet
    pub already_scanned: bool,
    pub expedited: bool,
}

type Lane = Arc<tokio::sync::Mutex<()>>;

pub struct Consolidator {
    pub(crate) state: RwLock<ConsolidationState>,
    lanes: Mutex<FxHashMap<Carrier, Lane>>,
    pub(crate) store: Arc<dyn StateStore>,
    pub(crate) resolver: Arc<ResolutionEngine>,
    pub(crate) orders: Arc<dyn OrderSystem>,
    pub(crate) metrics: Arc<Metrics>,
    client_lookback_days: u32,
}

impl Consolidator {
    /// Load persisted state and wire the collaborators
    pub fn open(
        store: Arc<dyn StateStore>,
        resolver: Arc<ResolutionEngine>,
        orders: Arc<dyn OrderSystem>,
        metrics: Arc<Metrics>,
        client_lookback_days: u32,
    ) -> anyhow::Result<Self> {
        let state = store.load()?;
        info!(
            sessions = state.sessions.len(),
            pallets = state.pallets.len(),
            pickups = state.pickups.len(),
            manifests = state.manifests.len(),
            "consolidation_state_loaded"
        );
        Ok(Self {
            state: RwLock::new(state),
            lanes: Mutex::new(FxHashMap::default()),
            store,
            resolver,
            orders,
            metrics,
            client_lookback_days,
        })
    }

    pub(crate) fn lane(&self, carrier: &Carrier) -> Lane {
        self.lanes.lock().entry(carrier.clone()).or_default().clone()
    }

    /// Apply `op` to a draft, persist it and install it
    ///
    /// On any error the installed state is untouched.
    pub(crate) fn commit<T>(
        &self,
        op: impl FnOnce(&mut ConsolidationState) -> Result<T, Rejection>,
    ) -> Result<T, Rejection> {
        let mut state = self.state.write();
        let mut draft = state.clone();
        let out = op(&mut draft)?;
        if let Err(e) = self.store.save(&draft) {
            error!(error = %format!("{e:#}"), "state_persist_failed");
            return Err(Rejection::Persistence(format!("{e:#}")));
        }
        *state = draft;
        Ok(out)
    }

    /// Count and log a rejected operation
    pub(crate) fn reject(&self, op: &'static str, rejection: Rejection) -> Rejection {
        self.metrics.record_rejection(&rejection);
        warn!(op = op, kind = rejection.kind(), reason = %rejection, "operation_rejected");
        rejection
    }

    pub(crate) fn checked<T>(&self, op: &'static str, result: Result<T, Rejection>) -> Result<T, Rejection> {
        result.map_err(|r| self.reject(op, r))
    }

    pub async fn resolve(&self, scanned: &str) -> Resolution {
        self.resolver.resolve(scanned).await
    }

    // --- Read accessors ---

    pub fn session(&self, carrier: &str) -> Session {
        let carrier = Carrier::new(carrier);
        self.state.read().session(&carrier).cloned().unwrap_or_else(|| Session::new(Utc::now()))
    }

    pub fn sessions_overview(&self) -> Vec<SessionOverview> {
        self.state.read().sessions_overview()
    }

    pub fn pallet(&self, pallet_id: &str) -> Option<Pallet> {
        self.state.read().pallets.get(pallet_id).cloned()
    }

    pub fn check_pallet_for_pickup(&self, pallet_id: &str, expected: &str) -> Result<PalletCheck, Rejection> {
        let result = parse_carrier(expected)
            .and_then(|carrier| self.state.read().check_pallet_for_pickup(pallet_id.trim(), &carrier));
        self.checked("check_pallet_for_pickup", result)
    }

    pub fn pallets_for_day(&self, date: NaiveDate) -> PalletsForDay {
        self.state.read().pallets_for_day(date)
    }

    pub fn pickup(&self, pickup_id: &str) -> Option<Pickup> {
        self.state.read().pickups.get(pickup_id).cloned()
    }

    pub fn manifest(&self, pickup_id: &str) -> Option<Manifest> {
        self.state.read().manifests.get(pickup_id).cloned()
    }

    pub fn documents(&self, date: Option<NaiveDate>) -> Vec<PickupDocument> {
        self.state.read().documents(date)
    }

    pub fn stats(&self, today: NaiveDate) -> Stats {
        self.state.read().stats(today)
    }

    pub fn search(&self, query: &str) -> Result<SearchResults, Rejection> {
        let result = check_term(query).map(|q| self.state.read().search(q));
        self.checked("search", result)
    }
}

/// Non-blank carrier from operator input
pub(crate) fn parse_carrier(raw: &str) -> Result<Carrier, Rejection> {
    let carrier = Carrier::new(raw);
    if carrier.as_str().is_empty() {
        return Err(Rejection::InvalidInput("carrier is required".to_string()));
    }
    Ok(carrier)
}

pub(crate) fn check_term(term: &str) -> Result<&str, Rejection> {
    let term = term.trim();
    if term.chars().count() < MIN_SEARCH_LEN {
        return Err(Rejection::InvalidInput(format!(
            "search term must have at least {MIN_SEARCH_LEN} characters"
        )));
    }
    Ok(term)
}

/// Order references look like `SO1234`, `DF0042`, `S00017`
pub(crate) fn looks_like_order_ref(term: &str) -> bool {
    let upper = term.trim().to_uppercase();
    ["DF", "SO", "PO", "WH", "S"].iter().any(|prefix| {
        upper
            .strip_prefix(prefix)
            .and_then(|rest| rest.chars().next())
            .is_some_and(|c| c.is_ascii_digit())
    })
}

pub(crate) fn package_from(
    tracking: &str,
    shipment: Option<&ShipmentRecord>,
    now: DateTime<Utc>,
    manual: bool,
) -> Package {
    Package {
        tracking: tracking.to_string(),
        shipment_id: shipment.map(|s| s.id),
        shipment_name: shipment.map(|s| s.name.clone()).unwrap_or_default(),
        order_ref: shipment.map(|s| s.order_ref.clone()).unwrap_or_default(),
        customer_name: shipment.map(|s| s.customer_name.clone()).unwrap_or_default(),
        scanned_at: now,
        manual,
    }
}
