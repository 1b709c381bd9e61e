//! Mutating consolidation operations

use super::{
    check_term, looks_like_order_ref, package_from, parse_carrier, ClientSearchHit, Consolidator, ManualEntry,
    ScanAccepted,
};
use crate::domain::consolidation::{
    ExpeditionSync, Manifest, Package, Pallet, PalletDeletion, Pickup, PickupDeletion, Signatures,
};
use crate::domain::error::{Rejection, Upstream};
use crate::domain::types::{normalize_code, Carrier, ShipmentId};
use crate::services::carriers;
use crate::services::resolver::Resolution;
use chrono::{Duration, Utc};
use std::collections::HashSet;
use tracing::{info, warn};

impl Consolidator {
    /// Accept a scanned code into the carrier's session
    pub async fn scan(&self, code: &str, expected: &str) -> Result<ScanAccepted, Rejection> {
        let result = self.scan_inner(code, expected).await;
        self.checked("scan", result)
    }

    async fn scan_inner(&self, code: &str, expected: &str) -> Result<ScanAccepted, Rejection> {
        let carrier = parse_carrier(expected)?;
        let code = required_code(code)?;

        let lane = self.lane(&carrier);
        let _lane = lane.lock().await;

        if self.state.read().session_contains(&carrier, &code) {
            return Err(Rejection::Duplicate { code });
        }

        let (shipment, provenance) = match self.resolver.resolve(&code).await {
            Resolution::Resolved { shipment, carrier: detected, provenance } => {
                if detected != carrier {
                    return Err(Rejection::CarrierMismatch { detected, expected: carrier });
                }
                (shipment, provenance)
            }
            Resolution::Unverified { shipment } => {
                return Err(Rejection::Unverified { code, shipment: Box::new(shipment) });
            }
            Resolution::NotFound { order_system_error: Some(reason) } => {
                return Err(Rejection::UpstreamUnavailable(reason));
            }
            Resolution::NotFound { order_system_error: None } => {
                return Err(Rejection::NotFound { code });
            }
        };

        let now = Utc::now();
        let package = package_from(&code, Some(&shipment), now, false);
        let session_size = self.commit(|state| state.add_package(&carrier, package.clone(), now))?;

        self.metrics.record_scan_accepted();
        info!(
            carrier = %carrier,
            tracking = %code,
            shipment = %shipment.name,
            provenance = provenance.as_str(),
            session_size = session_size,
            "scan_accepted"
        );
        Ok(ScanAccepted { carrier, package, session_size, provenance })
    }

    /// Add a package the operator vouches for
    ///
    /// Skips the unverified-carrier check but still refuses duplicates and a
    /// carrier the resolver positively detected as different.
    pub async fn manual_add(&self, entry: ManualEntry) -> Result<ScanAccepted, Rejection> {
        let result = self.manual_add_inner(entry).await;
        self.checked("manual_add", result)
    }

    async fn manual_add_inner(&self, entry: ManualEntry) -> Result<ScanAccepted, Rejection> {
        let carrier = parse_carrier(&entry.carrier)?;
        let code = required_code(&entry.tracking)?;

        let lane = self.lane(&carrier);
        let _lane = lane.lock().await;

        if self.state.read().session_contains(&carrier, &code) {
            return Err(Rejection::Duplicate { code });
        }

        let resolution = self.resolver.resolve(&code).await;
        if let Some(detected) = resolution.carrier() {
            if detected != &carrier {
                return Err(Rejection::CarrierMismatch { detected: detected.clone(), expected: carrier });
            }
        }

        let now = Utc::now();
        let mut package = package_from(&code, resolution.shipment(), now, true);
        if entry.shipment_id.is_some() {
            package.shipment_id = entry.shipment_id;
        }
        if let Some(order_ref) = non_blank(entry.order_ref) {
            package.order_ref = order_ref;
        }
        if let Some(customer) = non_blank(entry.customer_name) {
            package.customer_name = customer;
        }

        let session_size = self.commit(|state| state.add_package(&carrier, package.clone(), now))?;

        self.metrics.record_scan_accepted();
        info!(
            carrier = %carrier,
            tracking = %code,
            provenance = resolution.provenance().as_str(),
            session_size = session_size,
            "manual_package_added"
        );
        Ok(ScanAccepted {
            carrier,
            package,
            session_size,
            provenance: resolution.provenance(),
        })
    }

    pub async fn remove_package(&self, carrier: &str, code: &str) -> Result<Package, Rejection> {
        let result = self.remove_package_inner(carrier, code).await;
        self.checked("remove_package", result)
    }

    async fn remove_package_inner(&self, carrier: &str, code: &str) -> Result<Package, Rejection> {
        let carrier = parse_carrier(carrier)?;
        let code = required_code(code)?;
        let lane = self.lane(&carrier);
        let _lane = lane.lock().await;
        let removed = self.commit(|state| state.remove_package(&carrier, &code, Utc::now()))?;
        info!(carrier = %carrier, tracking = %code, "package_removed");
        Ok(removed)
    }

    pub async fn clear_session(&self, carrier: &str) -> Result<usize, Rejection> {
        let result = self.clear_session_inner(carrier).await;
        self.checked("clear_session", result)
    }

    async fn clear_session_inner(&self, carrier: &str) -> Result<usize, Rejection> {
        let carrier = parse_carrier(carrier)?;
        let lane = self.lane(&carrier);
        let _lane = lane.lock().await;
        let dropped = self.commit(|state| Ok(state.clear_session(&carrier, Utc::now())))?;
        info!(carrier = %carrier, dropped = dropped, "session_cleared");
        Ok(dropped)
    }

    /// Drain the carrier's session into a new pallet
    pub async fn create_pallet(&self, carrier: &str) -> Result<Pallet, Rejection> {
        let result = self.create_pallet_inner(carrier).await;
        self.checked("create_pallet", result)
    }

    async fn create_pallet_inner(&self, carrier: &str) -> Result<Pallet, Rejection> {
        let carrier = parse_carrier(carrier)?;
        let lane = self.lane(&carrier);
        let _lane = lane.lock().await;
        let pallet = self.commit(|state| state.create_pallet(&carrier, Utc::now()))?;
        self.metrics.record_pallet_created();
        info!(
            pallet = %pallet.id,
            carrier = %carrier,
            packages = pallet.total_packages,
            "pallet_created"
        );
        Ok(pallet)
    }

    /// Hand pending pallets to the carrier and stamp the expedition date
    ///
    /// The order-system write-back runs after the pickup is committed; its
    /// outcome is recorded on the pickup and never undoes it.
    pub async fn create_pickup(&self, carrier: &str, pallet_ids: &[String]) -> Result<Pickup, Rejection> {
        let result = self.create_pickup_inner(carrier, pallet_ids).await;
        self.checked("create_pickup", result)
    }

    async fn create_pickup_inner(&self, carrier: &str, pallet_ids: &[String]) -> Result<Pickup, Rejection> {
        let carrier = parse_carrier(carrier)?;
        let lane = self.lane(&carrier);
        let _lane = lane.lock().await;

        let now = Utc::now();
        let pickup = self.commit(|state| state.create_pickup(&carrier, pallet_ids, now))?;
        self.metrics.record_pickup_created();
        info!(
            pickup = %pickup.id,
            carrier = %carrier,
            pallets = pickup.total_pallets,
            packages = pickup.total_packages,
            "pickup_created"
        );

        let ids = self.state.read().pickup_shipment_ids(&pickup.id);
        let sync = match self.orders.set_expedition_date(&ids, now.date_naive()).await {
            Ok(updated) => {
                info!(pickup = %pickup.id, shipments = updated, "expedition_date_set");
                ExpeditionSync::Updated { shipments: updated }
            }
            Err(e) => {
                self.metrics.record_expedition_sync_failure();
                self.metrics.record_upstream_failure(Upstream::OrderSystem);
                warn!(pickup = %pickup.id, shipments = ids.len(), error = %e, "expedition_date_failed");
                ExpeditionSync::Failed { reason: e.to_string() }
            }
        };

        let id = pickup.id.clone();
        match self.commit(|state| {
            state.set_expedition_sync(&id, sync.clone());
            Ok(state.pickups.get(&id).cloned())
        }) {
            Ok(Some(updated)) => Ok(updated),
            Ok(None) => Ok(Pickup { expedition_sync: sync, ..pickup }),
            Err(e) => {
                // the pickup itself is committed; only the sync note is lost
                warn!(pickup = %id, error = %e, "expedition_sync_not_recorded");
                Ok(Pickup { expedition_sync: sync, ..pickup })
            }
        }
    }

    pub async fn sign_pickup(&self, pickup_id: &str, signatures: Signatures) -> Result<Manifest, Rejection> {
        let result = self.sign_pickup_inner(pickup_id, signatures).await;
        self.checked("sign_pickup", result)
    }

    async fn sign_pickup_inner(&self, pickup_id: &str, signatures: Signatures) -> Result<Manifest, Rejection> {
        let carrier = self.pickup_carrier(pickup_id)?;
        let lane = self.lane(&carrier);
        let _lane = lane.lock().await;
        let manifest = self.commit(|state| state.sign_pickup(pickup_id, signatures, Utc::now()))?;
        self.metrics.record_manifest_signed();
        info!(
            pickup = %pickup_id,
            carrier = %carrier,
            driver = %manifest.driver.name,
            "pickup_signed"
        );
        Ok(manifest)
    }

    /// Remove a pickup and put its pallets back to pending
    pub async fn undo_pickup(&self, pickup_id: &str) -> Result<PickupDeletion, Rejection> {
        let result = self.remove_pickup(pickup_id, false).await;
        self.checked("undo_pickup", result)
    }

    pub async fn delete_pickup(&self, pickup_id: &str, delete_pallets: bool) -> Result<PickupDeletion, Rejection> {
        let result = self.remove_pickup(pickup_id, delete_pallets).await;
        self.checked("delete_pickup", result)
    }

    async fn remove_pickup(&self, pickup_id: &str, delete_pallets: bool) -> Result<PickupDeletion, Rejection> {
        let carrier = self.pickup_carrier(pickup_id)?;
        let lane = self.lane(&carrier);
        let _lane = lane.lock().await;
        let deletion = self.commit(|state| {
            if delete_pallets {
                state.delete_pickup(pickup_id, true)
            } else {
                state.undo_pickup(pickup_id)
            }
        })?;
        info!(
            pickup = %pickup_id,
            carrier = %carrier,
            reverted = deletion.pallets_reverted.len(),
            deleted = deletion.pallets_deleted.len(),
            manifest_removed = deletion.manifest_removed,
            "pickup_removed"
        );
        Ok(deletion)
    }

    /// Delete a pallet; an emptied pickup goes with it
    pub async fn delete_pallet(&self, pallet_id: &str) -> Result<PalletDeletion, Rejection> {
        let result = self.delete_pallet_inner(pallet_id).await;
        self.checked("delete_pallet", result)
    }

    async fn delete_pallet_inner(&self, pallet_id: &str) -> Result<PalletDeletion, Rejection> {
        let carrier = self
            .state
            .read()
            .pallets
            .get(pallet_id)
            .map(|p| p.carrier.clone())
            .ok_or_else(|| Rejection::InvalidInput(format!("pallet {pallet_id} does not exist")))?;
        let lane = self.lane(&carrier);
        let _lane = lane.lock().await;
        let deletion = self.commit(|state| state.delete_pallet(pallet_id))?;
        info!(
            pallet = %pallet_id,
            carrier = %carrier,
            pickup_updated = deletion.pickup_updated.as_deref().unwrap_or("-"),
            pickup_removed = deletion.pickup_removed.as_deref().unwrap_or("-"),
            "pallet_deleted"
        );
        Ok(deletion)
    }

    /// Look up recent shipments by order reference or customer name
    ///
    /// Terms shaped like an order reference search references first; either
    /// way the other field is tried when nothing matches.
    pub async fn search_client(&self, term: &str) -> Result<Vec<ClientSearchHit>, Rejection> {
        let result = self.search_client_inner(term).await;
        self.checked("search_client", result)
    }

    async fn search_client_inner(&self, term: &str) -> Result<Vec<ClientSearchHit>, Rejection> {
        let term = check_term(term)?;
        let since = (Utc::now() - Duration::days(i64::from(self.client_lookback_days))).date_naive();
        let by_reference = looks_like_order_ref(term);

        let unavailable = |e: crate::domain::error::UpstreamError| {
            self.metrics.record_upstream_failure(Upstream::OrderSystem);
            Rejection::UpstreamUnavailable(e.to_string())
        };
        let first = if by_reference {
            self.orders.find_by_order_reference(term, since).await
        } else {
            self.orders.find_by_customer_name(term, since).await
        }
        .map_err(unavailable)?;
        let shipments = if first.is_empty() {
            if by_reference {
                self.orders.find_by_customer_name(term, since).await
            } else {
                self.orders.find_by_order_reference(term, since).await
            }
            .map_err(unavailable)?
        } else {
            first
        };

        let (scanned_ids, scanned_codes) = self.scanned_packages();
        let hits: Vec<ClientSearchHit> = shipments
            .into_iter()
            .map(|shipment| ClientSearchHit {
                carrier: shipment.carrier_hint.as_deref().and_then(carriers::from_hint),
                already_scanned: scanned_ids.contains(&shipment.id)
                    || scanned_codes.contains(&normalize_code(&shipment.declared_code)),
                expedited: shipment.expedition_date.is_some(),
                shipment,
            })
            .collect();
        info!(term = %term, by_reference = by_reference, hits = hits.len(), "client_search");
        Ok(hits)
    }

    /// Shipment ids in a session or on a pallet, plus tracking codes of
    /// packages without a shipment id
    fn scanned_packages(&self) -> (HashSet<ShipmentId>, HashSet<String>) {
        let state = self.state.read();
        let mut ids = HashSet::new();
        let mut codes = HashSet::new();
        let packages = state
            .sessions
            .values()
            .flat_map(|s| s.packages.iter())
            .chain(state.pallets.values().flat_map(|p| p.packages.iter()));
        for package in packages {
            match package.shipment_id {
                Some(id) => {
                    ids.insert(id);
                }
                None => {
                    codes.insert(package.tracking.clone());
                }
            }
        }
        (ids, codes)
    }

    fn pickup_carrier(&self, pickup_id: &str) -> Result<Carrier, Rejection> {
        self.state
            .read()
            .pickups
            .get(pickup_id)
            .map(|p| p.carrier.clone())
            .ok_or_else(|| Rejection::InvalidInput(format!("pickup {pickup_id} does not exist")))
    }
}

fn required_code(raw: &str) -> Result<String, Rejection> {
    let code = normalize_code(raw);
    if code.is_empty() {
        return Err(Rejection::InvalidInput("tracking code is required".to_string()));
    }
    Ok(code)
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}
