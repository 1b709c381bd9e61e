//! Consolidation model - sessions, pallets, pickups and manifests
//!
//! `ConsolidationState` holds every persisted entity and implements the
//! state transitions as pure, synchronous methods. Callers mutate a draft
//! copy and only install it once it has been persisted, so a method that
//! returns `Err` may leave its receiver partially modified.
//!
//! Lifecycle:
//! ```text
//! Session (empty <-> has packages)
//!    | create_pallet (drains)
//! Pallet pending --create_pickup--> picked_up --undo/delete pickup--> pending
//!                                        |
//!                         Pickup pending_signature --sign--> signed (Manifest)
//! ```

use crate::domain::error::Rejection;
use crate::domain::types::{Carrier, ShipmentId};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One scanned package
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Package {
    pub tracking: String,
    #[serde(default)]
    pub shipment_id: Option<ShipmentId>,
    #[serde(default)]
    pub shipment_name: String,
    #[serde(default)]
    pub order_ref: String,
    #[serde(default)]
    pub customer_name: String,
    pub scanned_at: DateTime<Utc>,
    #[serde(default)]
    pub manual: bool,
}

/// Per-carrier scan session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "SessionRecord")]
pub struct Session {
    pub packages: Vec<Package>,
    pub last_update: DateTime<Utc>,
}

impl Session {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { packages: Vec::new(), last_update: now }
    }

    pub fn contains(&self, tracking: &str) -> bool {
        self.packages.iter().any(|p| p.tracking == tracking)
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    /// Append a package; returns false (and changes nothing) on a duplicate code
    pub fn add(&mut self, package: Package) -> bool {
        if self.contains(&package.tracking) {
            return false;
        }
        self.last_update = package.scanned_at;
        self.packages.push(package);
        true
    }

    pub fn remove(&mut self, tracking: &str, now: DateTime<Utc>) -> Option<Package> {
        let pos = self.packages.iter().position(|p| p.tracking == tracking)?;
        self.last_update = now;
        Some(self.packages.remove(pos))
    }

    pub fn clear(&mut self, now: DateTime<Utc>) {
        self.packages.clear();
        self.last_update = now;
    }
}

/// On-disk session shapes. Older files nested packages under pallets.
#[derive(Deserialize)]
#[serde(untagged)]
enum SessionRecord {
    Flat {
        packages: Vec<Package>,
        #[serde(default)]
        last_update: Option<DateTime<Utc>>,
    },
    Nested {
        pallets: Vec<LegacyPallet>,
        #[serde(default)]
        last_update: Option<DateTime<Utc>>,
    },
}

#[derive(Deserialize)]
struct LegacyPallet {
    #[serde(default)]
    packages: Vec<Package>,
}

impl From<SessionRecord> for Session {
    fn from(record: SessionRecord) -> Self {
        let (packages, last_update) = match record {
            SessionRecord::Flat { packages, last_update } => (packages, last_update),
            SessionRecord::Nested { pallets, last_update } => {
                (pallets.into_iter().flat_map(|p| p.packages).collect(), last_update)
            }
        };
        let mut session = Session::new(last_update.unwrap_or_else(Utc::now));
        for package in packages {
            let at = session.last_update;
            session.add(package);
            session.last_update = at;
        }
        session
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PalletStatus {
    Pending,
    PickedUp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pallet {
    pub id: String,
    pub carrier: Carrier,
    pub packages: Vec<Package>,
    pub total_packages: usize,
    pub date: NaiveDate,
    pub created_at: DateTime<Utc>,
    pub status: PalletStatus,
    #[serde(default)]
    pub pickup_id: Option<String>,
    #[serde(default)]
    pub picked_up_at: Option<DateTime<Utc>>,
}

impl Pallet {
    fn revert_to_pending(&mut self) {
        self.status = PalletStatus::Pending;
        self.pickup_id = None;
        self.picked_up_at = None;
    }

    pub fn shipment_ids(&self) -> impl Iterator<Item = ShipmentId> + '_ {
        self.packages.iter().filter_map(|p| p.shipment_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PickupStatus {
    PendingSignature,
    Signed,
}

/// Outcome of the expedition-date write-back for a pickup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ExpeditionSync {
    Pending,
    Updated { shipments: usize },
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pickup {
    pub id: String,
    pub carrier: Carrier,
    pub pallet_ids: Vec<String>,
    pub total_pallets: usize,
    pub total_packages: usize,
    pub date: NaiveDate,
    pub created_at: DateTime<Utc>,
    pub status: PickupStatus,
    #[serde(default)]
    pub signed_at: Option<DateTime<Utc>>,
    #[serde(default = "default_expedition_sync")]
    pub expedition_sync: ExpeditionSync,
}

fn default_expedition_sync() -> ExpeditionSync {
    ExpeditionSync::Pending
}

/// Carrier driver identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverIdentity {
    pub name: String,
    pub document: String,
}

/// Input to `sign_pickup`; images are opaque encoded strings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signatures {
    pub driver_signature: String,
    pub driver: DriverIdentity,
    #[serde(default)]
    pub warehouse_signature: Option<String>,
    #[serde(default)]
    pub warehouse_signer: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub pickup_id: String,
    pub driver_signature: String,
    pub driver: DriverIdentity,
    #[serde(default)]
    pub warehouse_signature: Option<String>,
    #[serde(default)]
    pub warehouse_signer: Option<String>,
    pub signed_at: DateTime<Utc>,
}

/// Result of deleting a pallet
#[derive(Debug, Clone, PartialEq)]
pub struct PalletDeletion {
    pub pallet: Pallet,
    /// Pickup the pallet was detached from, if it survived
    pub pickup_updated: Option<String>,
    /// Pickup removed because it lost its last pallet
    pub pickup_removed: Option<String>,
}

/// Result of deleting a pickup
#[derive(Debug, Clone, PartialEq)]
pub struct PickupDeletion {
    pub pickup: Pickup,
    pub pallets_reverted: Vec<String>,
    pub pallets_deleted: Vec<String>,
    pub manifest_removed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionOverview {
    pub carrier: Carrier,
    pub packages: usize,
    pub last_update: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PalletCheck {
    pub pallet_id: String,
    pub carrier: Carrier,
    pub total_packages: usize,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct CarrierPallets {
    pub total: usize,
    pub total_packages: usize,
    pub pending: Vec<Pallet>,
    pub picked_up: Vec<Pallet>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct DaySummary {
    pub total_pallets: usize,
    pub total_packages: usize,
    pub pending_pallets: usize,
    pub picked_up_pallets: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PalletsForDay {
    pub date: NaiveDate,
    pub carriers: BTreeMap<Carrier, CarrierPallets>,
    pub summary: DaySummary,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PickupDocument {
    pub pickup: Pickup,
    pub manifest: Option<Manifest>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Stats {
    pub pallets_today: usize,
    pub packages_today: usize,
    pub packages_in_sessions: usize,
    pub pending_pallets: usize,
    pub picked_up_pallets: usize,
    pub pickups_today: usize,
    pub signed_manifests_today: usize,
}

/// A package found inside a pallet
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PackageHit {
    pub pallet_id: String,
    pub carrier: Carrier,
    pub package: Package,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct SearchResults {
    pub pallets: Vec<Pallet>,
    pub packages: Vec<PackageHit>,
    pub pickups: Vec<Pickup>,
}

impl SearchResults {
    pub fn is_empty(&self) -> bool {
        self.pallets.is_empty() && self.packages.is_empty() && self.pickups.is_empty()
    }
}

/// Every persisted consolidation entity
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ConsolidationState {
    #[serde(default)]
    pub sessions: BTreeMap<Carrier, Session>,
    #[serde(default)]
    pub pallets: BTreeMap<String, Pallet>,
    #[serde(default)]
    pub pickups: BTreeMap<String, Pickup>,
    #[serde(default)]
    pub manifests: BTreeMap<String, Manifest>,
}

/// Next sequence number for ids shaped `{prefix}{NNN}`
fn next_sequence<'a>(ids: impl Iterator<Item = &'a String>, prefix: &str) -> u32 {
    ids.filter_map(|id| id.strip_prefix(prefix))
        .filter_map(|seq| seq.parse::<u32>().ok())
        .max()
        .unwrap_or(0)
        + 1
}

impl ConsolidationState {
    pub fn session(&self, carrier: &Carrier) -> Option<&Session> {
        self.sessions.get(carrier)
    }

    /// Lazily create the carrier's session
    pub fn session_mut(&mut self, carrier: &Carrier, now: DateTime<Utc>) -> &mut Session {
        self.sessions.entry(carrier.clone()).or_insert_with(|| Session::new(now))
    }

    pub fn session_contains(&self, carrier: &Carrier, tracking: &str) -> bool {
        self.sessions.get(carrier).is_some_and(|s| s.contains(tracking))
    }

    /// Append a package to the carrier's session, returning the new size
    pub fn add_package(
        &mut self,
        carrier: &Carrier,
        package: Package,
        now: DateTime<Utc>,
    ) -> Result<usize, Rejection> {
        let code = package.tracking.clone();
        let session = self.session_mut(carrier, now);
        if !session.add(package) {
            return Err(Rejection::Duplicate { code });
        }
        Ok(session.len())
    }

    pub fn remove_package(
        &mut self,
        carrier: &Carrier,
        tracking: &str,
        now: DateTime<Utc>,
    ) -> Result<Package, Rejection> {
        self.sessions
            .get_mut(carrier)
            .and_then(|s| s.remove(tracking, now))
            .ok_or_else(|| {
                Rejection::InvalidState(format!("package {tracking} is not in the {carrier} session"))
            })
    }

    /// Empty the carrier's session, returning how many packages were dropped
    pub fn clear_session(&mut self, carrier: &Carrier, now: DateTime<Utc>) -> usize {
        match self.sessions.get_mut(carrier) {
            Some(session) => {
                let dropped = session.len();
                session.clear(now);
                dropped
            }
            None => 0,
        }
    }

    /// Drain the carrier's session into a new pending pallet
    pub fn create_pallet(&mut self, carrier: &Carrier, now: DateTime<Utc>) -> Result<Pallet, Rejection> {
        let packages = match self.sessions.get_mut(carrier) {
            Some(session) if !session.is_empty() => {
                let packages = std::mem::take(&mut session.packages);
                session.last_update = now;
                packages
            }
            _ => {
                return Err(Rejection::InvalidState(format!(
                    "no packages in the {carrier} session"
                )))
            }
        };

        let prefix = format!("{carrier}-{}-", now.format("%Y%m%d"));
        let seq = next_sequence(self.pallets.keys(), &prefix);
        let pallet = Pallet {
            id: format!("{prefix}{seq:03}"),
            carrier: carrier.clone(),
            total_packages: packages.len(),
            packages,
            date: now.date_naive(),
            created_at: now,
            status: PalletStatus::Pending,
            pickup_id: None,
            picked_up_at: None,
        };
        self.pallets.insert(pallet.id.clone(), pallet.clone());
        Ok(pallet)
    }

    /// Pre-flight check for adding a pallet to a pickup
    pub fn check_pallet_for_pickup(
        &self,
        pallet_id: &str,
        expected: &Carrier,
    ) -> Result<PalletCheck, Rejection> {
        let pallet = self
            .pallets
            .get(pallet_id)
            .ok_or_else(|| Rejection::InvalidInput(format!("pallet {pallet_id} does not exist")))?;
        if &pallet.carrier != expected {
            return Err(Rejection::CarrierMismatch {
                detected: pallet.carrier.clone(),
                expected: expected.clone(),
            });
        }
        if pallet.status != PalletStatus::Pending {
            return Err(Rejection::InvalidState(format!(
                "pallet {pallet_id} was already picked up"
            )));
        }
        Ok(PalletCheck {
            pallet_id: pallet.id.clone(),
            carrier: pallet.carrier.clone(),
            total_packages: pallet.total_packages,
        })
    }

    /// Move the eligible pallets into a new pickup
    ///
    /// Missing pallets, pallets of another carrier and pallets that are not
    /// pending are skipped.
    pub fn create_pickup(
        &mut self,
        carrier: &Carrier,
        pallet_ids: &[String],
        now: DateTime<Utc>,
    ) -> Result<Pickup, Rejection> {
        if pallet_ids.is_empty() {
            return Err(Rejection::InvalidState("no pallets selected".to_string()));
        }

        let mut eligible: Vec<String> = Vec::with_capacity(pallet_ids.len());
        for id in pallet_ids {
            let ok = self
                .pallets
                .get(id)
                .is_some_and(|p| &p.carrier == carrier && p.status == PalletStatus::Pending);
            if ok && !eligible.contains(id) {
                eligible.push(id.clone());
            }
        }
        if eligible.is_empty() {
            return Err(Rejection::InvalidState(format!(
                "none of the selected pallets are pending {carrier} pallets"
            )));
        }

        let prefix = format!("{carrier}-REC-{}-", now.format("%Y%m%d"));
        let seq = next_sequence(self.pickups.keys(), &prefix);
        let pickup_id = format!("{prefix}{seq:03}");

        let mut total_packages = 0;
        for id in &eligible {
            if let Some(pallet) = self.pallets.get_mut(id) {
                pallet.status = PalletStatus::PickedUp;
                pallet.pickup_id = Some(pickup_id.clone());
                pallet.picked_up_at = Some(now);
                total_packages += pallet.total_packages;
            }
        }

        let pickup = Pickup {
            id: pickup_id,
            carrier: carrier.clone(),
            total_pallets: eligible.len(),
            pallet_ids: eligible,
            total_packages,
            date: now.date_naive(),
            created_at: now,
            status: PickupStatus::PendingSignature,
            signed_at: None,
            expedition_sync: ExpeditionSync::Pending,
        };
        self.pickups.insert(pickup.id.clone(), pickup.clone());
        Ok(pickup)
    }

    /// Shipment ids of every package in the pickup's pallets (deduplicated)
    pub fn pickup_shipment_ids(&self, pickup_id: &str) -> Vec<ShipmentId> {
        let mut ids: Vec<ShipmentId> = self
            .pickups
            .get(pickup_id)
            .into_iter()
            .flat_map(|p| p.pallet_ids.iter())
            .filter_map(|id| self.pallets.get(id))
            .flat_map(|p| p.shipment_ids())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    pub fn set_expedition_sync(&mut self, pickup_id: &str, sync: ExpeditionSync) -> bool {
        match self.pickups.get_mut(pickup_id) {
            Some(pickup) => {
                pickup.expedition_sync = sync;
                true
            }
            None => false,
        }
    }

    pub fn sign_pickup(
        &mut self,
        pickup_id: &str,
        signatures: Signatures,
        now: DateTime<Utc>,
    ) -> Result<Manifest, Rejection> {
        if signatures.driver_signature.trim().is_empty() {
            return Err(Rejection::InvalidInput("driver signature is required".to_string()));
        }
        if signatures.driver.name.trim().is_empty() || signatures.driver.document.trim().is_empty()
        {
            return Err(Rejection::InvalidInput(
                "driver name and identity document are required".to_string(),
            ));
        }

        let pickup = self
            .pickups
            .get_mut(pickup_id)
            .ok_or_else(|| Rejection::InvalidInput(format!("pickup {pickup_id} does not exist")))?;
        if pickup.status != PickupStatus::PendingSignature {
            return Err(Rejection::InvalidState(format!("pickup {pickup_id} is already signed")));
        }
        pickup.status = PickupStatus::Signed;
        pickup.signed_at = Some(now);

        let manifest = Manifest {
            pickup_id: pickup_id.to_string(),
            driver_signature: signatures.driver_signature,
            driver: DriverIdentity {
                name: signatures.driver.name.trim().to_string(),
                document: signatures.driver.document.trim().to_string(),
            },
            warehouse_signature: signatures.warehouse_signature.filter(|s| !s.trim().is_empty()),
            warehouse_signer: signatures.warehouse_signer.filter(|s| !s.trim().is_empty()),
            signed_at: now,
        };
        self.manifests.insert(pickup_id.to_string(), manifest.clone());
        Ok(manifest)
    }

    /// Remove a pickup, reverting its pallets to pending
    pub fn undo_pickup(&mut self, pickup_id: &str) -> Result<PickupDeletion, Rejection> {
        self.delete_pickup(pickup_id, false)
    }

    /// Remove a pickup and its manifest; `delete_pallets` also removes the member pallets
    pub fn delete_pickup(
        &mut self,
        pickup_id: &str,
        delete_pallets: bool,
    ) -> Result<PickupDeletion, Rejection> {
        let pickup = self
            .pickups
            .remove(pickup_id)
            .ok_or_else(|| Rejection::InvalidInput(format!("pickup {pickup_id} does not exist")))?;

        let mut reverted = Vec::new();
        let mut deleted = Vec::new();
        for id in &pickup.pallet_ids {
            if delete_pallets {
                if self.pallets.remove(id).is_some() {
                    deleted.push(id.clone());
                }
            } else if let Some(pallet) = self.pallets.get_mut(id) {
                pallet.revert_to_pending();
                reverted.push(id.clone());
            }
        }
        let manifest_removed = self.manifests.remove(pickup_id).is_some();

        Ok(PickupDeletion {
            pickup,
            pallets_reverted: reverted,
            pallets_deleted: deleted,
            manifest_removed,
        })
    }

    /// Delete a pallet, keeping its pickup consistent
    pub fn delete_pallet(&mut self, pallet_id: &str) -> Result<PalletDeletion, Rejection> {
        let pallet = self
            .pallets
            .remove(pallet_id)
            .ok_or_else(|| Rejection::InvalidInput(format!("pallet {pallet_id} does not exist")))?;

        let mut pickup_updated = None;
        let mut pickup_removed = None;
        if let Some(pickup_id) = pallet.pickup_id.as_deref() {
            let now_empty = match self.pickups.get_mut(pickup_id) {
                Some(pickup) => {
                    pickup.pallet_ids.retain(|id| id != pallet_id);
                    pickup.total_pallets = pickup.pallet_ids.len();
                    pickup.total_packages = pickup
                        .pallet_ids
                        .iter()
                        .filter_map(|id| self.pallets.get(id))
                        .map(|p| p.total_packages)
                        .sum();
                    pickup.pallet_ids.is_empty()
                }
                None => false,
            };
            if now_empty {
                self.pickups.remove(pickup_id);
                self.manifests.remove(pickup_id);
                pickup_removed = Some(pickup_id.to_string());
            } else if self.pickups.contains_key(pickup_id) {
                pickup_updated = Some(pickup_id.to_string());
            }
        }

        Ok(PalletDeletion { pallet, pickup_updated, pickup_removed })
    }

    pub fn sessions_overview(&self) -> Vec<SessionOverview> {
        self.sessions
            .iter()
            .filter(|(_, s)| !s.is_empty())
            .map(|(carrier, s)| SessionOverview {
                carrier: carrier.clone(),
                packages: s.len(),
                last_update: s.last_update,
            })
            .collect()
    }

    pub fn pallets_for_day(&self, date: NaiveDate) -> PalletsForDay {
        let mut carriers: BTreeMap<Carrier, CarrierPallets> = BTreeMap::new();
        let mut summary = DaySummary::default();

        for pallet in self.pallets.values().filter(|p| p.date == date) {
            let group = carriers.entry(pallet.carrier.clone()).or_default();
            group.total += 1;
            group.total_packages += pallet.total_packages;
            summary.total_pallets += 1;
            summary.total_packages += pallet.total_packages;
            match pallet.status {
                PalletStatus::Pending => {
                    summary.pending_pallets += 1;
                    group.pending.push(pallet.clone());
                }
                PalletStatus::PickedUp => {
                    summary.picked_up_pallets += 1;
                    group.picked_up.push(pallet.clone());
                }
            }
        }

        for group in carriers.values_mut() {
            group.pending.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            group.picked_up.sort_by_key(|p| std::cmp::Reverse(p.picked_up_at.unwrap_or(p.created_at)));
        }

        PalletsForDay { date, carriers, summary }
    }

    /// Pickups, newest first, with their manifest
    pub fn documents(&self, date: Option<NaiveDate>) -> Vec<PickupDocument> {
        let mut docs: Vec<PickupDocument> = self
            .pickups
            .values()
            .filter(|p| date.map_or(true, |d| p.date == d))
            .map(|p| PickupDocument {
                pickup: p.clone(),
                manifest: self.manifests.get(&p.id).cloned(),
            })
            .collect();
        docs.sort_by(|a, b| b.pickup.created_at.cmp(&a.pickup.created_at));
        docs
    }

    pub fn stats(&self, today: NaiveDate) -> Stats {
        let mut stats = Stats {
            packages_in_sessions: self.sessions.values().map(Session::len).sum(),
            ..Stats::default()
        };
        for pallet in self.pallets.values() {
            if pallet.date == today {
                stats.pallets_today += 1;
                stats.packages_today += pallet.total_packages;
            }
            match pallet.status {
                PalletStatus::Pending => stats.pending_pallets += 1,
                PalletStatus::PickedUp => stats.picked_up_pallets += 1,
            }
        }
        stats.pickups_today = self.pickups.values().filter(|p| p.date == today).count();
        stats.signed_manifests_today =
            self.manifests.values().filter(|m| m.signed_at.date_naive() == today).count();
        stats
    }

    /// Case-insensitive search over pallet ids, pallet contents and pickup ids
    pub fn search(&self, query: &str) -> SearchResults {
        let needle = query.trim().to_uppercase();
        let mut results = SearchResults::default();
        if needle.is_empty() {
            return results;
        }

        for pallet in self.pallets.values() {
            if pallet.id.to_uppercase().contains(&needle) {
                results.pallets.push(pallet.clone());
            }
            for package in &pallet.packages {
                if package.tracking.to_uppercase().contains(&needle)
                    || package.order_ref.to_uppercase().contains(&needle)
                {
                    results.packages.push(PackageHit {
                        pallet_id: pallet.id.clone(),
                        carrier: pallet.carrier.clone(),
                        package: package.clone(),
                    });
                }
            }
        }
        results.pickups = self
            .pickups
            .values()
            .filter(|p| p.id.to_uppercase().contains(&needle))
            .cloned()
            .collect();
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 9, h, m, 0).unwrap()
    }

    fn pkg(code: &str, shipment: i64, when: DateTime<Utc>) -> Package {
        Package {
            tracking: code.to_string(),
            shipment_id: Some(ShipmentId(shipment)),
            shipment_name: format!("WH/OUT/{shipment:05}"),
            order_ref: format!("SO{shipment}"),
            customer_name: "Ana Ruiz".to_string(),
            scanned_at: when,
            manual: false,
        }
    }

    fn gls() -> Carrier {
        Carrier::new("GLS")
    }

    fn state_with_pallet(codes: &[&str]) -> (ConsolidationState, Pallet) {
        let mut state = ConsolidationState::default();
        for (i, code) in codes.iter().enumerate() {
            state.add_package(&gls(), pkg(code, i as i64 + 1, at(9, 0)), at(9, 0)).unwrap();
        }
        let pallet = state.create_pallet(&gls(), at(9, 30)).unwrap();
        (state, pallet)
    }

    #[test]
    fn test_duplicate_add_keeps_size() {
        let mut state = ConsolidationState::default();
        assert_eq!(state.add_package(&gls(), pkg("A1", 1, at(8, 0)), at(8, 0)), Ok(1));
        let err = state.add_package(&gls(), pkg("A1", 1, at(8, 1)), at(8, 1)).unwrap_err();
        assert_eq!(err.kind(), "duplicate");
        assert_eq!(state.session(&gls()).unwrap().len(), 1);
    }

    #[test]
    fn test_remove_and_clear_session() {
        let mut state = ConsolidationState::default();
        state.add_package(&gls(), pkg("A1", 1, at(8, 0)), at(8, 0)).unwrap();
        state.add_package(&gls(), pkg("A2", 2, at(8, 0)), at(8, 0)).unwrap();

        let removed = state.remove_package(&gls(), "A1", at(8, 5)).unwrap();
        assert_eq!(removed.tracking, "A1");
        assert!(state.remove_package(&gls(), "A1", at(8, 5)).is_err());

        assert_eq!(state.clear_session(&gls(), at(8, 6)), 1);
        // cleared, not deleted
        assert!(state.session(&gls()).unwrap().is_empty());
        assert!(state.sessions_overview().is_empty());
    }

    #[test]
    fn test_create_pallet_drains_session() {
        let (state, pallet) = state_with_pallet(&["A1", "A2", "A3"]);
        assert_eq!(pallet.id, "GLS-20260309-001");
        assert_eq!(pallet.total_packages, 3);
        assert_eq!(pallet.status, PalletStatus::Pending);
        assert!(state.session(&gls()).unwrap().is_empty());
    }

    #[test]
    fn test_create_pallet_from_empty_session_fails() {
        let mut state = ConsolidationState::default();
        let err = state.create_pallet(&gls(), at(9, 0)).unwrap_err();
        assert_eq!(err.kind(), "invalid_state");
        assert!(state.pallets.is_empty());
    }

    #[test]
    fn test_pallet_sequence_survives_deletion() {
        let (mut state, first) = state_with_pallet(&["A1"]);
        state.add_package(&gls(), pkg("A2", 2, at(10, 0)), at(10, 0)).unwrap();
        let second = state.create_pallet(&gls(), at(10, 1)).unwrap();
        assert_eq!(second.id, "GLS-20260309-002");

        state.delete_pallet(&first.id).unwrap();
        state.add_package(&gls(), pkg("A3", 3, at(11, 0)), at(11, 0)).unwrap();
        let third = state.create_pallet(&gls(), at(11, 1)).unwrap();
        assert_eq!(third.id, "GLS-20260309-003");
    }

    #[test]
    fn test_create_pickup_only_takes_pending_pallets_of_carrier() {
        let (mut state, p1) = state_with_pallet(&["A1", "A2"]);
        state.add_package(&gls(), pkg("A3", 3, at(10, 0)), at(10, 0)).unwrap();
        let p2 = state.create_pallet(&gls(), at(10, 0)).unwrap();
        let ctt = Carrier::new("CTT");
        state.add_package(&ctt, pkg("C1", 9, at(10, 0)), at(10, 0)).unwrap();
        let foreign = state.create_pallet(&ctt, at(10, 0)).unwrap();

        let first = state.create_pickup(&gls(), &[p1.id.clone()], at(12, 0)).unwrap();
        let pickup = state
            .create_pickup(
                &gls(),
                &[p1.id.clone(), p2.id.clone(), foreign.id.clone(), "GLS-20990101-001".into()],
                at(12, 5),
            )
            .unwrap();

        assert_eq!(first.id, "GLS-REC-20260309-001");
        assert_eq!(pickup.id, "GLS-REC-20260309-002");
        assert_eq!(pickup.pallet_ids, vec![p2.id.clone()]);
        assert_eq!(pickup.total_packages, 1);
        assert_eq!(state.pallets[&foreign.id].status, PalletStatus::Pending);
        assert_eq!(state.pallets[&p1.id].pickup_id.as_deref(), Some(first.id.as_str()));
    }

    #[test]
    fn test_create_pickup_rejects_empty_selection() {
        let (mut state, pallet) = state_with_pallet(&["A1"]);
        assert_eq!(state.create_pickup(&gls(), &[], at(12, 0)).unwrap_err().kind(), "invalid_state");

        state.create_pickup(&gls(), &[pallet.id.clone()], at(12, 0)).unwrap();
        let err = state.create_pickup(&gls(), &[pallet.id.clone()], at(12, 1)).unwrap_err();
        assert_eq!(err.kind(), "invalid_state");
        assert_eq!(state.pickups.len(), 1);
    }

    #[test]
    fn test_undo_pickup_reverts_pallets() {
        let (mut state, pallet) = state_with_pallet(&["A1", "A2"]);
        let pickup = state.create_pickup(&gls(), &[pallet.id.clone()], at(12, 0)).unwrap();
        state.sign_pickup(&pickup.id, signatures(), at(12, 30)).unwrap();

        let undone = state.undo_pickup(&pickup.id).unwrap();
        assert_eq!(undone.pallets_reverted, vec![pallet.id.clone()]);
        assert!(undone.manifest_removed);

        let p = &state.pallets[&pallet.id];
        assert_eq!(p.status, PalletStatus::Pending);
        assert!(p.pickup_id.is_none());
        assert!(state.pickups.is_empty());
        assert!(state.manifests.is_empty());
    }

    #[test]
    fn test_delete_pickup_cascade_removes_pallets() {
        let (mut state, pallet) = state_with_pallet(&["A1"]);
        let pickup = state.create_pickup(&gls(), &[pallet.id.clone()], at(12, 0)).unwrap();
        let deleted = state.delete_pickup(&pickup.id, true).unwrap();
        assert_eq!(deleted.pallets_deleted, vec![pallet.id]);
        assert!(state.pallets.is_empty());
    }

    fn signatures() -> Signatures {
        Signatures {
            driver_signature: "data:image/png;base64,AAAA".to_string(),
            driver: DriverIdentity { name: "Luis Gil".to_string(), document: "12345678Z".to_string() },
            warehouse_signature: None,
            warehouse_signer: Some("Marta".to_string()),
        }
    }

    #[test]
    fn test_sign_pickup_once() {
        let (mut state, pallet) = state_with_pallet(&["A1"]);
        let pickup = state.create_pickup(&gls(), &[pallet.id], at(12, 0)).unwrap();

        let mut missing = signatures();
        missing.driver.document = " ".to_string();
        assert_eq!(state.sign_pickup(&pickup.id, missing, at(12, 1)).unwrap_err().kind(), "invalid_input");
        assert_eq!(state.pickups[&pickup.id].status, PickupStatus::PendingSignature);

        let manifest = state.sign_pickup(&pickup.id, signatures(), at(12, 2)).unwrap();
        assert_eq!(manifest.driver.document, "12345678Z");
        assert_eq!(state.pickups[&pickup.id].status, PickupStatus::Signed);

        let again = state.sign_pickup(&pickup.id, signatures(), at(12, 3)).unwrap_err();
        assert_eq!(again.kind(), "invalid_state");
    }

    #[test]
    fn test_delete_only_pallet_removes_pickup_and_manifest() {
        let (mut state, pallet) = state_with_pallet(&["A1"]);
        let pickup = state.create_pickup(&gls(), &[pallet.id.clone()], at(12, 0)).unwrap();
        state.sign_pickup(&pickup.id, signatures(), at(12, 2)).unwrap();

        let deletion = state.delete_pallet(&pallet.id).unwrap();
        assert_eq!(deletion.pickup_removed.as_deref(), Some(pickup.id.as_str()));
        assert!(state.pickups.is_empty());
        assert!(state.manifests.is_empty());
    }

    #[test]
    fn test_delete_pallet_recomputes_pickup_totals() {
        let (mut state, p1) = state_with_pallet(&["A1", "A2"]);
        state.add_package(&gls(), pkg("A3", 3, at(10, 0)), at(10, 0)).unwrap();
        let p2 = state.create_pallet(&gls(), at(10, 0)).unwrap();
        let pickup =
            state.create_pickup(&gls(), &[p1.id.clone(), p2.id.clone()], at(12, 0)).unwrap();
        assert_eq!(pickup.total_packages, 3);

        let deletion = state.delete_pallet(&p1.id).unwrap();
        assert_eq!(deletion.pickup_updated.as_deref(), Some(pickup.id.as_str()));
        let updated = &state.pickups[&pickup.id];
        assert_eq!(updated.pallet_ids, vec![p2.id]);
        assert_eq!(updated.total_pallets, 1);
        assert_eq!(updated.total_packages, 1);
    }

    #[test]
    fn test_check_pallet_for_pickup() {
        let (mut state, pallet) = state_with_pallet(&["A1"]);
        assert!(state.check_pallet_for_pickup(&pallet.id, &gls()).is_ok());
        let mismatch = state.check_pallet_for_pickup(&pallet.id, &Carrier::new("CTT")).unwrap_err();
        assert_eq!(mismatch.detected_carrier(), Some(&gls()));

        state.create_pickup(&gls(), &[pallet.id.clone()], at(12, 0)).unwrap();
        assert_eq!(
            state.check_pallet_for_pickup(&pallet.id, &gls()).unwrap_err().kind(),
            "invalid_state"
        );
        assert_eq!(state.check_pallet_for_pickup("NOPE", &gls()).unwrap_err().kind(), "invalid_input");
    }

    #[test]
    fn test_pickup_shipment_ids() {
        let (mut state, pallet) = state_with_pallet(&["A1", "A2"]);
        let pickup = state.create_pickup(&gls(), &[pallet.id], at(12, 0)).unwrap();
        assert_eq!(state.pickup_shipment_ids(&pickup.id), vec![ShipmentId(1), ShipmentId(2)]);
        assert!(state.set_expedition_sync(&pickup.id, ExpeditionSync::Updated { shipments: 2 }));
        assert!(!state.set_expedition_sync("missing", ExpeditionSync::Pending));
    }

    #[test]
    fn test_reads() {
        let (mut state, pallet) = state_with_pallet(&["TRK111", "TRK222"]);
        state.add_package(&gls(), pkg("TRK333", 3, at(10, 0)), at(10, 0)).unwrap();
        let pickup = state.create_pickup(&gls(), &[pallet.id.clone()], at(12, 0)).unwrap();
        state.sign_pickup(&pickup.id, signatures(), at(12, 5)).unwrap();
        let day = at(0, 0).date_naive();

        let grouped = state.pallets_for_day(day);
        assert_eq!(grouped.summary.total_pallets, 1);
        assert_eq!(grouped.summary.picked_up_pallets, 1);
        assert_eq!(grouped.carriers[&gls()].picked_up.len(), 1);

        let stats = state.stats(day);
        assert_eq!(stats.pallets_today, 1);
        assert_eq!(stats.packages_today, 2);
        assert_eq!(stats.packages_in_sessions, 1);
        assert_eq!(stats.pickups_today, 1);
        assert_eq!(stats.signed_manifests_today, 1);

        let docs = state.documents(Some(day));
        assert_eq!(docs.len(), 1);
        assert!(docs[0].manifest.is_some());

        let hits = state.search("trk2");
        assert_eq!(hits.packages.len(), 1);
        assert_eq!(hits.packages[0].pallet_id, pallet.id);
        assert_eq!(state.search("rec-2026").pickups.len(), 1);
        assert!(state.search("zzz").is_empty());
    }

    #[test]
    fn test_legacy_nested_session_loads_flat() {
        let json = r#"{
            "sessions": {
                "GLS": {
                    "pallets": [
                        {"packages": [{"tracking": "A1", "scanned_at": "2026-03-09T08:00:00Z"}]},
                        {"packages": [
                            {"tracking": "A2", "scanned_at": "2026-03-09T08:01:00Z"},
                            {"tracking": "A1", "scanned_at": "2026-03-09T08:02:00Z"}
                        ]}
                    ],
                    "last_update": "2026-03-09T08:02:00Z"
                },
                "CTT": {"packages": [], "last_update": "2026-03-09T07:00:00Z"}
            }
        }"#;
        let state: ConsolidationState = serde_json::from_str(json).unwrap();
        let session = state.session(&gls()).unwrap();
        let codes: Vec<&str> = session.packages.iter().map(|p| p.tracking.as_str()).collect();
        assert_eq!(codes, vec!["A1", "A2"]);
        assert_eq!(session.last_update, at(8, 2));
        assert!(state.session(&Carrier::new("CTT")).unwrap().is_empty());
    }
}
