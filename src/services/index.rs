//! Correlation index - joined view of shipments and parcels
//!
//! An `IndexSnapshot` is immutable once built. `IndexHandle` holds the
//! installed snapshot behind a lock that is only taken to clone or swap the
//! `Arc`, so readers never wait on a build.

use crate::domain::types::{strip_code, Carrier, ParcelRecord, ShipmentRecord};
use crate::services::carriers;
use crate::services::patterns::MIN_CANDIDATE_LEN;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Exact,
    Pattern,
}

/// One shipment joined to one parcel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationEntry {
    pub aggregator_code: String,
    pub declared_code: String,
    pub carrier: Carrier,
    pub match_kind: MatchKind,
    pub shipment: ShipmentRecord,
    pub parcel: ParcelRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSummary {
    pub build_id: String,
    pub built_at: DateTime<Utc>,
    pub window_days: u32,
    pub total_shipments: usize,
    pub total_parcels: usize,
    pub matched: usize,
    pub matched_exact: usize,
    pub matched_pattern: usize,
    pub unmatched: usize,
    pub duplicates: usize,
    pub by_carrier: BTreeMap<Carrier, usize>,
}

impl IndexSummary {
    pub fn empty() -> Self {
        Self {
            build_id: String::new(),
            built_at: DateTime::<Utc>::UNIX_EPOCH,
            window_days: 0,
            total_shipments: 0,
            total_parcels: 0,
            matched: 0,
            matched_exact: 0,
            matched_pattern: 0,
            unmatched: 0,
            duplicates: 0,
            by_carrier: BTreeMap::new(),
        }
    }
}

/// Entries plus three lookup views
///
/// Keys are `strip_code` forms. At most one entry per aggregator code and
/// one per declared code; the first insert wins.
#[derive(Debug, Clone, Default)]
pub struct CorrelationIndex {
    entries: Vec<CorrelationEntry>,
    by_aggregator: FxHashMap<String, usize>,
    by_declared: FxHashMap<String, usize>,
    by_carrier: FxHashMap<Carrier, Vec<usize>>,
}

impl CorrelationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the views from a persisted entry list
    pub fn from_entries(entries: Vec<CorrelationEntry>) -> Self {
        let mut index = Self::new();
        for entry in entries {
            let _ = index.insert(entry);
        }
        index
    }

    pub fn has_aggregator_code(&self, code: &str) -> bool {
        self.by_aggregator.contains_key(&strip_code(code))
    }

    pub fn has_declared_code(&self, code: &str) -> bool {
        self.by_declared.contains_key(&strip_code(code))
    }

    /// Add an entry; returns false (and changes nothing) if either code is already indexed
    pub fn insert(&mut self, entry: CorrelationEntry) -> bool {
        let agg_key = strip_code(&entry.aggregator_code);
        let dec_key = strip_code(&entry.declared_code);
        if agg_key.is_empty()
            || dec_key.is_empty()
            || self.by_aggregator.contains_key(&agg_key)
            || self.by_declared.contains_key(&dec_key)
        {
            return false;
        }
        let slot = self.entries.len();
        self.by_aggregator.insert(agg_key, slot);
        self.by_declared.insert(dec_key, slot);
        self.by_carrier.entry(entry.carrier.clone()).or_default().push(slot);
        self.entries.push(entry);
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[CorrelationEntry] {
        &self.entries
    }

    pub fn by_aggregator_code(&self, code: &str) -> Option<&CorrelationEntry> {
        self.by_aggregator.get(&strip_code(code)).map(|&i| &self.entries[i])
    }

    pub fn by_declared_code(&self, code: &str) -> Option<&CorrelationEntry> {
        self.by_declared.get(&strip_code(code)).map(|&i| &self.entries[i])
    }

    pub fn carrier_entries(&self, carrier: &Carrier) -> impl Iterator<Item = &CorrelationEntry> {
        self.by_carrier
            .get(carrier)
            .into_iter()
            .flat_map(|slots| slots.iter().map(|&i| &self.entries[i]))
    }

    pub fn carrier_count(&self, carrier: &Carrier) -> usize {
        self.by_carrier.get(carrier).map_or(0, Vec::len)
    }

    /// Carrier-scoped fuzzy lookup with the scanned code in the aggregator position
    ///
    /// Scans and declared codes shorter than the candidate floor are ignored.
    /// The scan must be at least as long as the declared code: a fragment of
    /// a declared code never identifies the shipment.
    pub fn fuzzy_lookup(&self, scanned: &str, carrier: &Carrier) -> Option<&CorrelationEntry> {
        let rule = carriers::match_rule(carrier)?;
        let scanned = strip_code(scanned);
        if scanned.len() < MIN_CANDIDATE_LEN {
            return None;
        }
        self.carrier_entries(carrier).find(|entry| {
            let declared = strip_code(&entry.declared_code);
            declared.len() >= MIN_CANDIDATE_LEN
                && scanned.len() >= declared.len()
                && rule.matches(&scanned, &declared)
        })
    }

    /// Fuzzy lookup across every fuzzy carrier in catalog order
    pub fn fuzzy_lookup_any(&self, scanned: &str) -> Option<&CorrelationEntry> {
        carriers::fuzzy_carriers().find_map(|carrier| self.fuzzy_lookup(scanned, &carrier))
    }
}

/// Raw aggregator parcels from the last successful build, keyed by `strip_code`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParcelCache {
    #[serde(default)]
    pub built_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub parcels: FxHashMap<String, ParcelRecord>,
}

impl ParcelCache {
    pub fn from_parcels(built_at: DateTime<Utc>, parcels: &[ParcelRecord]) -> Self {
        let mut map = FxHashMap::default();
        for parcel in parcels {
            let key = strip_code(&parcel.tracking);
            if !key.is_empty() {
                map.entry(key).or_insert_with(|| parcel.clone());
            }
        }
        Self { built_at: Some(built_at), parcels: map }
    }

    pub fn get(&self, code: &str) -> Option<&ParcelRecord> {
        self.parcels.get(&strip_code(code))
    }

    pub fn len(&self) -> usize {
        self.parcels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parcels.is_empty()
    }
}

/// Everything the resolver reads from the last build
#[derive(Debug, Clone)]
pub struct IndexSnapshot {
    pub summary: IndexSummary,
    pub index: CorrelationIndex,
    pub cache: ParcelCache,
}

impl IndexSnapshot {
    pub fn empty() -> Self {
        Self { summary: IndexSummary::empty(), index: CorrelationIndex::new(), cache: ParcelCache::default() }
    }

    /// True until a build (or a persisted one) has been installed
    pub fn is_blank(&self) -> bool {
        self.summary.build_id.is_empty()
    }
}

/// Installed snapshot, swapped wholesale
pub struct IndexHandle {
    current: RwLock<Arc<IndexSnapshot>>,
}

impl IndexHandle {
    pub fn new(snapshot: IndexSnapshot) -> Self {
        Self { current: RwLock::new(Arc::new(snapshot)) }
    }

    pub fn empty() -> Self {
        Self::new(IndexSnapshot::empty())
    }

    pub fn current(&self) -> Arc<IndexSnapshot> {
        self.current.read().clone()
    }

    /// Replace the installed snapshot; returns the previous one
    pub fn install(&self, snapshot: IndexSnapshot) -> Arc<IndexSnapshot> {
        let next = Arc::new(snapshot);
        std::mem::replace(&mut *self.current.write(), next)
    }
}

impl Default for IndexHandle {
    fn default() -> Self {
        Self::empty()
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_exact_views() {
        let mut index = CorrelationIndex::new();
        assert!(index.insert(entry(shipment(1, "jjd0001"), parcel("JJD0001", "gls"), MatchKind::Exact)));

        assert_eq!(index.by_aggregator_code(" jjd-0001 ").unwrap().shipment.id.0, 1);
        assert_eq!(index.by_declared_code("JJD0001").unwrap().carrier, Carrier::new("GLS"));
        assert_eq!(index.carrier_count(&Carrier::new("GLS")), 1);
    }

    #[test]
    fn test_one_to_one_first_wins() {
        let mut index = CorrelationIndex::new();
        assert!(index.insert(entry(shipment(1, "4347080"), parcel("00030100030197014347080", "ctt"), MatchKind::Pattern)));
        // same parcel claimed by another shipment
        assert!(!index.insert(entry(shipment(2, "97014347080"), parcel("00030100030197014347080", "ctt"), MatchKind::Pattern)));
        // same declared code pointing at another parcel
        assert!(!index.insert(entry(shipment(3, "4347080"), parcel("99930100030197014347080", "ctt"), MatchKind::Pattern)));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_fuzzy_lookup_scoped_to_carrier() {
        let mut index = CorrelationIndex::new();
        index.insert(entry(shipment(1, "6C20493112219"), parcel("6C20493112219", "asendia"), MatchKind::Exact));
        index.insert(entry(shipment(2, "1234"), parcel("LS000001234NL", "spring"), MatchKind::Pattern));

        let hit = index.fuzzy_lookup("XX6C20493112219YY", &Carrier::new("ASENDIA")).unwrap();
        assert_eq!(hit.shipment.id.0, 1);
        assert!(index.fuzzy_lookup("XX6C20493112219YY", &Carrier::new("GLS")).is_none());
        // declared codes under the floor are never fuzzy-matched
        assert!(index.fuzzy_lookup("LS000001234NL99", &Carrier::new("SPRING")).is_none());
        assert_eq!(index.fuzzy_lookup_any("%6C20493112219%").unwrap().shipment.id.0, 1);
    }

    #[test]
    fn test_fuzzy_lookup_ignores_fragments_of_declared_codes() {
        let mut index = CorrelationIndex::new();
        index.insert(entry(shipment(3, "6C20493112219"), parcel("6C20493112219", "asendia"), MatchKind::Exact));

        for fragment in ["2", "C20", "31122", "6C2049311", "6C204931122"] {
            assert!(index.fuzzy_lookup_any(fragment).is_none(), "{fragment} matched");
        }
        assert!(index.fuzzy_lookup("6C20493112219", &Carrier::new("ASENDIA")).is_some());
    }

    #[test]
    fn test_from_entries_restores_views() {
        let entries = vec![
            entry(shipment(1, "A0000000001"), parcel("A0000000001", "gls"), MatchKind::Exact),
            entry(shipment(2, "A0000000001"), parcel("B0000000002", "gls"), MatchKind::Exact),
        ];
        let index = CorrelationIndex::from_entries(entries);
        assert_eq!(index.len(), 1);
        assert!(index.has_declared_code("a0000000001"));
        assert!(!index.has_aggregator_code("B0000000002"));
    }

    #[test]
    fn test_parcel_cache_keys() {
        let cache = ParcelCache::from_parcels(Utc::now(), &[parcel("ab-123", "gls"), parcel("AB123", "ctt")]);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("ab123").unwrap().carrier, Some(Carrier::new("GLS")));
    }

    #[test]
    fn test_handle_swaps_snapshot() {
        let handle = IndexHandle::empty();
        let before = handle.current();
        assert!(before.is_blank());

        let mut next = IndexSnapshot::empty();
        next.summary.build_id = "b1".to_string();
        let previous = handle.install(next);

        assert!(previous.is_blank());
        // readers holding the old Arc keep it
        assert!(before.is_blank());
        assert_eq!(handle.current().summary.build_id, "b1");
    }
}
