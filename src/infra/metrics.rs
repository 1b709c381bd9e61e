//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! Counters are monotonic; `summary()` only loads them.
//!
//! NOTE: All atomics use Relaxed ordering intentionally. These are statistical
//! counters only and must not drive control flow.

use crate::domain::error::Rejection;
use crate::domain::types::Provenance;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Resolution latency bucket boundaries (milliseconds)
/// Buckets: ≤5, ≤10, ≤25, ≤50, ≤100, ≤250, ≤500, ≤1000, ≤2500, ≤5000, >5000
const BUCKET_BOUNDS: [u64; 10] = [5, 10, 25, 50, 100, 250, 500, 1000, 2500, 5000];
const NUM_BUCKETS: usize = 11;

const NUM_PROVENANCE: usize = Provenance::ALL.len();
const NUM_REJECTIONS: usize = Rejection::KINDS.len();
/// order_system, aggregator
const NUM_UPSTREAMS: usize = 2;

#[inline]
fn bucket_index(latency_ms: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_ms)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

#[inline]
fn load_all<const N: usize>(counters: &[AtomicU64; N]) -> [u64; N] {
    let mut result = [0u64; N];
    for (i, c) in counters.iter().enumerate() {
        result[i] = c.load(Ordering::Relaxed);
    }
    result
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile).ceil() as u64;
    let mut cumulative = 0u64;

    // last bucket reports 2x the previous bound
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [5, 10, 25, 50, 100, 250, 500, 1000, 2500, 5000, 10000];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Lock-free metrics collector
pub struct Metrics {
    /// Resolutions by provenance tier
    resolutions: [AtomicU64; NUM_PROVENANCE],
    /// End-to-end resolution latency histogram (ms)
    resolve_latency_buckets: [AtomicU64; NUM_BUCKETS],
    resolve_latency_sum_ms: AtomicU64,
    resolve_latency_max_ms: AtomicU64,
    /// Tier failures by upstream (timeouts, transport, faults)
    upstream_failures: [AtomicU64; NUM_UPSTREAMS],
    scans_accepted: AtomicU64,
    /// Rejected scans and operations by rejection kind
    rejections: [AtomicU64; NUM_REJECTIONS],
    pallets_created: AtomicU64,
    pickups_created: AtomicU64,
    manifests_signed: AtomicU64,
    expedition_sync_failures: AtomicU64,
    index_builds_ok: AtomicU64,
    index_builds_failed: AtomicU64,
    /// Build requests refused because one was in flight
    index_builds_rejected: AtomicU64,
    index_last_build_ms: AtomicU64,
    index_entries: AtomicU64,
    index_unmatched: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            resolutions: Default::default(),
            resolve_latency_buckets: Default::default(),
            resolve_latency_sum_ms: AtomicU64::new(0),
            resolve_latency_max_ms: AtomicU64::new(0),
            upstream_failures: Default::default(),
            scans_accepted: AtomicU64::new(0),
            rejections: Default::default(),
            pallets_created: AtomicU64::new(0),
            pickups_created: AtomicU64::new(0),
            manifests_signed: AtomicU64::new(0),
            expedition_sync_failures: AtomicU64::new(0),
            index_builds_ok: AtomicU64::new(0),
            index_builds_failed: AtomicU64::new(0),
            index_builds_rejected: AtomicU64::new(0),
            index_last_build_ms: AtomicU64::new(0),
            index_entries: AtomicU64::new(0),
            index_unmatched: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn record_resolution(&self, provenance: Provenance, latency_ms: u64) {
        self.resolutions[provenance.slot()].fetch_add(1, Ordering::Relaxed);
        self.resolve_latency_buckets[bucket_index(latency_ms)].fetch_add(1, Ordering::Relaxed);
        self.resolve_latency_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        update_atomic_max(&self.resolve_latency_max_ms, latency_ms);
    }

    #[inline]
    pub fn record_upstream_failure(&self, upstream: crate::domain::error::Upstream) {
        self.upstream_failures[upstream.slot()].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_scan_accepted(&self) {
        self.scans_accepted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_rejection(&self, rejection: &Rejection) {
        self.rejections[rejection.slot()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pallet_created(&self) {
        self.pallets_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pickup_created(&self) {
        self.pickups_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_manifest_signed(&self) {
        self.manifests_signed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_expedition_sync_failure(&self) {
        self.expedition_sync_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_index_build(&self, duration_ms: u64, entries: usize, unmatched: usize) {
        self.index_builds_ok.fetch_add(1, Ordering::Relaxed);
        self.index_last_build_ms.store(duration_ms, Ordering::Relaxed);
        self.index_entries.store(entries as u64, Ordering::Relaxed);
        self.index_unmatched.store(unmatched as u64, Ordering::Relaxed);
    }

    pub fn record_index_build_failed(&self) {
        self.index_builds_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_index_build_rejected(&self) {
        self.index_builds_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Set the entry gauges after a snapshot is loaded from disk
    pub fn set_index_size(&self, entries: usize, unmatched: usize) {
        self.index_entries.store(entries as u64, Ordering::Relaxed);
        self.index_unmatched.store(unmatched as u64, Ordering::Relaxed);
    }

    pub fn resolutions(&self, provenance: Provenance) -> u64 {
        self.resolutions[provenance.slot()].load(Ordering::Relaxed)
    }

    pub fn rejections(&self, kind: &str) -> u64 {
        Rejection::KINDS
            .iter()
            .position(|k| *k == kind)
            .map(|i| self.rejections[i].load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn scans_accepted(&self) -> u64 {
        self.scans_accepted.load(Ordering::Relaxed)
    }

    pub fn index_builds_ok(&self) -> u64 {
        self.index_builds_ok.load(Ordering::Relaxed)
    }

    pub fn index_builds_failed(&self) -> u64 {
        self.index_builds_failed.load(Ordering::Relaxed)
    }

    pub fn index_builds_rejected(&self) -> u64 {
        self.index_builds_rejected.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of every counter
    pub fn summary(&self) -> MetricsSummary {
        let resolve_latency_buckets = load_all(&self.resolve_latency_buckets);
        let resolve_count: u64 = resolve_latency_buckets.iter().sum();
        let resolve_sum = self.resolve_latency_sum_ms.load(Ordering::Relaxed);

        MetricsSummary {
            resolutions: load_all(&self.resolutions),
            resolve_latency_buckets,
            resolve_latency_sum_ms: resolve_sum,
            resolve_latency_avg_ms: if resolve_count > 0 { resolve_sum / resolve_count } else { 0 },
            resolve_latency_max_ms: self.resolve_latency_max_ms.load(Ordering::Relaxed),
            resolve_latency_p50_ms: percentile_from_buckets(&resolve_latency_buckets, 0.50),
            resolve_latency_p99_ms: percentile_from_buckets(&resolve_latency_buckets, 0.99),
            upstream_failures: load_all(&self.upstream_failures),
            scans_accepted: self.scans_accepted.load(Ordering::Relaxed),
            rejections: load_all(&self.rejections),
            pallets_created: self.pallets_created.load(Ordering::Relaxed),
            pickups_created: self.pickups_created.load(Ordering::Relaxed),
            manifests_signed: self.manifests_signed.load(Ordering::Relaxed),
            expedition_sync_failures: self.expedition_sync_failures.load(Ordering::Relaxed),
            index_builds_ok: self.index_builds_ok.load(Ordering::Relaxed),
            index_builds_failed: self.index_builds_failed.load(Ordering::Relaxed),
            index_builds_rejected: self.index_builds_rejected.load(Ordering::Relaxed),
            index_last_build_ms: self.index_last_build_ms.load(Ordering::Relaxed),
            index_entries: self.index_entries.load(Ordering::Relaxed),
            index_unmatched: self.index_unmatched.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Exported bucket bounds for Prometheus formatting
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;
pub const UPSTREAM_LABELS: [&str; NUM_UPSTREAMS] = ["order_system", "aggregator"];

#[derive(Debug, Clone)]
pub struct MetricsSummary {
    /// Indexed by `Provenance::slot()`
    pub resolutions: [u64; NUM_PROVENANCE],
    pub resolve_latency_buckets: [u64; NUM_BUCKETS],
    pub resolve_latency_sum_ms: u64,
    pub resolve_latency_avg_ms: u64,
    pub resolve_latency_max_ms: u64,
    pub resolve_latency_p50_ms: u64,
    pub resolve_latency_p99_ms: u64,
    /// Indexed like `UPSTREAM_LABELS`
    pub upstream_failures: [u64; NUM_UPSTREAMS],
    pub scans_accepted: u64,
    /// Indexed like `Rejection::KINDS`
    pub rejections: [u64; NUM_REJECTIONS],
    pub pallets_created: u64,
    pub pickups_created: u64,
    pub manifests_signed: u64,
    pub expedition_sync_failures: u64,
    pub index_builds_ok: u64,
    pub index_builds_failed: u64,
    pub index_builds_rejected: u64,
    pub index_last_build_ms: u64,
    pub index_entries: u64,
    pub index_unmatched: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        let total_resolutions: u64 = self.resolutions.iter().sum();
        let total_rejections: u64 = self.rejections.iter().sum();
        info!(
            resolutions = %total_resolutions,
            resolved_index = %self.resolutions[Provenance::Index.slot()],
            resolved_live = %self.resolutions[Provenance::Live.slot()],
            unverified = %self.resolutions[Provenance::Unverified.slot()],
            resolve_p99_ms = %self.resolve_latency_p99_ms,
            scans_accepted = %self.scans_accepted,
            rejections = %total_rejections,
            pallets = %self.pallets_created,
            pickups = %self.pickups_created,
            index_entries = %self.index_entries,
            "metrics"
        );
    }
}
