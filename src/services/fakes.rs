//! In-memory stand-ins for the order system and the aggregator

use crate::domain::error::UpstreamError;
use crate::domain::types::{normalize_code, strip_code, Carrier, ParcelRecord, ShipmentId, ShipmentRecord};
use crate::io::aggregator::CarrierAggregator;
use crate::io::order_system::OrderSystem;
use crate::services::patterns::MIN_CANDIDATE_LEN;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

fn unavailable() -> UpstreamError {
    UpstreamError::Transport("connection refused".to_string())
}

#[derive(Default)]
pub struct FakeOrderSystem {
    shipments: Mutex<Vec<ShipmentRecord>>,
    fail: AtomicBool,
    fail_writes: AtomicBool,
    writes: Mutex<Vec<(Vec<ShipmentId>, NaiveDate)>>,
    lookups: AtomicUsize,
    /// Held by a test to park `list_recent_outbound`
    pub hold: Arc<tokio::sync::Mutex<()>>,
}

impl FakeOrderSystem {
    pub fn with(shipments: Vec<ShipmentRecord>) -> Self {
        let fake = Self::default();
        *fake.shipments.lock() = shipments;
        fake
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn writes(&self) -> Vec<(Vec<ShipmentId>, NaiveDate)> {
        self.writes.lock().clone()
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), UpstreamError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        Ok(())
    }
}

#[async_trait]
impl OrderSystem for FakeOrderSystem {
    async fn find_shipment_by_tracking_code(
        &self,
        code: &str,
    ) -> Result<Option<ShipmentRecord>, UpstreamError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        let code = normalize_code(code);
        let shipments = self.shipments.lock();
        let exact = shipments.iter().find(|s| normalize_code(&s.declared_code) == code);
        if exact.is_some() || strip_code(&code).len() < MIN_CANDIDATE_LEN {
            return Ok(exact.cloned());
        }
        Ok(shipments.iter().find(|s| normalize_code(&s.declared_code).contains(&code)).cloned())
    }

    async fn search_shipments_by_candidates(
        &self,
        candidates: &[String],
        _carrier: Option<&Carrier>,
    ) -> Result<Option<ShipmentRecord>, UpstreamError> {
        self.check()?;
        let shipments = self.shipments.lock();
        Ok(candidates.iter().find_map(|candidate| {
            shipments
                .iter()
                .find(|s| s.state == "done" && normalize_code(&s.declared_code).contains(candidate.as_str()))
                .cloned()
        }))
    }

    async fn list_recent_outbound(&self, _since: NaiveDate) -> Result<Vec<ShipmentRecord>, UpstreamError> {
        let _parked = self.hold.lock().await;
        self.check()?;
        Ok(self.shipments.lock().clone())
    }

    async fn set_expedition_date(
        &self,
        ids: &[ShipmentId],
        date: NaiveDate,
    ) -> Result<usize, UpstreamError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(UpstreamError::Rpc("record is locked".to_string()));
        }
        self.writes.lock().push((ids.to_vec(), date));
        Ok(ids.len())
    }

    async fn find_by_customer_name(
        &self,
        name: &str,
        _since: NaiveDate,
    ) -> Result<Vec<ShipmentRecord>, UpstreamError> {
        self.check()?;
        let name = name.to_lowercase();
        Ok(self
            .shipments
            .lock()
            .iter()
            .filter(|s| s.customer_name.to_lowercase().contains(&name))
            .cloned()
            .collect())
    }

    async fn find_by_order_reference(
        &self,
        reference: &str,
        _since: NaiveDate,
    ) -> Result<Vec<ShipmentRecord>, UpstreamError> {
        self.check()?;
        let reference = reference.to_uppercase();
        Ok(self
            .shipments
            .lock()
            .iter()
            .filter(|s| s.order_ref.to_uppercase().contains(&reference))
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct FakeAggregator {
    parcels: Mutex<Vec<ParcelRecord>>,
    fail: AtomicBool,
    lookups: AtomicUsize,
}

impl FakeAggregator {
    pub fn with(parcels: Vec<ParcelRecord>) -> Self {
        let fake = Self::default();
        *fake.parcels.lock() = parcels;
        fake
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CarrierAggregator for FakeAggregator {
    async fn get_parcel_by_tracking(&self, code: &str) -> Result<Option<ParcelRecord>, UpstreamError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        let code = strip_code(code);
        Ok(self.parcels.lock().iter().find(|p| strip_code(&p.tracking) == code).cloned())
    }

    async fn list_parcels_updated_since(
        &self,
        _since: DateTime<Utc>,
    ) -> Result<Vec<ParcelRecord>, UpstreamError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        Ok(self.parcels.lock().clone())
    }
}
