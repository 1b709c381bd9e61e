//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `order_system` - Odoo JSON-RPC client for outbound shipments
//! - `aggregator` - Sendcloud REST client for carrier parcels
//! - `snapshot` - Persisted tracking index and parcel cache
//! - `http` - Prometheus metrics and index control endpoint

pub mod aggregator;
pub mod http;
pub mod order_system;
pub mod snapshot;

// Re-export commonly used types
pub use aggregator::{CarrierAggregator, SendcloudClient};
pub use http::{start_http_server, HttpState};
pub use order_system::{OdooClient, OrderSystem};
pub use snapshot::SnapshotFiles;
