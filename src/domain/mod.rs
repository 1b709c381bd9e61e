//! Domain models - core business types
//!
//! This module contains the canonical data types used throughout the system:
//! - `types` - shipment and parcel records, carriers, provenance
//! - `consolidation` - sessions, pallets, pickups, manifests and their transitions
//! - `error` - rejection taxonomy and upstream failures

pub mod consolidation;
pub mod error;
pub mod types;

// Re-export commonly used types at module level
pub use consolidation::{ConsolidationState, Manifest, Package, Pallet, Pickup, Session};
pub use error::{Rejection, Upstream, UpstreamError};
pub use types::{Carrier, ParcelRecord, Provenance, ShipmentId, ShipmentRecord};
