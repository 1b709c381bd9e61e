//! Services - business logic and state management
//!
//! This module contains the core business logic services:
//! - `carriers` - Carrier code normalization and per-carrier match rules
//! - `patterns` - Candidate extraction from noisy scanner input
//! - `match_rule` - Exact, suffix and embedded code comparison
//! - `index` - Correlation index, parcel cache and the installed snapshot
//! - `index_builder` - Fetch, join, persist and install a new snapshot
//! - `sync_scheduler` - Periodic index rebuild
//! - `resolver` - Tiered tracking-code resolution
//! - `consolidator` - Sessions, pallets, pickups and manifests

pub mod carriers;
pub mod consolidator;
#[cfg(test)]
pub(crate) mod fakes;
pub mod index;
pub mod index_builder;
pub mod match_rule;
pub mod patterns;
pub mod resolver;
pub mod sync_scheduler;

// Re-export commonly used types
pub use consolidator::Consolidator;
pub use index::{IndexHandle, IndexSnapshot, IndexSummary};
pub use index_builder::{BuildError, IndexBuilder};
pub use resolver::{Resolution, ResolutionEngine};
pub use sync_scheduler::SyncScheduler;
