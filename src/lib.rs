//! Dock consolidator library
//!
//! Tracking-code resolution and outbound consolidation (sessions, pallets,
//! pickups, manifests). Exposes modules for integration testing and binary
//! reuse.

pub mod domain;
pub mod infra;
pub mod io;
pub mod services;
