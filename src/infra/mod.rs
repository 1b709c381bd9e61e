//! Infrastructure - configuration, metrics, and storage
//!
//! This module contains infrastructure concerns:
//! - `config` - Application configuration (TOML loading, defaults, env secrets)
//! - `metrics` - Lock-free metrics collection
//! - `store` - Durable consolidation state (JSON file, in-memory)

pub mod config;
pub mod metrics;
pub mod store;

// Re-export commonly used types
pub use config::Config;
pub use metrics::Metrics;
pub use store::{JsonFileStore, MemoryStore, StateStore};
