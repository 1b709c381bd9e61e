//! Durable storage for consolidation state
//!
//! State is one JSON document written with write-to-temp + rename, so a
//! crash mid-write leaves the previous document intact.

use crate::domain::consolidation::ConsolidationState;
use anyhow::Context;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

pub const STATE_FILE: &str = "consolidation.json";

/// Persistence seam for the consolidation state machine
pub trait StateStore: Send + Sync {
    /// Load the last saved state (empty state when nothing was saved yet)
    fn load(&self) -> anyhow::Result<ConsolidationState>;

    fn save(&self, state: &ConsolidationState) -> anyhow::Result<()>;
}

/// Serialize `value` to `path` atomically
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory {}", dir.display()))?;
    }

    let tmp = path.with_extension("json.tmp");
    let body = serde_json::to_vec_pretty(value).context("Failed to serialize state")?;
    {
        let mut file = fs::File::create(&tmp)
            .with_context(|| format!("Failed to create {}", tmp.display()))?;
        file.write_all(&body).with_context(|| format!("Failed to write {}", tmp.display()))?;
        file.sync_all().with_context(|| format!("Failed to sync {}", tmp.display()))?;
    }
    fs::rename(&tmp, path)
        .with_context(|| format!("Failed to move {} into place", path.display()))?;
    Ok(())
}

/// Read a JSON document; `Ok(None)` when the file does not exist
pub fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    let content = match fs::read(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read {}", path.display()));
        }
    };
    let value = serde_json::from_slice(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(Some(value))
}

/// JSON file in the data directory
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(data_dir: &Path) -> Self {
        Self { path: data_dir.join(STATE_FILE) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateStore for JsonFileStore {
    fn load(&self) -> anyhow::Result<ConsolidationState> {
        Ok(read_json(&self.path)?.unwrap_or_default())
    }

    fn save(&self, state: &ConsolidationState) -> anyhow::Result<()> {
        write_json_atomic(&self.path, state)
    }
}

/// In-memory store; writes can be made to fail for rollback tests
#[derive(Default)]
pub struct MemoryStore {
    saved: Mutex<Option<ConsolidationState>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn saved(&self) -> Option<ConsolidationState> {
        self.saved.lock().clone()
    }
}

impl StateStore for MemoryStore {
    fn load(&self) -> anyhow::Result<ConsolidationState> {
        Ok(self.saved.lock().clone().unwrap_or_default())
    }

    fn save(&self, state: &ConsolidationState) -> anyhow::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            anyhow::bail!("write refused");
        }
        *self.saved.lock() = Some(state.clone());
        Ok(())
    }
}
