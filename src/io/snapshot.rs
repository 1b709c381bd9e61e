//! Persisted index snapshot
//!
//! Two plain JSON files under the data directory: `tracking-index.json`
//! (summary plus entries) and `parcel-cache.json`. Views are rebuilt from
//! the entries on load.

use crate::infra::store::{read_json, write_json_atomic};
use crate::services::index::{CorrelationEntry, CorrelationIndex, IndexSnapshot, IndexSummary, ParcelCache};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

pub const INDEX_FILE: &str = "tracking-index.json";
pub const CACHE_FILE: &str = "parcel-cache.json";

#[derive(Serialize, Deserialize)]
struct IndexFile {
    summary: IndexSummary,
    entries: Vec<CorrelationEntry>,
}

#[derive(Serialize)]
struct IndexFileRef<'a> {
    summary: &'a IndexSummary,
    entries: &'a [CorrelationEntry],
}

pub struct SnapshotFiles {
    index_path: PathBuf,
    cache_path: PathBuf,
}

impl SnapshotFiles {
    pub fn new(data_dir: &Path) -> Self {
        Self { index_path: data_dir.join(INDEX_FILE), cache_path: data_dir.join(CACHE_FILE) }
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    /// Write both files. The pair is not written atomically; `load` drops a
    /// cache whose `built_at` differs from the index summary.
    pub fn save(&self, snapshot: &IndexSnapshot) -> anyhow::Result<()> {
        write_json_atomic(&self.cache_path, &snapshot.cache).context("writing parcel cache")?;
        let file = IndexFileRef { summary: &snapshot.summary, entries: snapshot.index.entries() };
        write_json_atomic(&self.index_path, &file).context("writing tracking index")?;
        Ok(())
    }

    /// Last persisted snapshot, `None` when no build was ever saved
    pub fn load(&self) -> anyhow::Result<Option<IndexSnapshot>> {
        let Some(file) = read_json::<IndexFile>(&self.index_path).context("reading tracking index")? else {
            return Ok(None);
        };
        let mut cache = read_json::<ParcelCache>(&self.cache_path)
            .context("reading parcel cache")?
            .unwrap_or_default();
        if cache.built_at.is_some_and(|built_at| built_at != file.summary.built_at) {
            warn!(
                index_built_at = %file.summary.built_at,
                cache_built_at = ?cache.built_at,
                "parcel_cache_stale_dropped"
            );
            cache = ParcelCache::default();
        }
        Ok(Some(IndexSnapshot {
            summary: file.summary,
            index: CorrelationIndex::from_entries(file.entries),
            cache,
        }))
    }
}
