//! Atomic per-venue snapshot persistence.
//!
//! Publish writes to a sibling `.tmp` path, fsyncs it, then renames over
//! the target so a reader never observes a half-written file. Loading is
//! best-effort: any failure yields an empty set rather than propagating,
//! since discovery always has authority to rebuild the snapshot on its
//! next cycle.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::warn;

use super::types::{ActiveSet, Instrument};

pub struct SnapshotStore {
    dir: PathBuf,
    snapshot_name: String,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            snapshot_name: "active_instruments.snapshot.json".to_string(),
        }
    }

    pub fn snapshot_path(&self, venue: &str) -> PathBuf {
        self.dir.join(venue).join("state").join(&self.snapshot_name)
    }

    /// Atomically publish a venue's active set.
    pub fn publish(&self, active_set: &ActiveSet) -> anyhow::Result<()> {
        let path = self.snapshot_path(&active_set.venue);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tmp_path = path.with_extension("json.tmp");
        let data = serde_json::to_string(active_set)?;

        {
            let mut f = std::fs::File::create(&tmp_path)?;
            use std::io::Write;
            f.write_all(data.as_bytes())?;
            f.flush()?;
            f.sync_all()?;
        }

        std::fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    /// Best-effort load of a venue's persisted instrument map. Returns an
    /// empty map on any I/O or parse failure rather than erroring.
    pub fn load_instruments(&self, venue: &str) -> BTreeMap<String, Instrument> {
        let path = self.snapshot_path(venue);
        match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<ActiveSet>(&raw) {
                Ok(set) => set.instruments,
                Err(err) => {
                    warn!(venue, error = %err, "snapshot malformed, treating as empty");
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        }
    }

    /// The file's modification time, used by the poller to decide whether
    /// a snapshot needs to be reloaded without reading it every cycle.
    pub fn mtime(&self, venue: &str) -> Option<std::time::SystemTime> {
        std::fs::metadata(self.snapshot_path(venue))
            .and_then(|m| m.modified())
            .ok()
    }
}
