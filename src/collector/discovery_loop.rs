//! Periodic per-venue instrument discovery and snapshot publication.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use super::rotating_sink::RotatingSink;
use super::snapshot_store::SnapshotStore;
use super::types::{ActiveSet, Instrument};
use super::venue::VenueClient;

pub struct DiscoveryLoop {
    venue: String,
    client: Arc<dyn VenueClient>,
    store: Arc<SnapshotStore>,
    markets_dir: std::path::PathBuf,
    rotate_minutes: u64,
    fsync_seconds: u64,
    schema_version_markets: u32,
    discover_interval: Duration,
}

impl DiscoveryLoop {
    pub fn new(
        venue: impl Into<String>,
        client: Arc<dyn VenueClient>,
        store: Arc<SnapshotStore>,
        output_dir: impl Into<std::path::PathBuf>,
        rotate_minutes: u64,
        fsync_seconds: u64,
        schema_version_markets: u32,
        discover_interval: Duration,
    ) -> Self {
        Self {
            venue: venue.into(),
            client,
            store,
            markets_dir: output_dir.into(),
            rotate_minutes,
            fsync_seconds,
            schema_version_markets,
            discover_interval,
        }
    }

    /// Derive the instrument key, preferring an explicit one and
    /// otherwise falling back to `poll_key | slug | asset_id |
    /// instrument_id`.
    fn instrument_key(venue: &str, inst: &Instrument) -> Option<String> {
        if let Some(k) = &inst.instrument_key {
            return Some(k.clone());
        }
        inst.fallback_key().map(|k| format!("{venue}:{k}"))
    }

    /// One discovery cycle: returns `true` if the active set changed and
    /// a new snapshot was published.
    pub async fn run_once(&self) -> anyhow::Result<bool> {
        let discovered = self.client.discover_instruments().await?;

        let mut active: BTreeMap<String, Instrument> = BTreeMap::new();
        for mut inst in discovered {
            inst.venue = self.venue.clone();
            let Some(key) = Self::instrument_key(&self.venue, &inst) else {
                continue;
            };
            inst.instrument_key = Some(key.clone());
            active.insert(key, inst);
        }

        let old_keys: std::collections::BTreeSet<_> =
            self.store.load_instruments(&self.venue).into_keys().collect();
        let new_keys: std::collections::BTreeSet<_> = active.keys().cloned().collect();

        let added = new_keys.difference(&old_keys).count();
        let removed = old_keys.difference(&new_keys).count();

        if added == 0 && removed == 0 && old_keys == new_keys {
            info!(venue = %self.venue, count = active.len(), "discovery: no change");
            return Ok(false);
        }

        let date_str = Utc::now().format("%Y-%m-%d").to_string();
        let mut markets_writer = RotatingSink::open(
            self.markets_dir.join(&self.venue).join("markets").join(format!("date={date_str}")),
            "markets",
            self.rotate_minutes,
            self.fsync_seconds,
        )?;

        for inst in active.values() {
            let mut record = serde_json::to_value(inst)?;
            if let Some(obj) = record.as_object_mut() {
                obj.entry("record_type").or_insert_with(|| "market".into());
                obj.entry("schema_version")
                    .or_insert_with(|| self.schema_version_markets.into());
            }
            markets_writer.write_value(&record)?;
        }
        markets_writer.close()?;

        let snapshot = ActiveSet::new(self.venue.clone(), active);
        self.store.publish(&snapshot)?;

        info!(
            venue = %self.venue,
            count = snapshot.count,
            added,
            removed,
            "discovery: published snapshot"
        );

        Ok(true)
    }

    /// Run forever, sleeping between cycles with sleep-compensation so a
    /// slow cycle doesn't compound drift. Per-cycle failures are logged
    /// and never stop the loop.
    pub async fn run_forever(&self) {
        loop {
            let start = std::time::Instant::now();
            if let Err(err) = self.run_once().await {
                warn!(venue = %self.venue, error = %err, "discovery cycle failed");
            }
            let elapsed = start.elapsed();
            let sleep_for = self.discover_interval.saturating_sub(elapsed).max(Duration::from_secs(1));
            tokio::time::sleep(sleep_for).await;
        }
    }
}
