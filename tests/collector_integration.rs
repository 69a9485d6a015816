//! End-to-end integration tests wiring `DiscoveryLoop` and `PollLoop`
//! together through a real `SnapshotStore` on a temp directory, using an
//! in-process fake `VenueClient` rather than any network call.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use collector_core::collector::{
    ActiveSet, Config, DiscoveryLoop, FetchError, Instrument, PollLoop, SnapshotStore, VenueClient,
};
use serde_json::{json, Value};

fn instrument(poll_key: &str, expiration_ms: Option<i64>) -> Instrument {
    Instrument {
        venue: String::new(),
        instrument_key: None,
        instrument_id: None,
        market_id: Some("m1".into()),
        poll_key: Some(poll_key.to_string()),
        slug: None,
        asset_id: None,
        underlying: None,
        expiration: expiration_ms,
        extra: Default::default(),
    }
}

/// Serves a configurable, swappable instrument list for discovery, and a
/// configurable per-call order-book outcome for polling.
struct FakeVenue {
    instruments: std::sync::Mutex<Vec<Instrument>>,
    fail_next: AtomicU32,
}

impl FakeVenue {
    fn new(instruments: Vec<Instrument>) -> Self {
        Self {
            instruments: std::sync::Mutex::new(instruments),
            fail_next: AtomicU32::new(0),
        }
    }

    fn set_instruments(&self, instruments: Vec<Instrument>) {
        *self.instruments.lock().unwrap() = instruments;
    }

    fn fail_next_n(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl VenueClient for FakeVenue {
    async fn discover_instruments(&self) -> anyhow::Result<Vec<Instrument>> {
        Ok(self.instruments.lock().unwrap().clone())
    }

    async fn get_orderbook(&self, poll_key: &str) -> Result<Value, FetchError> {
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.fetch_sub(1, Ordering::SeqCst);
            return Err(FetchError::new("rate limited [429]").with_status(429));
        }
        Ok(json!({
            "poll_key": poll_key,
            "bids": [{"price": 0.48, "size": 100.0}],
            "asks": [{"price": 0.52, "size": 100.0}],
            "timestamp": 1_700_000_000_000i64,
        }))
    }
}

fn test_config(output_dir: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.output_dir = output_dir.to_path_buf();
    config.rotate_minutes = 10;
    config.flush_interval_seconds = 3600;
    config.expire_grace_seconds = 0;
    config
}

/// Scenario 1: cold start, two instruments, both eligible and fetched OK.
#[tokio::test]
async fn cold_start_discovers_and_polls_two_instruments() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let store = Arc::new(SnapshotStore::new(&config.output_dir));

    let venue: Arc<FakeVenue> = Arc::new(FakeVenue::new(vec![
        instrument("A", Some(i64::MAX)),
        instrument("B", Some(i64::MAX)),
    ]));
    let client: Arc<dyn VenueClient> = venue.clone();

    let discovery = DiscoveryLoop::new(
        "v",
        client.clone(),
        store.clone(),
        &config.output_dir,
        config.rotate_minutes,
        config.flush_interval_seconds,
        config.schema_version_markets,
        Duration::from_secs(60),
    );
    assert!(discovery.run_once().await.unwrap());

    let poll_loop = PollLoop::new("v", client, None, store, &config, None).unwrap();
    let (ok, failed) = poll_loop.reload_and_poll_once(&config).await;
    assert_eq!((ok, failed), (2, 0));

    let books_dir = config
        .output_dir
        .join("v")
        .join("orderbooks")
        .join(format!("date={}", chrono::Utc::now().format("%Y-%m-%d")));
    let mut lines = 0usize;
    for entry in std::fs::read_dir(&books_dir).unwrap() {
        let content = std::fs::read_to_string(entry.unwrap().path()).unwrap();
        lines += content.lines().count();
    }
    assert_eq!(lines, 2);
}

/// Scenario 2: a burst of 429s trips the per-venue cooldown and the next
/// cycle is skipped entirely.
#[tokio::test]
async fn rate_limit_burst_trips_cooldown_and_skips_next_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let store = Arc::new(SnapshotStore::new(&config.output_dir));

    let venue: Arc<FakeVenue> = Arc::new(FakeVenue::new(vec![instrument("A", Some(i64::MAX))]));
    let client: Arc<dyn VenueClient> = venue.clone();

    let discovery = DiscoveryLoop::new(
        "v",
        client.clone(),
        store.clone(),
        &config.output_dir,
        config.rotate_minutes,
        config.flush_interval_seconds,
        config.schema_version_markets,
        Duration::from_secs(60),
    );
    discovery.run_once().await.unwrap();

    venue.fail_next_n(1);
    let poll_loop = PollLoop::new("v", client, None, store, &config, None).unwrap();
    let (ok, failed) = poll_loop.reload_and_poll_once(&config).await;
    assert_eq!((ok, failed), (0, 1));

    // Cooldown triggered by the 429: the very next cycle must return (0, 0)
    // without attempting any fetch, even though the venue would now succeed.
    let (ok, failed) = poll_loop.poll_once().await;
    assert_eq!((ok, failed), (0, 0));
}

/// Scenario 3: sticky reload keeps an instrument missing from a refreshed
/// snapshot alive until its expiration passes.
#[tokio::test]
async fn sticky_reload_keeps_unexpired_instrument_missing_from_new_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let store = Arc::new(SnapshotStore::new(&config.output_dir));

    let now_ms = chrono::Utc::now().timestamp_millis();
    let far_future = now_ms + 3_600_000;

    let mut instruments = BTreeMap::new();
    instruments.insert(
        "v:A".to_string(),
        Instrument {
            venue: "v".into(),
            instrument_key: Some("v:A".into()),
            instrument_id: Some("v:A".into()),
            market_id: Some("m".into()),
            poll_key: Some("A".into()),
            slug: None,
            asset_id: None,
            underlying: None,
            expiration: Some(far_future),
            extra: Default::default(),
        },
    );
    instruments.insert(
        "v:B".to_string(),
        Instrument {
            venue: "v".into(),
            instrument_key: Some("v:B".into()),
            instrument_id: Some("v:B".into()),
            market_id: Some("m".into()),
            poll_key: Some("B".into()),
            slug: None,
            asset_id: None,
            underlying: None,
            expiration: Some(far_future),
            extra: Default::default(),
        },
    );
    store.publish(&ActiveSet::new("v", instruments)).unwrap();

    let venue: Arc<FakeVenue> = Arc::new(FakeVenue::new(vec![]));
    let client: Arc<dyn VenueClient> = venue;
    let poll_loop = PollLoop::new("v", client, None, store.clone(), &config, None).unwrap();

    // First reload picks up both A and B from the snapshot above.
    let (ok, _) = poll_loop.reload_and_poll_once(&config).await;
    assert_eq!(ok, 2);

    // Discovery republishes with only A present; B should stay active
    // because it has not yet hit its expiration. A short sleep guarantees
    // the new snapshot's mtime is observably newer than the first.
    tokio::time::sleep(Duration::from_millis(10)).await;
    let mut only_a = BTreeMap::new();
    only_a.insert(
        "v:A".to_string(),
        instrument("A", Some(far_future)),
    );
    store
        .publish(&ActiveSet::new("v", only_a))
        .unwrap();

    let (ok, _) = poll_loop.reload_and_poll_once(&config).await;
    assert_eq!(ok, 2, "B must stay active past the snapshot gap (sticky reload)");
}
