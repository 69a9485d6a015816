//! Wires a `DiscoveryLoop` and `PollLoop` per configured venue and owns
//! process-wide shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::aimd::AimdConfig;
use super::config::Config;
use super::discovery_loop::DiscoveryLoop;
use super::poll_loop::PollLoop;
use super::snapshot_store::SnapshotStore;
use super::venue::{Normalizer, VenueClient};

/// Everything needed to run one venue end to end.
pub struct VenueSetup {
    pub name: String,
    pub client: Arc<dyn VenueClient>,
    pub normalizer: Option<Arc<dyn Normalizer>>,
}

pub struct Orchestrator {
    config: Arc<Config>,
    venues: Vec<VenueSetup>,
    snapshot_store: Arc<SnapshotStore>,
}

impl Orchestrator {
    pub fn new(config: Config, mut venues: Vec<VenueSetup>) -> Self {
        // Sorted order keeps poll-cycle and log output deterministic
        // across runs, which matters when diffing collector output.
        venues.sort_by(|a, b| a.name.cmp(&b.name));
        let snapshot_store = Arc::new(SnapshotStore::new(config.output_dir.clone()));
        Self {
            config: Arc::new(config),
            venues,
            snapshot_store,
        }
    }

    /// Spawns a discovery and a poll task per venue and runs until a
    /// shutdown signal is received, then gives every loop a chance to
    /// finish its current cycle and close its writers.
    pub async fn run(self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.config.output_dir)?;

        let mut poll_loops = Vec::new();
        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        for setup in &self.venues {
            let discovery = DiscoveryLoop::new(
                setup.name.clone(),
                setup.client.clone(),
                self.snapshot_store.clone(),
                self.config.output_dir.clone(),
                self.config.rotate_minutes,
                self.config.flush_interval_seconds,
                self.config.schema_version_markets,
                Duration::from_secs_f64(self.config.discover_interval_seconds),
            );

            let mut discovery_shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                tokio::select! {
                    _ = discovery.run_forever() => {},
                    _ = discovery_shutdown.changed() => {
                        info!("discovery loop shutting down");
                    }
                }
            }));

            let aimd_config = self.config.aimd_enabled.then(|| AimdConfig {
                start_inflight: self.config.aimd_start_inflight,
                ceiling_max: self.config.aimd_ceiling(&setup.name),
                stable_window: Duration::from_secs(self.config.aimd_stable_window_secs(&setup.name)),
                min_adjust_interval: Duration::from_secs(self.config.aimd_min_adjust_interval_secs(&setup.name)),
                p95_high_ms: self.config.aimd_p95_high_ms(&setup.name),
                p95_low_ms: self.config.aimd_p95_low_ms(&setup.name),
                fail_rate_high: self.config.aimd_fail_rate_high(&setup.name),
            });

            let poll_loop = Arc::new(PollLoop::new(
                setup.name.clone(),
                setup.client.clone(),
                setup.normalizer.clone(),
                self.snapshot_store.clone(),
                &self.config,
                aimd_config,
            )?);
            poll_loops.push(poll_loop);
        }

        let poll_interval = Duration::from_secs_f64(self.config.poll_interval_seconds);
        let config = self.config.clone();
        let mut poll_shutdown = shutdown.clone();
        let poll_loops_for_task = poll_loops.clone();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = poll_shutdown.changed() => {
                        info!("poll cycle shutting down");
                        break;
                    }
                    _ = async {
                        let cycle_start = std::time::Instant::now();
                        for poll_loop in &poll_loops_for_task {
                            let (ok, failed) = poll_loop.reload_and_poll_once(&config).await;
                            if failed > 0 {
                                warn!(ok, failed, "poll cycle had failures");
                            }
                        }
                        let elapsed = cycle_start.elapsed();
                        let sleep_for = poll_interval.saturating_sub(elapsed);
                        tokio::time::sleep(sleep_for).await;
                    } => {}
                }
            }
        }));

        shutdown.changed().await.ok();
        for handle in handles {
            let _ = handle.await;
        }

        for poll_loop in &poll_loops {
            if let Err(err) = poll_loop.close(&self.config).await {
                warn!(error = %err, "failed to close poll loop writers cleanly");
            }
        }

        Ok(())
    }
}
