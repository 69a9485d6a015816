//! The core scheduling and fetch loop: selects eligible instruments,
//! runs bounded concurrent fetches, routes results back through a single
//! owning task, and writes normalized order-book records.
//!
//! Concurrency boundary is strict and deliberate: only `get_orderbook`
//! itself runs off this task. Backoff state, AIMD state, counters, and
//! sinks are only ever touched here, so none of them need their own
//! synchronization.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::aimd::{AimdConfig, AimdController};
use super::backoff::BackoffTable;
use super::config::Config;
use super::error::{classify_failure, extract_status_code, FailureKind};
use super::rotating_sink::RotatingSink;
use super::snapshot_store::SnapshotStore;
use super::types::{percentile_from_sorted, Instrument, PollCounters};
use super::venue::{FetchError, Normalizer, PassthroughNormalizer, VenueClient};

const LATENCY_BUFFER_CAP: usize = 5_000;
const STATS_LATENCY_SAMPLE: usize = 500;

struct WorkItem {
    key: String,
    poll_key: String,
    instrument: Instrument,
}

pub struct PollLoop {
    venue: String,
    client: Arc<dyn VenueClient>,
    normalizer: Arc<dyn Normalizer>,
    snapshot_store: Arc<SnapshotStore>,

    output_dir: std::path::PathBuf,
    rotate_minutes: u64,
    fsync_seconds: u64,
    full_orderbook: bool,
    schema_version_orderbook: u32,
    orderbook_timeout: Duration,
    rate_limit_cooldown: Duration,
    stats_interval: Duration,
    error_sample_every: u32,
    max_inflight: usize,
    expire_grace: Duration,

    state: tokio::sync::Mutex<State>,
    aimd: Option<AimdController>,
}

struct State {
    current_date: String,
    books_writer: RotatingSink,
    stats_writer: RotatingSink,
    errors_writer: RotatingSink,

    active: BTreeMap<String, Instrument>,
    snapshot_mtime: Option<std::time::SystemTime>,
    snapshot_asof: Option<DateTime<Utc>>,

    backoff: BackoffTable,
    cooldown_until: Option<Instant>,
    latencies: VecDeque<i64>,
    stats_last_written: Option<Instant>,
}

impl PollLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        venue: impl Into<String>,
        client: Arc<dyn VenueClient>,
        normalizer: Option<Arc<dyn Normalizer>>,
        snapshot_store: Arc<SnapshotStore>,
        config: &Config,
        aimd_config: Option<AimdConfig>,
    ) -> std::io::Result<Self> {
        let venue = venue.into();
        let date_str = Utc::now().format("%Y-%m-%d").to_string();
        let (_, max_inflight) = config.venue_limits(&venue);

        let state = State {
            current_date: date_str.clone(),
            books_writer: Self::open_writer(&config.output_dir, &venue, "orderbooks", &date_str, config)?,
            stats_writer: Self::open_writer(&config.output_dir, &venue, "poll_stats", &date_str, config)?,
            errors_writer: Self::open_writer(&config.output_dir, &venue, "poll_errors", &date_str, config)?,
            active: BTreeMap::new(),
            snapshot_mtime: None,
            snapshot_asof: None,
            backoff: BackoffTable::new(),
            cooldown_until: None,
            latencies: VecDeque::with_capacity(LATENCY_BUFFER_CAP),
            stats_last_written: None,
        };

        Ok(Self {
            venue: venue.clone(),
            client,
            normalizer: normalizer.unwrap_or_else(|| Arc::new(PassthroughNormalizer)),
            snapshot_store,
            output_dir: config.output_dir.clone(),
            rotate_minutes: config.rotate_minutes,
            fsync_seconds: config.flush_interval_seconds,
            full_orderbook: config.full_orderbook,
            schema_version_orderbook: config.schema_version_orderbook,
            orderbook_timeout: Duration::from_millis(config.orderbook_timeout_ms(&venue)),
            rate_limit_cooldown: Duration::from_secs_f64(config.rate_limit_cooldown_seconds),
            stats_interval: Duration::from_secs_f64(config.poll_stats_interval_seconds),
            error_sample_every: config.poll_error_sample_every,
            max_inflight,
            expire_grace: Duration::from_secs(config.expire_grace_seconds.max(0) as u64),
            state: tokio::sync::Mutex::new(state),
            aimd: aimd_config.map(AimdController::new),
        })
    }

    fn open_writer(
        output_dir: &std::path::Path,
        venue: &str,
        prefix: &str,
        date_str: &str,
        config: &Config,
    ) -> std::io::Result<RotatingSink> {
        RotatingSink::open(
            output_dir.join(venue).join(prefix).join(format!("date={date_str}")),
            prefix,
            config.rotate_minutes,
            config.flush_interval_seconds,
        )
    }

    /// Close all partition-day writers for the old date and reopen fresh
    /// ones for the new UTC date, if the date has changed.
    async fn rollover_if_needed(&self, config: &Config) -> std::io::Result<()> {
        let new_date = Utc::now().format("%Y-%m-%d").to_string();
        let mut state = self.state.lock().await;
        if new_date == state.current_date {
            return Ok(());
        }

        state.books_writer.close()?;
        state.stats_writer.close()?;
        state.errors_writer.close()?;

        state.books_writer = Self::open_writer(&self.output_dir, &self.venue, "orderbooks", &new_date, config)?;
        state.stats_writer = Self::open_writer(&self.output_dir, &self.venue, "poll_stats", &new_date, config)?;
        state.errors_writer = Self::open_writer(&self.output_dir, &self.venue, "poll_errors", &new_date, config)?;

        info!(venue = %self.venue, from = %state.current_date, to = %new_date, "poll loop rollover");
        state.current_date = new_date;
        Ok(())
    }

    /// Sticky reload: merge the freshly published snapshot with the
    /// in-memory active set, keeping unexpired instruments that dropped
    /// out of the new snapshot and pruning anything past expiration even
    /// if the snapshot still lists it.
    async fn maybe_reload_snapshot(&self) {
        let Some(mtime) = self.snapshot_store.mtime(&self.venue) else {
            return;
        };

        let mut state = self.state.lock().await;
        if state.snapshot_mtime.map(|prev| mtime <= prev).unwrap_or(false) {
            return;
        }

        let new_instruments = self.snapshot_store.load_instruments(&self.venue);
        let now_ms = Utc::now().timestamp_millis();
        let grace_ms = self.expire_grace.as_millis() as i64;

        let not_expired = |inst: &Instrument| -> bool {
            match inst.expiration {
                Some(exp) => exp + grace_ms > now_ms,
                None => true,
            }
        };

        let mut merged = new_instruments;
        for (key, inst) in state.active.iter() {
            if !merged.contains_key(key) && not_expired(inst) {
                merged.insert(key.clone(), inst.clone());
            }
        }
        merged.retain(|_, inst| !inst.is_expired_at(now_ms));

        let old_keys: std::collections::BTreeSet<_> = state.active.keys().cloned().collect();
        let new_keys: std::collections::BTreeSet<_> = merged.keys().cloned().collect();
        let added = new_keys.difference(&old_keys).count();
        let removed = old_keys.difference(&new_keys).count();

        state.active = merged;
        state.backoff.retain_keys(state.active.keys().map(|s| s.as_str()));
        state.snapshot_mtime = Some(mtime);

        info!(
            venue = %self.venue,
            count = state.active.len(),
            added,
            removed,
            "poll loop reloaded snapshot"
        );
    }

    fn select_eligible(state: &State, max_inflight: usize, now: Instant) -> Vec<WorkItem> {
        let mut eligible = Vec::new();
        for (key, inst) in state.active.iter() {
            if !state.backoff.is_eligible(key, now) {
                continue;
            }
            let Some(poll_key) = &inst.poll_key else {
                continue;
            };
            eligible.push(WorkItem {
                key: key.clone(),
                poll_key: poll_key.clone(),
                instrument: inst.clone(),
            });
            if eligible.len() >= max_inflight {
                break;
            }
        }
        eligible
    }

    async fn fetch_one(
        client: Arc<dyn VenueClient>,
        timeout: Duration,
        item: WorkItem,
    ) -> (WorkItem, Result<Value, FetchError>, i64) {
        let start = Instant::now();
        let result = match tokio::time::timeout(timeout, client.get_orderbook(&item.poll_key)).await {
            Ok(r) => r,
            Err(_) => Err(FetchError::new(format!("get_orderbook timed out after {:?}", timeout))),
        };
        let latency_ms = start.elapsed().as_millis() as i64;
        (item, result, latency_ms)
    }

    fn build_record(&self, asof: Option<DateTime<Utc>>, item: &WorkItem, raw_ob: Value) -> Value {
        let now = Utc::now();
        let snap = json!({
            "timestamp": now.to_rfc3339(),
            "snapshot_asof": asof.map(|a| a.to_rfc3339()),
            "market_id": item.instrument.market_id,
            "slug": item.instrument.slug,
            "underlying": item.instrument.underlying,
            "orderbook": raw_ob,
            "instrument_key": item.key,
            "instrument_id": item.instrument.instrument_id,
            "venue": self.venue,
            "poll_key": item.poll_key,
        });

        let mut record = self
            .normalizer
            .normalize(&snap, self.full_orderbook)
            .filter(|v| v.is_object())
            .unwrap_or_else(|| snap.clone());

        // `snap` is always a JSON object, so if the normalizer returned
        // something other than an object we just fell back to it above —
        // this can't fail.
        let obj = record.as_object_mut().expect("snap is always a JSON object");

        obj.entry("venue").or_insert_with(|| self.venue.clone().into());

        let poll_key = obj
            .get("poll_key")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| item.poll_key.clone());
        obj.insert("poll_key".into(), poll_key.clone().into());
        let canonical_id = format!("{}:{}", self.venue, poll_key);
        obj.insert("instrument_id".into(), canonical_id.into());

        if !obj.contains_key("ts_ms") {
            let iso = obj
                .get("ts_utc")
                .or_else(|| obj.get("timestamp"))
                .and_then(|v| v.as_str())
                .unwrap_or_else(|| snap["timestamp"].as_str().unwrap());
            if let Some(ts_ms) = parse_iso_to_ms(iso) {
                obj.insert("ts_ms".into(), ts_ms.into());
            }
        }

        if !obj.contains_key("ob_ts_ms") {
            if let Some(ob) = obj.get("orderbook").and_then(|v| v.as_object()) {
                if let Some(ts) = ob.get("timestamp").and_then(|v| v.as_i64()) {
                    obj.insert("ob_ts_ms".into(), ts.into());
                }
            }
        }

        obj.entry("record_type").or_insert_with(|| "orderbook".into());
        obj.entry("schema_version")
            .or_insert_with(|| self.schema_version_orderbook.into());

        record
    }

    async fn write_stats_if_due(&self, state: &mut State, counters: &PollCounters, now: Instant) {
        if state
            .stats_last_written
            .map(|t| now.duration_since(t) < self.stats_interval)
            .unwrap_or(false)
        {
            return;
        }

        let sample_len = state.latencies.len().min(STATS_LATENCY_SAMPLE);
        let mut sample: Vec<i64> = state
            .latencies
            .iter()
            .skip(state.latencies.len() - sample_len)
            .copied()
            .collect();
        sample.sort_unstable();

        let cooldown_remaining = state
            .cooldown_until
            .map(|until| until.saturating_duration_since(now).as_secs_f64())
            .unwrap_or(0.0);

        let record = json!({
            "ts_utc": Utc::now().to_rfc3339(),
            "ts_ms": Utc::now().timestamp_millis(),
            "venue": self.venue,
            "active_count": state.active.len(),
            "submitted": counters.submitted,
            "successes": counters.successes,
            "failures": counters.failures,
            "http_429": counters.rate_limited,
            "http_4xx": counters.client_errors,
            "http_5xx": counters.server_errors,
            "timeouts": counters.timeouts,
            "other_errs": counters.other_errors,
            "lat_p50_ms": percentile_from_sorted(&sample, 0.50),
            "lat_p95_ms": percentile_from_sorted(&sample, 0.95),
            "cooldown_remaining_s": cooldown_remaining,
            "max_inflight": self
                .aimd
                .as_ref()
                .map(|a| a.ceiling().min(self.max_inflight))
                .unwrap_or(self.max_inflight),
            "record_type": "poll_stats",
            "schema_version": self.schema_version_orderbook,
        });

        if let Err(err) = state.stats_writer.write_value(&record) {
            warn!(venue = %self.venue, error = %err, "failed to write poll stats record");
        }
        state.stats_last_written = Some(now);
    }

    /// Run one poll cycle for this venue. Returns `(successes, failures)`.
    pub async fn poll_once(&self) -> (u64, u64) {
        let now = Instant::now();

        {
            let state = self.state.lock().await;
            if state.cooldown_until.map(|u| now < u).unwrap_or(false) {
                return (0, 0);
            }
        }

        let mut counters = PollCounters::default();
        // Effective cap is always the tighter of the AIMD ceiling (when
        // enabled) and the statically configured max_inflight/max_workers
        // clamp baked into `self.max_inflight` — AIMD can only shrink the
        // window further, never widen it past the configured ceiling.
        let effective_inflight = self
            .aimd
            .as_ref()
            .map(|a| a.ceiling().min(self.max_inflight))
            .unwrap_or(self.max_inflight);

        let eligible = {
            let state = self.state.lock().await;
            Self::select_eligible(&state, effective_inflight, now)
        };
        counters.submitted = eligible.len() as u64;

        let fetches = eligible
            .into_iter()
            .map(|item| Self::fetch_one(self.client.clone(), self.orderbook_timeout, item));
        let results = join_all(fetches).await;

        let mut state = self.state.lock().await;
        let asof = state.snapshot_asof;

        for (item, result, latency_ms) in results {
            state.latencies.push_back(latency_ms);
            if state.latencies.len() > LATENCY_BUFFER_CAP {
                state.latencies.pop_front();
            }

            match result {
                Ok(raw_ob) => {
                    state.backoff.on_success(&item.key);
                    counters.successes += 1;
                    let record = self.build_record(asof, &item, raw_ob);
                    if let Err(err) = state.books_writer.write_value(&record) {
                        warn!(venue = %self.venue, error = %err, "failed to write order-book record");
                    }
                }
                Err(fetch_err) => {
                    let kind = classify_failure(&fetch_err);
                    counters.record_failure(kind);

                    let rate_limited = kind == FailureKind::RateLimited;
                    if rate_limited {
                        let until = now + self.rate_limit_cooldown;
                        state.cooldown_until = Some(state.cooldown_until.map(|u| u.max(until)).unwrap_or(until));
                    }

                    let backoff_secs = state.backoff.on_failure(&item.key, now);
                    let status_code = extract_status_code(&fetch_err);

                    if state.backoff.should_log(&item.key, now) {
                        warn!(
                            venue = %self.venue,
                            instrument_key = %item.key,
                            status = ?status_code,
                            latency_ms,
                            backoff_secs,
                            kind = %kind,
                            error = %fetch_err,
                            "order-book fetch failed"
                        );
                    }

                    if self.error_sample_every > 0
                        && state.backoff.entry(&item.key).count % self.error_sample_every == 0
                    {
                        let record = json!({
                            "ts_utc": Utc::now().to_rfc3339(),
                            "ts_ms": Utc::now().timestamp_millis(),
                            "venue": self.venue,
                            "instrument_key": item.key,
                            "poll_key": item.poll_key,
                            "status": status_code,
                            "latency_ms": latency_ms,
                            "error": fetch_err.to_string(),
                            "record_type": "poll_error",
                        });
                        if let Err(err) = state.errors_writer.write_value(&record) {
                            warn!(venue = %self.venue, error = %err, "failed to write sampled error record");
                        }
                    }
                }
            }
        }

        self.write_stats_if_due(&mut state, &counters, now).await;

        // AIMD is driven once per cycle from the cycle's aggregated
        // counters and the recent latency sample, never once per fetch
        // result — three 429s in one cycle must halve the ceiling once,
        // not three times.
        if let Some(aimd) = &self.aimd {
            let fail_rate = counters.failures as f64 / (counters.submitted.max(1) as f64);
            let sample_len = state.latencies.len().min(STATS_LATENCY_SAMPLE);
            let mut sample: Vec<i64> = state
                .latencies
                .iter()
                .skip(state.latencies.len() - sample_len)
                .copied()
                .collect();
            sample.sort_unstable();
            let p95 = percentile_from_sorted(&sample, 0.95);
            aimd.on_cycle(counters.rate_limited > 0, fail_rate, p95, now);
        }

        if counters.failures >= (3.max(state.active.len() / 2)) as u64 {
            let until = now + Duration::from_secs(10);
            state.cooldown_until = Some(state.cooldown_until.map(|u| u.max(until)).unwrap_or(until));
            warn!(
                venue = %self.venue,
                failures = counters.failures,
                successes = counters.successes,
                "high failure rate this cycle, cooling down"
            );
        }

        (counters.successes, counters.failures)
    }

    pub async fn close(&self, config: &Config) -> std::io::Result<()> {
        let _ = config;
        let mut state = self.state.lock().await;
        state.books_writer.close()?;
        state.stats_writer.close()?;
        state.errors_writer.close()?;
        Ok(())
    }

    pub async fn reload_and_poll_once(&self, config: &Config) -> (u64, u64) {
        let _ = self.rollover_if_needed(config).await;
        self.maybe_reload_snapshot().await;
        self.poll_once().await
    }
}

fn parse_iso_to_ms(iso: &str) -> Option<i64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(iso) {
        return Some(dt.timestamp_millis());
    }
    chrono::NaiveDateTime::parse_from_str(iso, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc).timestamp_millis())
}
