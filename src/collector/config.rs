//! Environment-driven configuration, following the same
//! `dotenv` + `std::env::var(..).unwrap_or_else(..).parse().unwrap_or(..)`
//! shape used elsewhere in this codebase's `Config::from_env`.

use std::collections::HashMap;
use std::path::PathBuf;

/// Per-venue knobs that override the global default when present.
#[derive(Debug, Clone, Default)]
pub struct VenueOverride {
    pub max_workers: Option<usize>,
    pub max_inflight: Option<usize>,
    pub orderbook_timeout_ms: Option<u64>,
    pub aimd_ceiling: Option<usize>,
    pub aimd_stable_window: Option<u32>,
    pub aimd_min_adjust_interval_secs: Option<u64>,
    pub aimd_p95_high_ms: Option<i64>,
    pub aimd_p95_low_ms: Option<i64>,
    pub aimd_fail_rate_high: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub output_dir: PathBuf,

    pub rotate_minutes: u64,
    pub flush_interval_seconds: u64,
    pub poll_interval_seconds: f64,
    pub discover_interval_seconds: f64,
    pub expire_grace_seconds: i64,
    pub full_orderbook: bool,

    pub poll_max_workers_default: usize,
    pub poll_max_inflight_default: usize,
    pub orderbook_timeout_ms_default: u64,

    pub rate_limit_cooldown_seconds: f64,
    pub poll_stats_interval_seconds: f64,
    pub poll_error_sample_every: u32,

    pub aimd_enabled: bool,
    pub aimd_start_inflight: usize,
    pub aimd_ceiling_default: usize,
    pub aimd_stable_window_default: u32,
    pub aimd_min_adjust_interval_secs_default: u64,
    pub aimd_p95_high_ms_default: i64,
    pub aimd_p95_low_ms_default: i64,
    pub aimd_fail_rate_high_default: f64,

    pub schema_version_orderbook: u32,
    pub schema_version_markets: u32,

    pub venue_overrides: HashMap<String, VenueOverride>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from(".outputs/logs"),
            rotate_minutes: 10,
            flush_interval_seconds: 5,
            poll_interval_seconds: 2.0,
            discover_interval_seconds: 60.0,
            expire_grace_seconds: 120,
            full_orderbook: true,
            poll_max_workers_default: 8,
            poll_max_inflight_default: 8,
            orderbook_timeout_ms_default: 8_000,
            rate_limit_cooldown_seconds: 30.0,
            poll_stats_interval_seconds: 10.0,
            poll_error_sample_every: 0,
            aimd_enabled: true,
            aimd_start_inflight: 4,
            aimd_ceiling_default: 32,
            aimd_stable_window_default: 20,
            aimd_min_adjust_interval_secs_default: 5,
            aimd_p95_high_ms_default: 1_500,
            aimd_p95_low_ms_default: 400,
            aimd_fail_rate_high_default: 0.2,
            schema_version_orderbook: 1,
            schema_version_markets: 1,
            venue_overrides: HashMap::new(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Scans the environment for `<BASE>_<VENUE>`-suffixed overrides,
/// mirroring the reference settings module's layering of
/// `POLL_MAX_WORKERS_POLY` / `_LIMITLESS` over a `POLL_MAX_WORKERS`
/// default. The venue suffix is lower-cased to match the venue names
/// used elsewhere (`Config::venue_limits`, `VenueSetup::name`, ...).
fn scan_venue_overrides<T: std::str::FromStr>(base_key: &str) -> Vec<(String, T)> {
    let prefix = format!("{base_key}_");
    let mut out = Vec::new();
    for (key, value) in std::env::vars() {
        let Some(venue_suffix) = key.strip_prefix(&prefix) else {
            continue;
        };
        if venue_suffix.is_empty() {
            continue;
        }
        if let Ok(parsed) = value.parse::<T>() {
            out.push((venue_suffix.to_lowercase(), parsed));
        }
    }
    out
}

/// Applies every `<BASE>_<VENUE>` override found in the environment to
/// the matching field on that venue's entry in `overrides`, inserting a
/// fresh `VenueOverride` on first sight of a venue.
fn apply_venue_overrides<T: std::str::FromStr>(
    overrides: &mut HashMap<String, VenueOverride>,
    base_key: &str,
    set: impl Fn(&mut VenueOverride, T),
) {
    for (venue, value) in scan_venue_overrides::<T>(base_key) {
        set(overrides.entry(venue).or_default(), value);
    }
}

fn venue_overrides_from_env() -> HashMap<String, VenueOverride> {
    let mut overrides: HashMap<String, VenueOverride> = HashMap::new();

    apply_venue_overrides::<usize>(&mut overrides, "COLLECTOR_POLL_MAX_WORKERS", |o, v| {
        o.max_workers = Some(v)
    });
    apply_venue_overrides::<usize>(&mut overrides, "COLLECTOR_POLL_MAX_INFLIGHT", |o, v| {
        o.max_inflight = Some(v)
    });
    apply_venue_overrides::<u64>(&mut overrides, "COLLECTOR_ORDERBOOK_TIMEOUT_MS", |o, v| {
        o.orderbook_timeout_ms = Some(v)
    });
    apply_venue_overrides::<usize>(&mut overrides, "COLLECTOR_AIMD_CEILING", |o, v| {
        o.aimd_ceiling = Some(v)
    });
    apply_venue_overrides::<u32>(&mut overrides, "COLLECTOR_AIMD_STABLE_WINDOW", |o, v| {
        o.aimd_stable_window = Some(v)
    });
    apply_venue_overrides::<u64>(
        &mut overrides,
        "COLLECTOR_AIMD_MIN_ADJUST_INTERVAL_SECONDS",
        |o, v| o.aimd_min_adjust_interval_secs = Some(v),
    );
    apply_venue_overrides::<i64>(&mut overrides, "COLLECTOR_AIMD_P95_HIGH_MS", |o, v| {
        o.aimd_p95_high_ms = Some(v)
    });
    apply_venue_overrides::<i64>(&mut overrides, "COLLECTOR_AIMD_P95_LOW_MS", |o, v| {
        o.aimd_p95_low_ms = Some(v)
    });
    apply_venue_overrides::<f64>(&mut overrides, "COLLECTOR_AIMD_FAIL_RATE_HIGH", |o, v| {
        o.aimd_fail_rate_high = Some(v)
    });

    overrides
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let defaults = Self::default();

        let output_dir = std::env::var("COLLECTOR_OUTPUT_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.output_dir);

        Ok(Self {
            output_dir,
            rotate_minutes: env_parse("COLLECTOR_ROTATE_MINUTES", defaults.rotate_minutes),
            flush_interval_seconds: env_parse(
                "COLLECTOR_FLUSH_INTERVAL_SECONDS",
                defaults.flush_interval_seconds,
            ),
            poll_interval_seconds: env_parse(
                "COLLECTOR_POLL_INTERVAL",
                defaults.poll_interval_seconds,
            ),
            discover_interval_seconds: env_parse(
                "COLLECTOR_DISCOVER_INTERVAL",
                defaults.discover_interval_seconds,
            ),
            expire_grace_seconds: env_parse(
                "COLLECTOR_EXPIRE_GRACE_SECONDS",
                defaults.expire_grace_seconds,
            ),
            full_orderbook: env_parse("COLLECTOR_FULL_ORDERBOOK", defaults.full_orderbook),
            poll_max_workers_default: env_parse(
                "COLLECTOR_POLL_MAX_WORKERS",
                defaults.poll_max_workers_default,
            ),
            poll_max_inflight_default: env_parse(
                "COLLECTOR_POLL_MAX_INFLIGHT",
                defaults.poll_max_inflight_default,
            ),
            orderbook_timeout_ms_default: env_parse(
                "COLLECTOR_ORDERBOOK_TIMEOUT_MS",
                defaults.orderbook_timeout_ms_default,
            ),
            rate_limit_cooldown_seconds: env_parse(
                "COLLECTOR_RATE_LIMIT_COOLDOWN_SECONDS",
                defaults.rate_limit_cooldown_seconds,
            ),
            poll_stats_interval_seconds: env_parse(
                "COLLECTOR_POLL_STATS_INTERVAL_SECONDS",
                defaults.poll_stats_interval_seconds,
            ),
            poll_error_sample_every: env_parse(
                "COLLECTOR_POLL_ERROR_SAMPLE_EVERY",
                defaults.poll_error_sample_every,
            ),
            aimd_enabled: env_parse("COLLECTOR_AIMD_ENABLED", defaults.aimd_enabled),
            aimd_start_inflight: env_parse(
                "COLLECTOR_AIMD_START_INFLIGHT",
                defaults.aimd_start_inflight,
            ),
            aimd_ceiling_default: env_parse(
                "COLLECTOR_AIMD_CEILING",
                defaults.aimd_ceiling_default,
            ),
            aimd_stable_window_default: env_parse(
                "COLLECTOR_AIMD_STABLE_WINDOW",
                defaults.aimd_stable_window_default,
            ),
            aimd_min_adjust_interval_secs_default: env_parse(
                "COLLECTOR_AIMD_MIN_ADJUST_INTERVAL_SECONDS",
                defaults.aimd_min_adjust_interval_secs_default,
            ),
            aimd_p95_high_ms_default: env_parse(
                "COLLECTOR_AIMD_P95_HIGH_MS",
                defaults.aimd_p95_high_ms_default,
            ),
            aimd_p95_low_ms_default: env_parse(
                "COLLECTOR_AIMD_P95_LOW_MS",
                defaults.aimd_p95_low_ms_default,
            ),
            aimd_fail_rate_high_default: env_parse(
                "COLLECTOR_AIMD_FAIL_RATE_HIGH",
                defaults.aimd_fail_rate_high_default,
            ),
            schema_version_orderbook: env_parse(
                "COLLECTOR_SCHEMA_VERSION_ORDERBOOK",
                defaults.schema_version_orderbook,
            ),
            schema_version_markets: env_parse(
                "COLLECTOR_SCHEMA_VERSION_MARKETS",
                defaults.schema_version_markets,
            ),
            venue_overrides: venue_overrides_from_env(),
        })
    }

    /// Effective (workers, inflight) for a venue, with inflight clamped
    /// to never exceed workers — the real throttle is inflight, workers
    /// just bounds how many fetches can be outstanding at once.
    pub fn venue_limits(&self, venue: &str) -> (usize, usize) {
        let ov = self.venue_overrides.get(venue);
        let workers = ov
            .and_then(|o| o.max_workers)
            .unwrap_or(self.poll_max_workers_default)
            .max(1);
        let inflight = ov
            .and_then(|o| o.max_inflight)
            .unwrap_or(self.poll_max_inflight_default)
            .min(workers)
            .max(1);
        (workers, inflight)
    }

    pub fn orderbook_timeout_ms(&self, venue: &str) -> u64 {
        self.venue_overrides
            .get(venue)
            .and_then(|o| o.orderbook_timeout_ms)
            .unwrap_or(self.orderbook_timeout_ms_default)
    }

    pub fn aimd_ceiling(&self, venue: &str) -> usize {
        self.venue_overrides
            .get(venue)
            .and_then(|o| o.aimd_ceiling)
            .unwrap_or(self.aimd_ceiling_default)
    }

    pub fn aimd_stable_window_secs(&self, venue: &str) -> u64 {
        self.venue_overrides
            .get(venue)
            .and_then(|o| o.aimd_stable_window)
            .map(u64::from)
            .unwrap_or(self.aimd_stable_window_default.into())
    }

    pub fn aimd_min_adjust_interval_secs(&self, venue: &str) -> u64 {
        self.venue_overrides
            .get(venue)
            .and_then(|o| o.aimd_min_adjust_interval_secs)
            .unwrap_or(self.aimd_min_adjust_interval_secs_default)
    }

    pub fn aimd_p95_high_ms(&self, venue: &str) -> i64 {
        self.venue_overrides
            .get(venue)
            .and_then(|o| o.aimd_p95_high_ms)
            .unwrap_or(self.aimd_p95_high_ms_default)
    }

    pub fn aimd_p95_low_ms(&self, venue: &str) -> i64 {
        self.venue_overrides
            .get(venue)
            .and_then(|o| o.aimd_p95_low_ms)
            .unwrap_or(self.aimd_p95_low_ms_default)
    }

    pub fn aimd_fail_rate_high(&self, venue: &str) -> f64 {
        self.venue_overrides
            .get(venue)
            .and_then(|o| o.aimd_fail_rate_high)
            .unwrap_or(self.aimd_fail_rate_high_default)
    }
}
