//! Per-instrument failure backoff.
//!
//! One entry per instrument key, holding a consecutive-failure count and
//! the monotonic instant after which the instrument is eligible again.
//! Delay is a pure function of the failure count, capped at 60 seconds.

use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct BackoffEntry {
    pub count: u32,
    pub next_ok: Option<Instant>,
    pub last_logged: Option<Instant>,
}

impl Default for BackoffEntry {
    fn default() -> Self {
        Self {
            count: 0,
            next_ok: None,
            last_logged: None,
        }
    }
}

impl BackoffEntry {
    pub fn is_eligible(&self, now: Instant) -> bool {
        match self.next_ok {
            Some(next_ok) => now >= next_ok,
            None => true,
        }
    }
}

/// `min(60, 2 ** min(consecutive_failures, 6))` seconds: 2, 4, 8, 16,
/// 32, 60, capped thereafter.
pub fn backoff_seconds(consecutive_failures: u32) -> u64 {
    60u64.min(2u64.saturating_pow(consecutive_failures.min(6)))
}

#[derive(Debug, Default)]
pub struct BackoffTable {
    entries: HashMap<String, BackoffEntry>,
}

impl BackoffTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(&self, key: &str) -> BackoffEntry {
        self.entries.get(key).copied().unwrap_or_default()
    }

    pub fn is_eligible(&self, key: &str, now: Instant) -> bool {
        self.entry(key).is_eligible(now)
    }

    pub fn on_success(&mut self, key: &str) {
        self.entries.insert(key.to_string(), BackoffEntry::default());
    }

    /// Record a failure, advance the entry's next-eligible time, and
    /// return the applied backoff in seconds.
    pub fn on_failure(&mut self, key: &str, now: Instant) -> u64 {
        let entry = self.entries.entry(key.to_string()).or_default();
        entry.count += 1;
        let secs = backoff_seconds(entry.count);
        entry.next_ok = Some(now + Duration::from_secs(secs));
        secs
    }

    /// Sparse logging gate: log at failure counts 1, 3, 5, or once more
    /// than 60 seconds have elapsed since the last log for this key.
    pub fn should_log(&mut self, key: &str, now: Instant) -> bool {
        let entry = self.entries.entry(key.to_string()).or_default();
        let should = matches!(entry.count, 1 | 3 | 5)
            || entry
                .last_logged
                .map(|t| now.duration_since(t) > Duration::from_secs(60))
                .unwrap_or(true);
        if should {
            entry.last_logged = Some(now);
        }
        should
    }

    /// Drop entries for keys no longer in the active set, so the table
    /// doesn't grow without bound across snapshot reloads.
    pub fn retain_keys<'a>(&mut self, keep: impl Iterator<Item = &'a str>) {
        let keep: std::collections::HashSet<&str> = keep.collect();
        self.entries.retain(|k, _| keep.contains(k.as_str()));
    }
}
