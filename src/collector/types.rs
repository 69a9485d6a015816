//! Shared data model: instruments, active sets, and poll counters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// One tradable market/outcome token on a venue.
///
/// `extra` carries whatever venue-specific fields discovery attached
/// (underlying, question text, outcome labels, ...) so normalizers can
/// still see them even though this crate only understands the envelope
/// fields by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instrument {
    pub venue: String,

    #[serde(default)]
    pub instrument_key: Option<String>,
    #[serde(default)]
    pub instrument_id: Option<String>,
    #[serde(default)]
    pub market_id: Option<String>,
    #[serde(default)]
    pub poll_key: Option<String>,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub asset_id: Option<String>,
    #[serde(default)]
    pub underlying: Option<String>,

    /// Expiration timestamp in epoch milliseconds, if the venue has one.
    #[serde(default)]
    pub expiration: Option<i64>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Instrument {
    /// `poll_key -> slug -> asset_id -> instrument_id`, the same fallback
    /// chain discovery uses to derive a stable instrument key.
    pub fn fallback_key(&self) -> Option<&str> {
        self.poll_key
            .as_deref()
            .or(self.slug.as_deref())
            .or(self.asset_id.as_deref())
            .or(self.instrument_id.as_deref())
    }

    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        matches!(self.expiration, Some(exp) if exp <= now_ms)
    }
}

/// Persisted, versioned active set for one venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveSet {
    pub asof_ts_utc: DateTime<Utc>,
    pub venue: String,
    pub count: usize,
    pub instruments: BTreeMap<String, Instrument>,
}

impl ActiveSet {
    pub fn new(venue: impl Into<String>, instruments: BTreeMap<String, Instrument>) -> Self {
        let count = instruments.len();
        Self {
            asof_ts_utc: Utc::now(),
            venue: venue.into(),
            count,
            instruments,
        }
    }
}

/// Aggregated telemetry for a single poll cycle of one venue.
#[derive(Debug, Clone, Default)]
pub struct PollCounters {
    pub submitted: u64,
    pub successes: u64,
    pub failures: u64,
    pub rate_limited: u64,
    pub client_errors: u64,
    pub server_errors: u64,
    pub timeouts: u64,
    pub other_errors: u64,
}

impl PollCounters {
    pub fn record_failure(&mut self, kind: super::error::FailureKind) {
        self.failures += 1;
        match kind {
            super::error::FailureKind::RateLimited => self.rate_limited += 1,
            super::error::FailureKind::ClientError => self.client_errors += 1,
            super::error::FailureKind::ServerError => self.server_errors += 1,
            super::error::FailureKind::Timeout => self.timeouts += 1,
            super::error::FailureKind::Other => self.other_errors += 1,
        }
    }
}

/// Percentile from an already-sorted slice. Empty input yields `None`,
/// never zero or a panic.
pub fn percentile_from_sorted(values: &[i64], p: f64) -> Option<i64> {
    if values.is_empty() {
        return None;
    }
    let idx = (p * (values.len() - 1) as f64) as usize;
    values.get(idx).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentile_empty_is_none() {
        assert_eq!(percentile_from_sorted(&[], 0.95), None);
    }

    #[test]
    fn percentile_picks_index() {
        let values = vec![10, 20, 30, 40, 50];
        assert_eq!(percentile_from_sorted(&values, 0.0), Some(10));
        assert_eq!(percentile_from_sorted(&values, 1.0), Some(50));
    }

    #[test]
    fn fallback_key_prefers_poll_key() {
        let inst = Instrument {
            venue: "limitless".into(),
            instrument_key: None,
            instrument_id: Some("x".into()),
            market_id: None,
            poll_key: Some("pk".into()),
            slug: Some("slug".into()),
            asset_id: None,
            underlying: None,
            expiration: None,
            extra: BTreeMap::new(),
        };
        assert_eq!(inst.fallback_key(), Some("pk"));
    }
}
