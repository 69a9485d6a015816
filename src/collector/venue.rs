//! Capability interfaces a venue plugs in. Nothing in this module talks
//! to a real exchange; it only describes the shape a venue integration
//! must have to be driven by `DiscoveryLoop` and `PollLoop`.

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;

use super::types::Instrument;

/// Error returned by a venue's order-book fetch.
///
/// `status_code` is the structured field the classifier prefers; when a
/// venue client can't surface one, the classifier falls back to parsing
/// a `[NNN]` token out of `message`.
#[derive(Debug)]
pub struct FetchError {
    pub message: String,
    pub status_code: Option<u16>,
    pub source: Option<anyhow::Error>,
}

impl FetchError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: None,
            source: None,
        }
    }

    pub fn with_status(mut self, code: u16) -> Self {
        self.status_code = Some(code);
        self
    }

    pub fn with_source(mut self, source: anyhow::Error) -> Self {
        self.source = Some(source);
        self
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for FetchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref())
    }
}

/// What a venue integration must provide to be driven by the collector.
#[async_trait]
pub trait VenueClient: Send + Sync {
    /// Enumerate currently tradable instruments. Discovery treats an
    /// error here as a single failed cycle, not a fatal condition.
    async fn discover_instruments(&self) -> anyhow::Result<Vec<Instrument>>;

    /// Fetch the current order-book state for one instrument.
    async fn get_orderbook(&self, poll_key: &str) -> Result<Value, FetchError>;
}

/// Reshapes a raw order-book payload into a venue's normalized record
/// shape. Returning `None` tells the caller to fall back to the raw
/// envelope unchanged.
pub trait Normalizer: Send + Sync {
    fn normalize(&self, raw: &Value, full_orderbook: bool) -> Option<Value>;
}

/// Normalizer used when a venue doesn't supply one: the write-boundary
/// invariants in `poll_loop` still apply, this just skips any reshaping.
pub struct PassthroughNormalizer;

impl Normalizer for PassthroughNormalizer {
    fn normalize(&self, _raw: &Value, _full_orderbook: bool) -> Option<Value> {
        None
    }
}
