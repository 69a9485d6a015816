//! Multi-venue market-data collection: discovery + order-book polling.
//!
//! Two cooperating loops share nothing but the filesystem:
//! `DiscoveryLoop` enumerates instruments and publishes a versioned active
//! set per venue; `PollLoop` consumes that active set and fetches order
//! books under per-venue rate limits, writing normalized JSONL logs.

pub mod aimd;
pub mod backoff;
pub mod config;
pub mod discovery_loop;
pub mod error;
pub mod orchestrator;
pub mod poll_loop;
pub mod rotating_sink;
pub mod snapshot_store;
pub mod types;
pub mod venue;

pub use aimd::{AimdConfig, AimdController, AimdState};
pub use backoff::{BackoffEntry, BackoffTable};
pub use config::{Config, VenueOverride};
pub use discovery_loop::DiscoveryLoop;
pub use error::{classify_failure, extract_status_code, FailureKind};
pub use orchestrator::{Orchestrator, VenueSetup};
pub use poll_loop::PollLoop;
pub use rotating_sink::RotatingSink;
pub use snapshot_store::SnapshotStore;
pub use types::{ActiveSet, Instrument, PollCounters};
pub use venue::{FetchError, Normalizer, VenueClient};
