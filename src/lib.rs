//! Multi-venue market-data collector library.
//!
//! Exposes the scheduling, storage, and control-loop machinery under
//! [`collector`]. Venue integrations (HTTP clients, normalizers) are
//! expected to implement [`collector::VenueClient`] and
//! [`collector::Normalizer`] and are plugged in by the embedding
//! application — none ship here.

pub mod collector;
