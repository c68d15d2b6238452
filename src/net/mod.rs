//! Network-facing capabilities: fetching resources and delivering pending writes.

pub mod client;
pub mod delivery;
pub mod types;

pub use client::{Fetcher, HttpFetcher};
pub use delivery::{Delivery, DryRunDelivery, HttpDelivery};
pub use types::{BodyEncoding, Destination, Request, Response};

/// Upper bound on any single network round trip
pub const REQUEST_TIMEOUT_SECS: u64 = 30;
