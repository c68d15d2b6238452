//! Response cache with offline support.
//!
//! This module provides a keyed store of GET responses that:
//! - Partitions entries by version tag (static build assets, dynamic runtime fetches)
//! - Persists only successful responses, each written atomically
//! - Applies cache-first or network-first policy around a network fetch
//! - Falls back to cached copies or synthetic offline responses when the network is down

mod layer;
mod storage;
mod traits;

pub use layer::{CacheLayer, CACHE_FIRST_OFFLINE_MESSAGE, NETWORK_FIRST_OFFLINE_MESSAGE};
pub use storage::{MemoryStorage, ResponseStore, SqliteStorage};
pub use traits::{CacheResult, CacheSource, CachedResponse, RequestKey};
