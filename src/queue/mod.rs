//! Pending-write queue.
//!
//! Records the UI could not deliver are kept here, one queue per entity type,
//! until a sync run confirms delivery and removes them.

mod storage;
mod types;

pub use storage::{MemoryQueue, PendingStore, SqliteQueue};
pub use types::{EntityKind, PendingRecord};
