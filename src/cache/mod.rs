//! Named, versioned cache stores for intercepted responses.
//!
//! A store maps request identities (method + URL) to full response snapshots.
//! Entries are never refreshed or evicted individually; a whole store is
//! dropped when its version is superseded.

mod storage;
mod traits;

pub use storage::{CacheStorage, MemoryStorage, SqliteStorage};
pub use traits::{CacheSource, CachedResponse, RequestKey};
