//! Tag-aware TTL cache with per-entity read strategies.
//!
//! - `CacheStore` holds entries with TTL, max-age, priority and tags
//! - `CacheLayer` applies cache-first / network-first / stale-while-revalidate /
//!   network-only / cache-only on top of a store
//! - Stale entries are served when the network fails (offline mode)

mod layer;
mod store;
mod traits;

pub use layer::CacheLayer;
pub use store::{CacheStore, Lookup, CACHE_METRICS_KEY};
pub use traits::{CacheEntry, CacheRead, CacheStats, ReadOrigin, SetOptions};
