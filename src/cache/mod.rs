//! Cache Module
//!
//! Provides in-memory caching with TTL expiration, insertion-order eviction and
//! single-flight recomputation.

mod entry;
mod eviction;
mod stats;
mod store;


// Re-export public types
pub use entry::Entry;
pub use eviction::EvictionMap;
pub use stats::CacheStats;
pub use store::CacheStore;
