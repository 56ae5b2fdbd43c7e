//! Flight Cache - A bounded, time-expiring cache with single-flight recomputation
//!
//! Entries expire after a fixed TTL and the cache holds at most `capacity` keys, evicting the
//! oldest *inserted* key first. Concurrent `fetch_or_compute` calls for the same stale key run
//! the value producer exactly once and share its result.

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;

pub use cache::{CacheStats, CacheStore, Entry, EvictionMap};
pub use clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use config::CacheConfig;
pub use error::{CacheError, Result};
