//! # Response Caching Module
//!
//! Generated SQL is cached per (connection, normalised question, intent) so a
//! repeated question skips the provider walk entirely.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`CacheKey`] | SHA-256 key over the normalised request fields |
//! | [`ResponseCache`] | LRU-bounded store with a TTL and hit statistics |
//!
//! ```rust
//! use nl2sql_runtime::cache::{CacheKey, ResponseCache};
//! use std::time::Duration;
//!
//! let cache = ResponseCache::new(1000, Duration::from_secs(300));
//! let key = CacheKey::for_query(Some("warehouse"), "orders per month", None);
//! cache.insert(&key, "SELECT date_trunc('month', created_at), count(*) FROM orders GROUP BY 1".to_string());
//! assert!(cache.get(&key).is_some());
//! ```

mod key;
mod store;

pub use key::CacheKey;
pub use store::{CacheStats, ResponseCache};
