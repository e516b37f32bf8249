#![warn(clippy::all)]
#![warn(rust_2018_idioms)]

//! Cachette is a sharded in-process object cache: string keys map to value
//! handles bounded by wall-clock time (absolute and sliding expirations),
//! change-notification dependencies, and memory pressure.
//!
//! The key space is hashed across independent shards, each owning a mutex-
//! guarded map, a bucketed expiration wheel, and an approximate-LRU usage
//! ladder. A background statistics loop samples machine and cache memory
//! pressure and, when a watermark is crossed, evicts a percentage of the
//! least-recently-used entries from every shard.
//!
//! # Example
//!
//! ```rust
//! use cachette::{CacheItemPolicy, MemoryCache};
//! use std::time::Duration;
//!
//! let cache: MemoryCache<String> = MemoryCache::new("responses");
//!
//! // Entries slide: every hit re-arms the 30-second deadline.
//! cache.set(
//!     "user:42",
//!     "payload".to_string(),
//!     CacheItemPolicy::slides(Duration::from_secs(30)),
//! );
//!
//! assert_eq!(cache.get("user:42"), Some("payload".to_string()));
//! cache.dispose();
//! ```

mod builder;
mod cache;
mod change_monitor;
mod common;
mod entry;
mod error;
mod expires;
mod host;
mod memory;
mod notification;
mod periodic;
mod policy;
mod stats;
mod store;
mod usage;

pub use builder::CacheBuilder;
pub use cache::{CacheItem, MemoryCache, SharedValue};
pub use change_monitor::{CacheEntryChangeMonitor, ChangeMonitor, OnChangedCallback};
pub use entry::EntryState;
pub use error::ConfigError;
pub use host::{set_memory_cache_manager, MemoryCacheManager};
pub use notification::{
    RemovedArguments, RemovedCallback, RemovedReason, UpdateArguments, UpdateCallback,
};
pub use policy::{
    infinite_absolute_expiration, CacheItemPolicy, CacheItemPriority, Capabilities,
    NO_SLIDING_EXPIRATION,
};
pub use stats::CacheTrimStats;
