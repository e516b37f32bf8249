use std::sync::Arc;

use crate::policy::CacheItemPolicy;

/// Why an entry left the cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemovedReason {
    /// The entry was removed or replaced by an explicit call.
    Removed,
    /// The entry's expiration deadline has passed.
    Expired,
    /// The entry was evicted to relieve memory pressure.
    Evicted,
    /// One of the entry's change monitors fired.
    ChangeMonitorChanged,
    /// Reserved for host-specific eviction policies layered on top of the
    /// cache.
    CacheSpecificEviction,
    /// The cache instance is being torn down. Removed callbacks are not
    /// invoked for this reason unless the builder opted in.
    Disposing,
}

impl RemovedReason {
    pub fn was_evicted(&self) -> bool {
        matches!(self, Self::Expired | Self::Evicted)
    }
}

/// Passed to a removed callback after the entry has been unlinked and its
/// state advanced to `RemovedFromCache`.
#[derive(Clone)]
pub struct RemovedArguments<V> {
    pub key: String,
    pub value: V,
    pub reason: RemovedReason,
}

/// Passed to an update callback just before its entry would be removed. The
/// callback may store a replacement value and policy to keep the key alive.
pub struct UpdateArguments<V> {
    pub key: String,
    pub reason: RemovedReason,
    pub updated_value: Option<V>,
    pub updated_policy: Option<CacheItemPolicy<V>>,
}

pub type RemovedCallback<V> = Arc<dyn Fn(RemovedArguments<V>) + Send + Sync + 'static>;

pub type UpdateCallback<V> = Arc<dyn Fn(&mut UpdateArguments<V>) + Send + Sync + 'static>;
