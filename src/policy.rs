use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::change_monitor::ChangeMonitor;
use crate::notification::{RemovedCallback, UpdateCallback};

/// The "no absolute expiration" sentinel.
pub fn infinite_absolute_expiration() -> DateTime<Utc> {
    DateTime::<Utc>::MAX_UTC
}

/// The "no sliding expiration" sentinel.
pub const NO_SLIDING_EXPIRATION: Duration = Duration::ZERO;

/// Sliding expirations longer than this are rejected as programming errors.
pub(crate) const MAX_SLIDING_EXPIRATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum CacheItemPriority {
    /// The entry participates in usage tracking and may be evicted under
    /// memory pressure.
    #[default]
    Default,
    /// The entry is never evicted by trimming. Expiration still applies.
    NotRemovable,
}

/// Expiration, priority, dependency and callback settings for one entry.
///
/// Absolute and sliding expirations are mutually exclusive, a sliding
/// expiration may not exceed one year, and at most one of the removed/update
/// callbacks may be set. Violations panic; they are contract violations, not
/// runtime conditions.
#[derive(Clone)]
pub struct CacheItemPolicy<V> {
    pub absolute_expiration: DateTime<Utc>,
    pub sliding_expiration: Duration,
    pub priority: CacheItemPriority,
    pub change_monitors: Vec<Arc<dyn ChangeMonitor>>,
    pub removed_callback: Option<RemovedCallback<V>>,
    pub update_callback: Option<UpdateCallback<V>>,
}

impl<V> Default for CacheItemPolicy<V> {
    fn default() -> Self {
        Self {
            absolute_expiration: infinite_absolute_expiration(),
            sliding_expiration: NO_SLIDING_EXPIRATION,
            priority: CacheItemPriority::Default,
            change_monitors: Vec::new(),
            removed_callback: None,
            update_callback: None,
        }
    }
}

impl<V> CacheItemPolicy<V> {
    /// A policy that expires at the given wall-clock instant.
    pub fn expires_at(instant: DateTime<Utc>) -> Self {
        Self {
            absolute_expiration: instant,
            ..Default::default()
        }
    }

    /// A policy whose deadline re-arms to `now + duration` on every hit.
    pub fn slides(duration: Duration) -> Self {
        Self {
            sliding_expiration: duration,
            ..Default::default()
        }
    }

    /// # Panics
    ///
    /// Panics when the policy combines absolute and sliding expiration, sets
    /// a sliding expiration longer than one year, or registers both a removed
    /// and an update callback.
    pub(crate) fn validate(&self) {
        if self.absolute_expiration != infinite_absolute_expiration()
            && self.sliding_expiration != NO_SLIDING_EXPIRATION
        {
            panic!("absolute_expiration and sliding_expiration are mutually exclusive");
        }
        if self.sliding_expiration > MAX_SLIDING_EXPIRATION {
            panic!("sliding_expiration is longer than one year");
        }
        if self.removed_callback.is_some() && self.update_callback.is_some() {
            panic!("removed_callback and update_callback are mutually exclusive");
        }
    }
}

/// Feature flags advertised by the cache.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Capabilities(u32);

impl Capabilities {
    pub const IN_MEMORY_PROVIDER: Capabilities = Capabilities(1);
    pub const CACHE_ENTRY_CHANGE_MONITORS: Capabilities = Capabilities(1 << 1);
    pub const ABSOLUTE_EXPIRATIONS: Capabilities = Capabilities(1 << 2);
    pub const SLIDING_EXPIRATIONS: Capabilities = Capabilities(1 << 3);
    pub const CACHE_ENTRY_UPDATE_CALLBACK: Capabilities = Capabilities(1 << 4);
    pub const CACHE_ENTRY_REMOVED_CALLBACK: Capabilities = Capabilities(1 << 5);

    pub fn contains(self, other: Capabilities) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Capabilities {
    type Output = Capabilities;

    fn bitor(self, rhs: Capabilities) -> Capabilities {
        Capabilities(self.0 | rhs.0)
    }
}
