use std::any::Any;
use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::hash::{BuildHasher, Hash, Hasher};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant as StdInstant;

use once_cell::sync::Lazy;
use triomphe::Arc as TrioArc;
use uuid::Uuid;

use crate::builder::{CacheBuilder, ResolvedConfig};
use crate::change_monitor::{CacheEntryChangeMonitor, ChangeMonitor};
use crate::common::time::{ticks_from_datetime, ticks_from_duration, Clock};
use crate::entry::{CacheEntry, EntryPayload, EntryState, SentinelPayload};
use crate::notification::{RemovedReason, UpdateArguments};
use crate::policy::{CacheItemPolicy, CacheItemPriority, Capabilities, NO_SLIDING_EXPIRATION};
use crate::stats::{CacheTrimStats, MemoryCacheStatistics};
use crate::store::MemoryCacheStore;

/// Key prefix of the auxiliary entry backing an update callback.
pub(crate) const UPDATE_SENTINEL_PREFIX: &str = "OnUpdateSentinel";

/// The value handle stored by the process-wide default cache.
pub type SharedValue = Arc<dyn Any + Send + Sync>;

static DEFAULT_CACHE: Lazy<MemoryCache<SharedValue>> =
    Lazy::new(|| MemoryCache::builder("default").build());

/// A key, its value, and the entry's lifecycle state at lookup time.
#[derive(Clone)]
pub struct CacheItem<V> {
    pub key: String,
    pub value: V,
    pub state: EntryState,
}

/// A sharded in-process cache from string keys to value handles, bounded by
/// absolute and sliding expirations, change-monitor dependencies, and memory
/// pressure.
///
/// Values are returned by clone; wrap anything expensive to clone in an
/// `Arc`. All methods take `&self`; clones of the cache share the same
/// underlying shards.
pub struct MemoryCache<V> {
    inner: Arc<CacheInner<V>>,
}

impl<V> Clone for MemoryCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

pub(crate) struct CacheInner<V> {
    name: String,
    id: Uuid,
    config: ResolvedConfig,
    hasher: RandomState,
    stores: Box<[MemoryCacheStore<V>]>,
    stats: MemoryCacheStatistics,
    disposed: AtomicBool,
    clock: Clock,
}

impl MemoryCache<SharedValue> {
    /// The lazily created process-wide cache. It is never torn down; the
    /// process exit reclaims it.
    pub fn default_cache() -> &'static MemoryCache<SharedValue> {
        &DEFAULT_CACHE
    }
}

impl<V> MemoryCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn builder(name: impl Into<String>) -> CacheBuilder<V> {
        CacheBuilder::new(name)
    }

    /// A cache with default configuration.
    pub fn new(name: impl Into<String>) -> Self {
        Self::builder(name).build()
    }

    pub(crate) fn with_config(config: ResolvedConfig, clock: Clock) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<CacheInner<V>>| {
            let stores = (0..config.shard_count)
                .map(|_| {
                    MemoryCacheStore::new(weak.clone(), clock.clone(), config.use_insert_block)
                })
                .collect::<Vec<_>>()
                .into_boxed_slice();
            CacheInner {
                name: config.name.clone(),
                id: Uuid::new_v4(),
                hasher: RandomState::new(),
                stores,
                stats: MemoryCacheStatistics::new(&config),
                disposed: AtomicBool::new(false),
                clock,
                config,
            }
        });

        let weak = Arc::downgrade(&inner);
        inner.stats.start(move || {
            if let Some(inner) = weak.upgrade() {
                inner.poll_memory_stats();
            }
        });
        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The identifier reported to the process-wide memory cache manager.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn policy_capabilities(&self) -> Capabilities {
        Capabilities::IN_MEMORY_PROVIDER
            | Capabilities::CACHE_ENTRY_CHANGE_MONITORS
            | Capabilities::ABSOLUTE_EXPIRATIONS
            | Capabilities::SLIDING_EXPIRATIONS
            | Capabilities::CACHE_ENTRY_UPDATE_CALLBACK
            | Capabilities::CACHE_ENTRY_REMOVED_CALLBACK
    }

    /// Returns the value for `key` if present and not expired. A hit advances
    /// the sliding deadline and refreshes usage.
    pub fn get(&self, key: &str) -> Option<V> {
        self.get_cache_item(key).map(|item| item.value)
    }

    pub fn get_cache_item(&self, key: &str) -> Option<CacheItem<V>> {
        if self.inner.is_disposed() {
            return None;
        }
        let entry = self.inner.store_for(key).get(key)?;
        let value = entry.value()?.clone();
        Some(CacheItem {
            key: key.to_string(),
            value,
            state: entry.state(),
        })
    }

    /// Inserts `value` unless a live entry already exists for `key`, in which
    /// case the existing value is returned (and the supplied one dropped).
    /// Returns `None` when the insert happened.
    ///
    /// # Panics
    ///
    /// Panics on an invalid policy, or on a policy with an update callback,
    /// which this operation does not support.
    pub fn add_or_get_existing(
        &self,
        key: &str,
        value: V,
        policy: CacheItemPolicy<V>,
    ) -> Option<V> {
        policy.validate();
        if policy.update_callback.is_some() {
            panic!("update_callback is not supported by add_or_get_existing");
        }
        if self.inner.is_disposed() {
            dispose_monitors(&policy);
            return None;
        }
        let entry = self
            .inner
            .build_entry(key, EntryPayload::Value(value), policy);
        let existing = self.inner.store_for(key).add_or_get_existing(key, entry);
        existing.and_then(|e| e.value().cloned())
    }

    /// Unconditional insert-or-replace. A displaced entry is released with
    /// reason `Removed` (or `Expired` when already past its deadline).
    ///
    /// # Panics
    ///
    /// Panics on an invalid policy.
    pub fn set(&self, key: &str, value: V, policy: CacheItemPolicy<V>) {
        self.inner.set_public(key, value, policy);
    }

    /// Removes the entry for `key` and returns its value. The removed
    /// callback sees reason `Removed`.
    pub fn remove(&self, key: &str) -> Option<V> {
        self.remove_with_reason(key, RemovedReason::Removed)
    }

    /// Like [`remove`](Self::remove) with a caller-supplied reason, e.g.
    /// `CacheSpecificEviction` for host-driven eviction policies.
    pub fn remove_with_reason(&self, key: &str, reason: RemovedReason) -> Option<V> {
        if self.inner.is_disposed() {
            return None;
        }
        self.inner
            .remove_entry(key, None, reason)
            .and_then(|e| e.value().cloned())
    }

    /// Whether a live (non-expired) entry exists. Read-only: does not touch
    /// expiration or usage.
    pub fn contains(&self, key: &str) -> bool {
        !self.inner.is_disposed() && self.inner.live_entry(key).is_some()
    }

    pub fn count(&self) -> usize {
        if self.inner.is_disposed() {
            return 0;
        }
        self.inner.count_internal()
    }

    /// Looks up each key; absent keys are simply missing from the result.
    pub fn get_values<'a, I>(&self, keys: I) -> HashMap<String, V>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut values = HashMap::new();
        for key in keys {
            if let Some(value) = self.get(key) {
                values.insert(key.to_string(), value);
            }
        }
        values
    }

    /// Evicts up to `percent` percent of each shard's tracked entries, after
    /// flushing whatever has expired. Returns the eviction count.
    pub fn trim(&self, percent: usize) -> usize {
        if self.inner.is_disposed() {
            return 0;
        }
        self.inner.trim_internal(percent)
    }

    /// A composite monitor that trips when any of the watched entries leaves
    /// the cache. Keys absent at construction trip it immediately.
    pub fn create_cache_entry_change_monitor<I, S>(&self, keys: I) -> CacheEntryChangeMonitor<V>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CacheEntryChangeMonitor::new(&self.inner, keys.into_iter().map(Into::into))
    }

    /// What the most recent pressure-driven trim pass did, if any.
    pub fn last_trim(&self) -> Option<CacheTrimStats> {
        self.inner.stats.last_trim()
    }

    /// Stops the statistics loop, drains every shard (removed callbacks are
    /// suppressed unless the builder opted in), and notifies the host hook.
    /// Idempotent; operations on a disposed cache are no-ops that return
    /// absent.
    pub fn dispose(&self) {
        self.inner.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    #[cfg(test)]
    pub(crate) fn flush_expired(&self) {
        for store in self.inner.stores.iter() {
            store.flush_expired_items(true);
        }
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<CacheInner<V>> {
        &self.inner
    }
}

impl<V> CacheInner<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub(crate) fn callbacks_on_dispose(&self) -> bool {
        self.config.callbacks_on_dispose
    }

    /// Shard dispatch: a non-negative key hash modulo the shard count, with
    /// the most negative hash pinned to shard 0.
    pub(crate) fn store_index(&self, key: &str) -> usize {
        let mut hasher = self.hasher.build_hasher();
        key.hash(&mut hasher);
        let hash = hasher.finish() as i64;
        let hash = if hash == i64::MIN { 0 } else { hash.abs() };
        (hash as u64 % self.stores.len() as u64) as usize
    }

    pub(crate) fn store_for(&self, key: &str) -> &MemoryCacheStore<V> {
        &self.stores[self.store_index(key)]
    }

    pub(crate) fn store_at(&self, index: usize) -> &MemoryCacheStore<V> {
        &self.stores[index]
    }

    pub(crate) fn live_entry(&self, key: &str) -> Option<TrioArc<CacheEntry<V>>> {
        self.store_for(key).get_entry(key)
    }

    pub(crate) fn remove_entry(
        &self,
        key: &str,
        valid: Option<&TrioArc<CacheEntry<V>>>,
        reason: RemovedReason,
    ) -> Option<TrioArc<CacheEntry<V>>> {
        self.store_for(key).remove(key, valid, reason)
    }

    pub(crate) fn count_internal(&self) -> usize {
        self.stores.iter().map(|s| s.count()).sum()
    }

    pub(crate) fn trim_internal(&self, percent: usize) -> usize {
        self.stores
            .iter()
            .map(|s| s.trim_internal(percent))
            .sum()
    }

    pub(crate) fn build_entry(
        &self,
        key: &str,
        payload: EntryPayload<V>,
        policy: CacheItemPolicy<V>,
    ) -> TrioArc<CacheEntry<V>> {
        let created = self.clock.now_utc();
        let abs_exp = if policy.sliding_expiration != NO_SLIDING_EXPIRATION {
            ticks_from_datetime(created) + ticks_from_duration(policy.sliding_expiration)
        } else {
            ticks_from_datetime(policy.absolute_expiration)
        };
        TrioArc::new(CacheEntry::new(
            key.to_string(),
            payload,
            created,
            abs_exp,
            policy.sliding_expiration,
            policy.priority,
            policy.change_monitors,
            policy.removed_callback,
        ))
    }

    pub(crate) fn set_public(self: &Arc<Self>, key: &str, value: V, policy: CacheItemPolicy<V>) {
        policy.validate();
        if self.is_disposed() {
            dispose_monitors(&policy);
            return;
        }
        if policy.update_callback.is_some() {
            self.set_with_update_callback(key, value, policy);
            return;
        }
        let entry = self.build_entry(key, EntryPayload::Value(value), policy);
        self.store_for(key).set(key.to_string(), entry);
    }

    /// The update-callback insert: the real entry is pinned and never
    /// expires; a sentinel entry carries the caller's expiry and, on its own
    /// removal, gives the callback a chance to refresh the real value.
    fn set_with_update_callback(
        self: &Arc<Self>,
        key: &str,
        value: V,
        mut policy: CacheItemPolicy<V>,
    ) {
        let update_callback = policy.update_callback.take().expect("checked by caller");

        let real = self.build_entry(
            key,
            EntryPayload::Value(value),
            CacheItemPolicy {
                priority: CacheItemPriority::NotRemovable,
                ..Default::default()
            },
        );
        self.store_for(key).set(key.to_string(), TrioArc::clone(&real));

        let dependency = CacheEntryChangeMonitor::new(self, std::iter::once(key.to_string()));

        let sentinel_key = format!("{}{}", UPDATE_SENTINEL_PREFIX, key);
        let mut monitors = std::mem::take(&mut policy.change_monitors);
        monitors.push(Arc::new(dependency.clone()));
        let sentinel = self.build_entry(
            &sentinel_key,
            EntryPayload::Sentinel(SentinelPayload {
                target_key: key.to_string(),
                update_callback,
                dependency,
            }),
            CacheItemPolicy {
                absolute_expiration: policy.absolute_expiration,
                sliding_expiration: policy.sliding_expiration,
                priority: CacheItemPriority::NotRemovable,
                change_monitors: monitors,
                removed_callback: None,
                update_callback: None,
            },
        );
        let store_index = self.store_index(&sentinel_key);
        self.stores[store_index].set(sentinel_key, TrioArc::clone(&sentinel));
        real.configure_update_sentinel(store_index, sentinel);
    }

    /// Runs when a sentinel entry is released. Expiration (and a tripped
    /// user change monitor) invoke the update callback; everything else
    /// means the real entry is already gone or going.
    pub(crate) fn on_sentinel_removed(
        self: &Arc<Self>,
        payload: &SentinelPayload<V>,
        reason: RemovedReason,
    ) {
        match reason {
            RemovedReason::Expired => {}
            RemovedReason::ChangeMonitorChanged => {
                if payload.dependency.has_changed() {
                    return;
                }
            }
            RemovedReason::Evicted => {
                log::error!(
                    "update sentinel for key {:?} was evicted; sentinels are pinned",
                    payload.target_key
                );
                return;
            }
            _ => return,
        }

        let mut args = UpdateArguments {
            key: payload.target_key.clone(),
            reason,
            updated_value: None,
            updated_policy: None,
        };
        let callback = Arc::clone(&payload.update_callback);
        if catch_unwind(AssertUnwindSafe(|| callback(&mut args))).is_err() {
            log::error!("update callback panicked for key {:?}", payload.target_key);
            let _ = self.remove_entry(&payload.target_key, None, RemovedReason::Removed);
            return;
        }

        let UpdateArguments {
            updated_value,
            updated_policy,
            ..
        } = args;
        match (updated_value, updated_policy) {
            (Some(value), Some(policy)) => {
                self.set_public(&payload.target_key, value, policy);
            }
            _ => {
                let _ = self.remove_entry(&payload.target_key, None, RemovedReason::Removed);
            }
        }
    }

    /// One statistics tick: flush expired entries from every shard, sample
    /// pressure, and trim when the monitors ask for it.
    pub(crate) fn poll_memory_stats(self: &Arc<Self>) {
        if self.is_disposed() {
            return;
        }
        for store in self.stores.iter() {
            store.flush_expired_items(false);
        }
        let count_before = self.count_internal();
        let percent = self.stats.poll(count_before, self.id);
        if percent == 0 {
            return;
        }

        let started = StdInstant::now();
        let trimmed = self.trim_internal(percent);
        let stats = CacheTrimStats {
            utc_time: self.clock.now_utc(),
            percent,
            count_before,
            trimmed,
            duration: started.elapsed(),
        };
        log::debug!(
            "cache {:?} trimmed {} of {} entries ({}%) in {:?}",
            self.name,
            trimmed,
            count_before,
            percent,
            stats.duration
        );
        self.stats.record_trim(stats);
    }

    pub(crate) fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stats.dispose();
        for store in self.stores.iter() {
            store.dispose();
        }
        if let Some(manager) = crate::host::memory_cache_manager() {
            manager.release_cache(self.id);
        }
    }
}

fn dispose_monitors<V>(policy: &CacheItemPolicy<V>) {
    for monitor in &policy.change_monitors {
        monitor.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change_monitor::ChangeMonitor;
    use crate::common::time::Clock;
    use crate::policy::infinite_absolute_expiration;
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;
    use std::time::Duration;

    fn mocked_cache(
        shards: usize,
    ) -> (MemoryCache<String>, std::sync::Arc<crate::common::time::Mock>) {
        let (clock, mock) = Clock::mock();
        let cache = MemoryCache::<String>::builder("test")
            .shard_count(shards)
            .build_with_clock(clock);
        (cache, mock)
    }

    fn expires_in(
        mock: &crate::common::time::Mock,
        d: Duration,
    ) -> CacheItemPolicy<String> {
        CacheItemPolicy::expires_at(
            mock.now() + ChronoDuration::from_std(d).unwrap(),
        )
    }

    #[test]
    fn set_then_get_returns_the_value() {
        let (cache, _mock) = mocked_cache(4);
        cache.set("k", "v".to_string(), Default::default());

        let item = cache.get_cache_item("k").expect("present");
        assert_eq!(item.value, "v");
        assert_eq!(item.state, EntryState::AddedToCache);
        assert!(cache.contains("k"));
        assert_eq!(cache.count(), 1);
        cache.dispose();
    }

    #[test]
    fn add_or_get_existing_keeps_the_first_value() {
        let (cache, _mock) = mocked_cache(4);
        assert!(cache
            .add_or_get_existing("k", "v1".to_string(), Default::default())
            .is_none());
        assert_eq!(
            cache.add_or_get_existing("k", "v2".to_string(), Default::default()),
            Some("v1".to_string())
        );
        assert_eq!(cache.get("k"), Some("v1".to_string()));
        cache.dispose();
    }

    #[test]
    fn remove_returns_the_prior_value_and_fires_the_callback() {
        let (cache, _mock) = mocked_cache(4);
        let reasons = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&reasons);
        let policy = CacheItemPolicy::<String> {
            removed_callback: Some(Arc::new(move |args| {
                sink.lock().push(args.reason);
            })),
            ..Default::default()
        };
        cache.set("k", "v".to_string(), policy);

        assert_eq!(cache.remove("k"), Some("v".to_string()));
        assert_eq!(cache.get("k"), None);
        assert_eq!(cache.remove("k"), None);
        assert_eq!(&*reasons.lock(), &[RemovedReason::Removed]);
        cache.dispose();
    }

    #[test]
    fn absolute_expiry_removes_with_reason_expired() {
        let (cache, mock) = mocked_cache(4);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let mut policy = expires_in(&mock, Duration::from_millis(200));
        policy.removed_callback = Some(Arc::new(move |args| {
            assert_eq!(args.reason, RemovedReason::Expired);
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        cache.set("k", "v".to_string(), policy);

        mock.increment(Duration::from_millis(100));
        assert_eq!(cache.get("k"), Some("v".to_string()));

        mock.increment(Duration::from_millis(200));
        assert_eq!(cache.get("k"), None);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!cache.contains("k"));
        cache.dispose();
    }

    #[test]
    fn sliding_expiry_survives_steady_hits() {
        let (cache, mock) = mocked_cache(4);
        cache.set(
            "k",
            "v".to_string(),
            CacheItemPolicy::slides(Duration::from_secs(2)),
        );

        // Twenty hits, 500 ms apart: the deadline keeps re-arming.
        for _ in 0..20 {
            mock.increment(Duration::from_millis(500));
            assert_eq!(cache.get("k"), Some("v".to_string()));
        }

        // No hits for 2.5 s: gone, by its slid deadline.
        mock.increment(Duration::from_millis(2_500));
        assert_eq!(cache.get("k"), None);
        cache.dispose();
    }

    #[test]
    fn trim_evicts_least_recently_used_but_not_pinned_entries() {
        let (cache, mock) = mocked_cache(1);
        let evicted = Arc::new(AtomicUsize::new(0));
        for i in 0..1000 {
            let counter = Arc::clone(&evicted);
            let policy = CacheItemPolicy::<String> {
                removed_callback: Some(Arc::new(move |args| {
                    assert_eq!(args.reason, RemovedReason::Evicted);
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
                ..Default::default()
            };
            cache.set(&format!("k{}", i), "v".to_string(), policy);
        }
        for i in 0..5 {
            cache.set(
                &format!("pinned{}", i),
                "v".to_string(),
                CacheItemPolicy {
                    priority: CacheItemPriority::NotRemovable,
                    ..Default::default()
                },
            );
        }

        // Season everything past the new-add window.
        mock.increment(Duration::from_secs(30));
        assert_eq!(cache.trim(0), 0);
        let trimmed = cache.trim(10);
        assert!(trimmed >= 100, "trimmed {}", trimmed);
        assert_eq!(evicted.load(Ordering::SeqCst), trimmed);
        for i in 0..5 {
            assert!(cache.contains(&format!("pinned{}", i)));
        }
        cache.dispose();
    }

    #[test]
    fn update_callback_refreshes_the_value_on_expiry() {
        let (cache, mock) = mocked_cache(4);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let policy = CacheItemPolicy::<String> {
            absolute_expiration: mock.now() + ChronoDuration::seconds(1),
            update_callback: Some(Arc::new(move |args| {
                assert_eq!(args.reason, RemovedReason::Expired);
                counter.fetch_add(1, Ordering::SeqCst);
                args.updated_value = Some("v2".to_string());
                args.updated_policy = Some(Default::default());
            })),
            ..Default::default()
        };
        cache.set("k", "v1".to_string(), policy);
        assert_eq!(cache.get("k"), Some("v1".to_string()));

        mock.increment(Duration::from_secs(2));
        cache.flush_expired();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get("k"), Some("v2".to_string()));
        cache.dispose();
    }

    #[test]
    fn update_callback_declining_removes_the_real_entry() {
        let (cache, mock) = mocked_cache(4);
        let policy = CacheItemPolicy::<String> {
            absolute_expiration: mock.now() + ChronoDuration::seconds(1),
            update_callback: Some(Arc::new(|_args| {
                // Leave updated_value unset: let the key go.
            })),
            ..Default::default()
        };
        cache.set("k", "v1".to_string(), policy);

        mock.increment(Duration::from_secs(2));
        cache.flush_expired();
        assert_eq!(cache.get("k"), None);
        assert_eq!(cache.count(), 0);
        cache.dispose();
    }

    #[test]
    fn explicit_remove_of_an_updatable_entry_does_not_resurrect_it() {
        let (cache, _mock) = mocked_cache(4);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let policy = CacheItemPolicy::<String> {
            absolute_expiration: infinite_absolute_expiration(),
            sliding_expiration: Duration::from_secs(60),
            update_callback: Some(Arc::new(move |_args| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
            ..Default::default()
        };
        cache.set("k", "v1".to_string(), policy);

        assert_eq!(cache.remove("k"), Some("v1".to_string()));
        assert_eq!(cache.get("k"), None);
        // The sentinel went down via the dependency monitor; the callback
        // must not have fired.
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(cache.count(), 0);
        cache.dispose();
    }

    #[test]
    fn change_monitor_fires_once_when_a_watched_entry_leaves() {
        let (cache, mock) = mocked_cache(4);
        cache.set("a", "1".to_string(), Default::default());
        mock.increment(Duration::from_millis(50));
        cache.set("b", "2".to_string(), Default::default());

        let monitor = cache.create_cache_entry_change_monitor(["a", "b"]);
        assert!(!monitor.has_changed());
        assert!(!monitor.unique_id().is_empty());
        let b_created = cache
            .inner()
            .live_entry("b")
            .expect("present")
            .utc_created();
        assert_eq!(monitor.last_modified(), b_created);

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        monitor.notify_on_changed(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        cache.remove("a");
        assert!(monitor.has_changed());
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Later changes do not re-fire.
        cache.remove("b");
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        cache.dispose();
    }

    #[test]
    fn monitor_over_a_missing_key_is_born_changed() {
        let (cache, _mock) = mocked_cache(4);
        let monitor = cache.create_cache_entry_change_monitor(["nope"]);
        assert!(monitor.has_changed());

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        monitor.notify_on_changed(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        cache.dispose();
    }

    #[test]
    fn dependent_entry_is_removed_when_its_monitor_trips() {
        let (cache, _mock) = mocked_cache(4);
        cache.set("dep", "d".to_string(), Default::default());
        let monitor = cache.create_cache_entry_change_monitor(["dep"]);

        let reasons = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&reasons);
        let policy = CacheItemPolicy::<String> {
            change_monitors: vec![Arc::new(monitor) as Arc<dyn ChangeMonitor>],
            removed_callback: Some(Arc::new(move |args| {
                sink.lock().push(args.reason);
            })),
            ..Default::default()
        };
        cache.set("k", "v".to_string(), policy);
        assert!(cache.contains("k"));

        cache.remove("dep");
        assert!(!cache.contains("k"));
        assert_eq!(&*reasons.lock(), &[RemovedReason::ChangeMonitorChanged]);
        cache.dispose();
    }

    #[test]
    fn concurrent_add_or_get_has_exactly_one_winner() {
        let (cache, _mock) = mocked_cache(4);
        let removed = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = ["v1", "v2"]
            .into_iter()
            .map(|value| {
                let cache = cache.clone();
                let barrier = Arc::clone(&barrier);
                let removed = Arc::clone(&removed);
                std::thread::spawn(move || {
                    let policy = CacheItemPolicy::<String> {
                        removed_callback: Some(Arc::new(move |_| {
                            removed.fetch_add(1, Ordering::SeqCst);
                        })),
                        ..Default::default()
                    };
                    barrier.wait();
                    cache.add_or_get_existing("k", value.to_string(), policy)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winner = cache.get("k").expect("present");
        assert_eq!(results.iter().filter(|r| r.is_none()).count(), 1);
        assert_eq!(
            results.iter().flatten().collect::<Vec<_>>(),
            vec![&winner]
        );

        cache.remove("k");
        assert_eq!(removed.load(Ordering::SeqCst), 1);
        cache.dispose();
    }

    #[test]
    fn get_values_returns_only_present_keys() {
        let (cache, _mock) = mocked_cache(4);
        cache.set("a", "1".to_string(), Default::default());
        cache.set("b", "2".to_string(), Default::default());

        let values = cache.get_values(["a", "b", "c"]);
        assert_eq!(values.len(), 2);
        assert_eq!(values["a"], "1");
        assert_eq!(values["b"], "2");
        cache.dispose();
    }

    #[test]
    fn shard_dispatch_is_stable_and_in_range(){
        let (cache, _mock) = mocked_cache(7);
        for i in 0..100 {
            let key = format!("key-{}", i);
            let index = cache.inner().store_index(&key);
            assert!(index < 7);
            assert_eq!(index, cache.inner().store_index(&key));
        }
        cache.dispose();
    }

    #[test]
    fn disposed_cache_is_inert_and_disposes_passed_monitors() {
        let (cache, _mock) = mocked_cache(4);
        cache.set("k", "v".to_string(), Default::default());
        let monitor = cache.create_cache_entry_change_monitor(["k"]);
        cache.dispose();
        cache.dispose();

        assert_eq!(cache.count(), 0);
        assert_eq!(cache.get("k"), None);
        assert_eq!(cache.remove("k"), None);
        assert!(!cache.contains("k"));
        assert_eq!(cache.trim(50), 0);

        let policy = CacheItemPolicy::<String> {
            change_monitors: vec![Arc::new(monitor) as Arc<dyn ChangeMonitor>],
            ..Default::default()
        };
        cache.set("k2", "v".to_string(), policy);
        assert_eq!(cache.get("k2"), None);
    }

    #[test]
    #[should_panic(expected = "not supported by add_or_get_existing")]
    fn add_or_get_existing_rejects_update_callbacks() {
        let (cache, _mock) = mocked_cache(4);
        let policy = CacheItemPolicy::<String> {
            update_callback: Some(Arc::new(|_| {})),
            ..Default::default()
        };
        let _ = cache.add_or_get_existing("k", "v".to_string(), policy);
    }
}
