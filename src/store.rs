//! The shard: one key map guarded by a single mutex, one expiration wheel,
//! one usage ladder, and the insert-block gate the wheel uses to quiesce
//! admissions while it splices out a large expired batch.
//!
//! The mutex is held only for map mutation and state marking; wheel and
//! ladder registration, callback invocation and entry release all happen
//! outside it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Weak;
use std::time::{Duration, Instant as StdInstant};

use parking_lot::{Condvar, Mutex};
use triomphe::Arc as TrioArc;

use crate::cache::CacheInner;
use crate::common::time::{ticks_from_duration, Clock, Ticks, NEVER};
use crate::entry::{CacheEntry, EntryState};
use crate::expires::CacheExpires;
use crate::notification::RemovedReason;
use crate::usage::{CacheUsage, NEWADD_INTERVAL_TICKS};

/// Upper bound on waiting for the insert-block gate. A timed-out insert
/// proceeds anyway; at worst it overlaps a flush.
const INSERT_BLOCK_WAIT: Duration = Duration::from_secs(10);

/// A sliding deadline moves only when the new deadline differs by at least
/// this much, or moves backwards.
const MIN_UPDATE_DELTA_TICKS: Ticks = 1_000;

/// Bursts of hits on one entry refresh its usage at most once per second.
const CORRELATED_REQUEST_TIMEOUT_TICKS: Ticks = 1_000;

/// A manual-reset gate. Blocked waiters park on the condvar until released.
struct InsertGate {
    blocked: Mutex<bool>,
    condvar: Condvar,
}

impl InsertGate {
    fn new() -> Self {
        Self {
            blocked: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    fn block(&self) {
        *self.blocked.lock() = true;
    }

    fn release(&self) {
        let mut blocked = self.blocked.lock();
        *blocked = false;
        self.condvar.notify_all();
    }

    /// Returns `false` when the wait timed out with the gate still closed.
    fn wait_while_blocked(&self, timeout: Duration) -> bool {
        let mut blocked = self.blocked.lock();
        if !*blocked {
            return true;
        }
        let deadline = StdInstant::now() + timeout;
        while *blocked {
            if self.condvar.wait_until(&mut blocked, deadline).timed_out() {
                return false;
            }
        }
        true
    }
}

pub(crate) struct MemoryCacheStore<V> {
    entries: Mutex<HashMap<String, TrioArc<CacheEntry<V>>>>,
    expires: CacheExpires<V>,
    usage: CacheUsage<V>,
    insert_gate: InsertGate,
    use_insert_block: bool,
    cache: Weak<CacheInner<V>>,
    clock: Clock,
    disposed: AtomicBool,
}

impl<V> MemoryCacheStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(cache: Weak<CacheInner<V>>, clock: Clock, use_insert_block: bool) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            expires: CacheExpires::new(),
            usage: CacheUsage::new(),
            insert_gate: InsertGate::new(),
            use_insert_block,
            cache,
            clock,
            disposed: AtomicBool::new(false),
        }
    }

    pub(crate) fn clock(&self) -> &Clock {
        &self.clock
    }

    pub(crate) fn use_insert_block(&self) -> bool {
        self.use_insert_block
    }

    pub(crate) fn block_inserts(&self) {
        self.insert_gate.block();
    }

    pub(crate) fn release_inserts(&self) {
        self.insert_gate.release();
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub(crate) fn count(&self) -> usize {
        self.entries.lock().len()
    }

    fn wait_for_inserts(&self, entry: &CacheEntry<V>) {
        if self.use_insert_block
            && entry.has_usage()
            && !self.insert_gate.wait_while_blocked(INSERT_BLOCK_WAIT)
        {
            log::debug!("insert of {:?} proceeding after gate wait timed out", entry.key());
        }
    }

    /// Peeks at a live entry without touching expiration or usage.
    pub(crate) fn get_entry(&self, key: &str) -> Option<TrioArc<CacheEntry<V>>> {
        let now = self.clock.now_ticks();
        let map = self.entries.lock();
        map.get(key)
            .filter(|e| !e.is_expired(now))
            .map(TrioArc::clone)
    }

    /// Inserts `new_entry` unless a live entry already exists, in which case
    /// the existing entry is returned and refreshed. A stale (expired)
    /// occupant is displaced and released outside the lock.
    pub(crate) fn add_or_get_existing(
        &self,
        key: &str,
        new_entry: TrioArc<CacheEntry<V>>,
    ) -> Option<TrioArc<CacheEntry<V>>> {
        if self.is_disposed() {
            return None;
        }
        self.wait_for_inserts(&new_entry);

        let now = self.clock.now_ticks();
        let mut existing = None;
        let mut stale = None;
        let mut added = false;
        {
            let mut map = self.entries.lock();
            let current = map.get(key).map(TrioArc::clone);
            match current {
                Some(current) if !current.is_expired(now) => existing = Some(current),
                current => {
                    if let Some(stale_entry) = current {
                        stale_entry.set_state(EntryState::RemovingFromCache);
                        map.remove(key);
                        stale = Some(stale_entry);
                    }
                    new_entry.set_state(EntryState::AddingToCache);
                    map.insert(key.to_string(), TrioArc::clone(&new_entry));
                    added = true;
                }
            }
        }

        if added {
            self.add_to_cache(&new_entry, now);
        }
        if let Some(stale_entry) = stale {
            self.finish_remove(&stale_entry, RemovedReason::Expired);
        }
        if let Some(existing_entry) = &existing {
            self.update_exp_and_usage(existing_entry, now);
        }
        existing
    }

    /// Unconditional replace.
    pub(crate) fn set(&self, key: String, new_entry: TrioArc<CacheEntry<V>>) {
        if self.is_disposed() {
            return;
        }
        self.wait_for_inserts(&new_entry);

        let now = self.clock.now_ticks();
        let displaced;
        {
            let mut map = self.entries.lock();
            displaced = map.get(&key).map(TrioArc::clone);
            if let Some(old) = &displaced {
                old.set_state(EntryState::RemovingFromCache);
            }
            new_entry.set_state(EntryState::AddingToCache);
            map.insert(key, TrioArc::clone(&new_entry));
        }

        self.add_to_cache(&new_entry, now);
        if let Some(old) = displaced {
            let reason = if old.is_expired(now) {
                RemovedReason::Expired
            } else {
                RemovedReason::Removed
            };
            self.finish_remove(&old, reason);
        }
    }

    pub(crate) fn get(&self, key: &str) -> Option<TrioArc<CacheEntry<V>>> {
        if self.is_disposed() {
            return None;
        }
        let now = self.clock.now_ticks();
        let mut expired = None;
        let result;
        {
            let mut map = self.entries.lock();
            match map.get(key).map(TrioArc::clone) {
                Some(entry) if entry.is_expired(now) => {
                    entry.set_state(EntryState::RemovingFromCache);
                    map.remove(key);
                    expired = Some(entry);
                    result = None;
                }
                other => result = other,
            }
        }
        if let Some(entry) = expired {
            self.finish_remove(&entry, RemovedReason::Expired);
        }
        if let Some(entry) = &result {
            self.update_exp_and_usage(entry, now);
        }
        result
    }

    /// Removes the entry for `key` if present and, when `valid` is given,
    /// identical to it. Returns the removed entry.
    pub(crate) fn remove(
        &self,
        key: &str,
        valid: Option<&TrioArc<CacheEntry<V>>>,
        reason: RemovedReason,
    ) -> Option<TrioArc<CacheEntry<V>>> {
        let removed;
        {
            let mut map = self.entries.lock();
            let candidate = map.get(key).map(TrioArc::clone);
            let matches = candidate
                .as_ref()
                .map_or(false, |cur| valid.map_or(true, |v| TrioArc::ptr_eq(cur, v)));
            if matches {
                let entry = candidate.expect("matched entry");
                entry.set_state(EntryState::RemovingFromCache);
                map.remove(key);
                removed = Some(entry);
            } else {
                removed = None;
            }
        }
        if let Some(entry) = &removed {
            self.finish_remove(entry, reason);
        }
        removed
    }

    /// Invoked by the wheel after it has unlinked an expired entry.
    pub(crate) fn remove_expired_entry(&self, entry: &TrioArc<CacheEntry<V>>) {
        self.remove(entry.key(), Some(entry), RemovedReason::Expired);
    }

    /// Invoked by the ladder after it has unlinked an underused entry.
    pub(crate) fn remove_evicted_entry(&self, entry: &TrioArc<CacheEntry<V>>) {
        self.remove(entry.key(), Some(entry), RemovedReason::Evicted);
    }

    /// Registers a freshly inserted entry with the wheel and ladder, then
    /// publishes it. Losing the publish race means a remover got there first,
    /// so the registrations are taken back.
    fn add_to_cache(&self, entry: &TrioArc<CacheEntry<V>>, now: Ticks) {
        let abs_exp = entry.utc_abs_exp();
        if abs_exp != NEVER {
            self.expires.utc_add(entry, abs_exp);
        }
        if entry.has_usage() && (abs_exp == NEVER || abs_exp - now >= NEWADD_INTERVAL_TICKS) {
            self.usage.add(entry, now);
        }
        if entry.compare_exchange_state(EntryState::AddingToCache, EntryState::AddedToCache) {
            self.register_dependencies(entry);
        } else {
            if entry.in_expires() {
                self.expires.remove(entry);
            }
            if entry.in_usage() {
                self.usage.remove(entry);
            }
        }
    }

    /// Arms each of the entry's change monitors to remove it when they fire.
    fn register_dependencies(&self, entry: &TrioArc<CacheEntry<V>>) {
        for monitor in entry.monitors_snapshot() {
            let cache = self.cache.clone();
            let key = entry.key().to_string();
            let target = TrioArc::clone(entry);
            monitor.notify_on_changed(Box::new(move || {
                if let Some(inner) = cache.upgrade() {
                    inner.remove_entry(&key, Some(&target), RemovedReason::ChangeMonitorChanged);
                }
            }));
        }
    }

    fn finish_remove(&self, entry: &TrioArc<CacheEntry<V>>, reason: RemovedReason) {
        if entry.in_expires() {
            self.expires.remove(entry);
        }
        if entry.in_usage() {
            self.usage.remove(entry);
        }
        entry.set_state(EntryState::RemovedFromCache);
        entry.release(self.cache.upgrade().as_ref(), reason);
    }

    /// Refreshes a hit: usage first (debounced), then the sliding deadline,
    /// then the paired update sentinel if there is one.
    pub(crate) fn update_exp_and_usage(&self, entry: &TrioArc<CacheEntry<V>>, now: Ticks) {
        if entry.in_usage()
            && now - entry.utc_last_usage_update() >= CORRELATED_REQUEST_TIMEOUT_TICKS
        {
            self.usage.update(entry);
            entry.set_utc_last_usage_update(now);
        }

        let sliding = entry.sliding_exp();
        if !sliding.is_zero() {
            let new_exp = now + ticks_from_duration(sliding);
            let current = entry.utc_abs_exp();
            if new_exp - current >= MIN_UPDATE_DELTA_TICKS || new_exp < current {
                self.expires.utc_update(entry, new_exp);
            }
        }

        if let Some((store_index, sentinel)) = entry.update_sentinel() {
            if let Some(inner) = self.cache.upgrade() {
                inner
                    .store_at(store_index)
                    .update_exp_and_usage(&sentinel, now);
            }
        }
    }

    pub(crate) fn flush_expired_items(&self, force: bool) -> usize {
        if self.is_disposed() {
            return 0;
        }
        self.expires.flush_expired_items(self, force)
    }

    /// Flushes expired entries, then evicts up to `percent` percent of the
    /// remaining entries from the ladder. Returns the eviction count.
    pub(crate) fn trim_internal(&self, percent: usize) -> usize {
        if self.is_disposed() || percent == 0 {
            return 0;
        }
        self.expires.flush_expired_items(self, true);
        let target = self.count() * percent.min(100) / 100;
        if target == 0 {
            return 0;
        }
        self.usage.flush_under_used(self, target)
    }

    /// Drains every entry. Removed callbacks see reason `Disposing`, which is
    /// suppressed unless the cache opted in.
    pub(crate) fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Never leave a waiter parked on the gate.
        self.insert_gate.release();

        let drained: Vec<_> = {
            let mut map = self.entries.lock();
            map.drain().map(|(_, entry)| entry).collect()
        };
        for entry in drained {
            entry.set_state(EntryState::RemovingFromCache);
            self.finish_remove(&entry, RemovedReason::Disposing);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::time::ticks_from_datetime;
    use crate::entry::EntryPayload;
    use crate::policy::CacheItemPriority;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn store(clock: Clock) -> MemoryCacheStore<String> {
        MemoryCacheStore::new(Weak::new(), clock, false)
    }

    fn entry_with(
        clock: &Clock,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
        sliding: Duration,
        priority: CacheItemPriority,
        removed: Option<crate::notification::RemovedCallback<String>>,
    ) -> TrioArc<CacheEntry<String>> {
        let created = clock.now_utc();
        let abs = match (ttl, sliding.is_zero()) {
            (Some(ttl), _) => ticks_from_datetime(created) + ticks_from_duration(ttl),
            (None, false) => ticks_from_datetime(created) + ticks_from_duration(sliding),
            (None, true) => NEVER,
        };
        TrioArc::new(CacheEntry::new(
            key.to_string(),
            EntryPayload::Value(value.to_string()),
            created,
            abs,
            sliding,
            priority,
            Vec::new(),
            removed,
        ))
    }

    #[test]
    fn add_or_get_existing_returns_the_winner() {
        let (clock, _mock) = Clock::mock();
        let store = store(clock.clone());

        let first = entry_with(&clock, "k", "v1", None, Duration::ZERO,
            CacheItemPriority::Default, None);
        assert!(store.add_or_get_existing("k", first).is_none());

        let second = entry_with(&clock, "k", "v2", None, Duration::ZERO,
            CacheItemPriority::Default, None);
        let existing = store.add_or_get_existing("k", second).expect("existing");
        assert_eq!(existing.value(), Some(&"v1".to_string()));
        assert_eq!(existing.state(), EntryState::AddedToCache);
    }

    #[test]
    fn expired_occupant_is_displaced_on_add() {
        let (clock, mock) = Clock::mock();
        let store = store(clock.clone());
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&calls);
        let first = entry_with(&clock, "k", "v1", Some(Duration::from_secs(1)), Duration::ZERO,
            CacheItemPriority::Default,
            Some(Arc::new(move |args| {
                assert_eq!(args.reason, RemovedReason::Expired);
                counter.fetch_add(1, Ordering::SeqCst);
            })));
        assert!(store.add_or_get_existing("k", first).is_none());

        mock.increment(Duration::from_secs(2));
        let second = entry_with(&clock, "k", "v2", None, Duration::ZERO,
            CacheItemPriority::Default, None);
        assert!(store.add_or_get_existing("k", second).is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let current = store.get("k").expect("new entry");
        assert_eq!(current.value(), Some(&"v2".to_string()));
    }

    #[test]
    fn get_removes_past_deadline_entries() {
        let (clock, mock) = Clock::mock();
        let store = store(clock.clone());

        let entry = entry_with(&clock, "k", "v", Some(Duration::from_millis(200)),
            Duration::ZERO, CacheItemPriority::Default, None);
        assert!(store.add_or_get_existing("k", entry).is_none());
        assert!(store.get("k").is_some());

        mock.increment(Duration::from_millis(300));
        assert!(store.get("k").is_none());
        assert_eq!(store.count(), 0);
    }

    #[test]
    fn sliding_deadline_advances_in_whole_seconds() {
        let (clock, mock) = Clock::mock();
        let store = store(clock.clone());

        let entry = entry_with(&clock, "k", "v", None, Duration::from_secs(2),
            CacheItemPriority::Default, None);
        let deadline0 = entry.utc_abs_exp();
        assert!(store.add_or_get_existing("k", entry).is_none());

        // A hit 500 ms later moves the deadline by less than the minimum
        // delta, so it stays.
        mock.increment(Duration::from_millis(500));
        let hit = store.get("k").expect("hit");
        assert_eq!(hit.utc_abs_exp(), deadline0);

        // A hit 1.5 s in moves it.
        mock.increment(Duration::from_secs(1));
        let hit = store.get("k").expect("hit");
        assert_eq!(hit.utc_abs_exp(), deadline0 + 1_500);
    }

    #[test]
    fn flush_expired_items_sweeps_every_bucket() {
        let (clock, mock) = Clock::mock();
        let store = store(clock.clone());

        for i in 0..50 {
            // Spread deadlines over several wheel buckets.
            let ttl = Duration::from_secs(1 + (i % 7) * 25);
            let e = entry_with(&clock, &format!("k{}", i), "v", Some(ttl), Duration::ZERO,
                CacheItemPriority::Default, None);
            assert!(store.add_or_get_existing(&format!("k{}", i), e).is_none());
        }
        assert_eq!(store.count(), 50);

        mock.increment(Duration::from_secs(200));
        let flushed = store.flush_expired_items(true);
        assert_eq!(flushed, 50);
        assert_eq!(store.count(), 0);
    }

    #[test]
    fn trim_prefers_least_recently_used_and_spares_not_removable() {
        let (clock, mock) = Clock::mock();
        let store = store(clock.clone());
        let evicted = Arc::new(AtomicUsize::new(0));

        for i in 0..100 {
            let counter = Arc::clone(&evicted);
            let e = entry_with(&clock, &format!("k{}", i), "v", None, Duration::ZERO,
                CacheItemPriority::Default,
                Some(Arc::new(move |args| {
                    assert_eq!(args.reason, RemovedReason::Evicted);
                    counter.fetch_add(1, Ordering::SeqCst);
                })));
            assert!(store.add_or_get_existing(&format!("k{}", i), e).is_none());
        }
        let pinned = entry_with(&clock, "pinned", "v", None, Duration::ZERO,
            CacheItemPriority::NotRemovable, None);
        assert!(store.add_or_get_existing("pinned", pinned).is_none());

        // Age everything past the new-add interval so the first pass applies.
        mock.increment(Duration::from_secs(30));
        let trimmed = store.trim_internal(50);
        assert_eq!(trimmed, 50);
        assert_eq!(evicted.load(Ordering::SeqCst), 50);
        assert_eq!(store.count(), 51);
        assert!(store.get("pinned").is_some());
        // The survivors are the most recently added half.
        assert!(store.get("k99").is_some());
        assert!(store.get("k0").is_none());
    }

    #[test]
    fn dispose_drains_without_firing_callbacks() {
        let (clock, _mock) = Clock::mock();
        let store = store(clock.clone());
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&calls);
        let e = entry_with(&clock, "k", "v", None, Duration::ZERO,
            CacheItemPriority::Default,
            Some(Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })));
        assert!(store.add_or_get_existing("k", e).is_none());

        store.dispose();
        assert_eq!(store.count(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        // Operations on a disposed store are no-ops.
        assert!(store.get("k").is_none());
        let late = entry_with(&clock, "k2", "v", None, Duration::ZERO,
            CacheItemPriority::Default, None);
        assert!(store.add_or_get_existing("k2", late).is_none());
        assert_eq!(store.count(), 0);
    }
}
