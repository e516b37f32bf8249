use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use smallvec::SmallVec;
use triomphe::Arc as TrioArc;

use crate::cache::CacheInner;
use crate::change_monitor::{CacheEntryChangeMonitor, ChangeMonitor, EntryDependent};
use crate::common::page_table::EntryRef;
use crate::common::time::{ticks_from_datetime, Ticks, NEVER};
use crate::notification::{RemovedArguments, RemovedCallback, RemovedReason, UpdateCallback};
use crate::policy::CacheItemPriority;

/// Bucket id stored while an entry is not linked into the wheel or ladder.
pub(crate) const NOT_IN_BUCKET: u8 = u8::MAX;

/// Lifecycle stage of an entry. The state only ever advances, one
/// compare-and-swap at a time, so exactly one actor performs each step.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum EntryState {
    NotInCache = 0,
    AddingToCache = 1,
    AddedToCache = 2,
    RemovingFromCache = 3,
    RemovedFromCache = 4,
    /// Terminal. The value has been released and the removed callback, if
    /// any, has fired.
    Closed = 5,
}

impl EntryState {
    fn from_u8(v: u8) -> EntryState {
        match v {
            0 => EntryState::NotInCache,
            1 => EntryState::AddingToCache,
            2 => EntryState::AddedToCache,
            3 => EntryState::RemovingFromCache,
            4 => EntryState::RemovedFromCache,
            _ => EntryState::Closed,
        }
    }
}

pub(crate) enum EntryPayload<V> {
    Value(V),
    /// The auxiliary entry inserted alongside an update-callback entry. Its
    /// expiration stands in for the real entry's, so the callback can refresh
    /// the value before anything is lost.
    Sentinel(SentinelPayload<V>),
}

pub(crate) struct SentinelPayload<V> {
    pub(crate) target_key: String,
    pub(crate) update_callback: UpdateCallback<V>,
    /// Watches the real entry. When the real entry is removed through the
    /// public surface this monitor trips first, which tells the sentinel's
    /// removal handler not to resurrect the key.
    pub(crate) dependency: CacheEntryChangeMonitor<V>,
}

pub(crate) struct CacheEntry<V> {
    key: String,
    payload: EntryPayload<V>,
    utc_created: DateTime<Utc>,
    state: AtomicU8,
    utc_abs_exp: AtomicI64,
    sliding_exp: Duration,
    priority: CacheItemPriority,
    expires_bucket: AtomicU8,
    expires_ref: AtomicU32,
    usage_bucket: AtomicU8,
    usage_ref: AtomicU32,
    utc_last_usage_update: AtomicI64,
    removed_callback: Option<RemovedCallback<V>>,
    /// Monitors this entry observes; owned, disposed on release.
    monitors: Mutex<Vec<Arc<dyn ChangeMonitor>>>,
    /// Monitors observing this entry.
    dependents: Mutex<SmallVec<[Weak<dyn EntryDependent>; 1]>>,
    /// For update-callback entries: the shard index and entry of the paired
    /// sentinel, so gets on the real entry slide the sentinel's deadline.
    update_sentinel: Mutex<Option<(usize, TrioArc<CacheEntry<V>>)>>,
    callback_invoked: AtomicBool,
}

impl<V> CacheEntry<V> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        key: String,
        payload: EntryPayload<V>,
        utc_created: DateTime<Utc>,
        utc_abs_exp: Ticks,
        sliding_exp: Duration,
        priority: CacheItemPriority,
        monitors: Vec<Arc<dyn ChangeMonitor>>,
        removed_callback: Option<RemovedCallback<V>>,
    ) -> Self {
        Self {
            key,
            payload,
            utc_created,
            state: AtomicU8::new(EntryState::NotInCache as u8),
            utc_abs_exp: AtomicI64::new(utc_abs_exp),
            sliding_exp,
            priority,
            expires_bucket: AtomicU8::new(NOT_IN_BUCKET),
            expires_ref: AtomicU32::new(EntryRef::INVALID.raw()),
            usage_bucket: AtomicU8::new(NOT_IN_BUCKET),
            usage_ref: AtomicU32::new(EntryRef::INVALID.raw()),
            utc_last_usage_update: AtomicI64::new(ticks_from_datetime(utc_created)),
            removed_callback,
            monitors: Mutex::new(monitors),
            dependents: Mutex::new(SmallVec::new()),
            update_sentinel: Mutex::new(None),
            callback_invoked: AtomicBool::new(false),
        }
    }

    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    pub(crate) fn utc_created(&self) -> DateTime<Utc> {
        self.utc_created
    }

    pub(crate) fn sliding_exp(&self) -> Duration {
        self.sliding_exp
    }

    #[inline]
    pub(crate) fn state(&self) -> EntryState {
        EntryState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_state(&self, state: EntryState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Advances the state only when it still holds `expected`. Returns whether
    /// this caller performed the transition.
    #[inline]
    pub(crate) fn compare_exchange_state(&self, expected: EntryState, new: EntryState) -> bool {
        self.state
            .compare_exchange(
                expected as u8,
                new as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    #[inline]
    pub(crate) fn utc_abs_exp(&self) -> Ticks {
        self.utc_abs_exp.load(Ordering::Acquire)
    }

    pub(crate) fn set_utc_abs_exp(&self, ticks: Ticks) {
        self.utc_abs_exp.store(ticks, Ordering::Release);
    }

    #[inline]
    pub(crate) fn is_expired(&self, now: Ticks) -> bool {
        self.utc_abs_exp() <= now
    }

    pub(crate) fn has_expiration(&self) -> bool {
        self.utc_abs_exp() != NEVER
    }

    /// Whether the entry participates in usage tracking at all.
    pub(crate) fn has_usage(&self) -> bool {
        self.priority != CacheItemPriority::NotRemovable
    }

    pub(crate) fn expires_bucket(&self) -> u8 {
        self.expires_bucket.load(Ordering::Acquire)
    }

    pub(crate) fn expires_ref(&self) -> EntryRef {
        EntryRef::from_raw(self.expires_ref.load(Ordering::Acquire))
    }

    pub(crate) fn set_expires_link(&self, bucket: u8, entry_ref: EntryRef) {
        self.expires_ref.store(entry_ref.raw(), Ordering::Release);
        self.expires_bucket.store(bucket, Ordering::Release);
    }

    pub(crate) fn clear_expires_link(&self) {
        self.expires_bucket.store(NOT_IN_BUCKET, Ordering::Release);
        self.expires_ref
            .store(EntryRef::INVALID.raw(), Ordering::Release);
    }

    pub(crate) fn in_expires(&self) -> bool {
        self.expires_bucket() != NOT_IN_BUCKET
    }

    pub(crate) fn usage_bucket(&self) -> u8 {
        self.usage_bucket.load(Ordering::Acquire)
    }

    pub(crate) fn usage_ref(&self) -> EntryRef {
        EntryRef::from_raw(self.usage_ref.load(Ordering::Acquire))
    }

    pub(crate) fn set_usage_link(&self, bucket: u8, entry_ref: EntryRef) {
        self.usage_ref.store(entry_ref.raw(), Ordering::Release);
        self.usage_bucket.store(bucket, Ordering::Release);
    }

    pub(crate) fn clear_usage_link(&self) {
        self.usage_bucket.store(NOT_IN_BUCKET, Ordering::Release);
        self.usage_ref
            .store(EntryRef::INVALID.raw(), Ordering::Release);
    }

    pub(crate) fn in_usage(&self) -> bool {
        self.usage_bucket() != NOT_IN_BUCKET
    }

    pub(crate) fn utc_last_usage_update(&self) -> Ticks {
        self.utc_last_usage_update.load(Ordering::Acquire)
    }

    pub(crate) fn set_utc_last_usage_update(&self, ticks: Ticks) {
        self.utc_last_usage_update.store(ticks, Ordering::Release);
    }

    pub(crate) fn value(&self) -> Option<&V> {
        match &self.payload {
            EntryPayload::Value(v) => Some(v),
            EntryPayload::Sentinel(_) => None,
        }
    }

    pub(crate) fn monitors_snapshot(&self) -> Vec<Arc<dyn ChangeMonitor>> {
        self.monitors.lock().clone()
    }

    pub(crate) fn add_dependent(&self, dependent: Weak<dyn EntryDependent>) {
        let mut dependents = self.dependents.lock();
        dependents.retain(|w| w.strong_count() > 0);
        dependents.push(dependent);
    }

    pub(crate) fn remove_dependent(&self, dependent: &Weak<dyn EntryDependent>) {
        self.dependents
            .lock()
            .retain(|w| !w.ptr_eq(dependent) && w.strong_count() > 0);
    }

    fn notify_dependents(&self) {
        let dependents = std::mem::take(&mut *self.dependents.lock());
        for weak in dependents {
            if let Some(dependent) = weak.upgrade() {
                dependent.entry_changed();
            }
        }
    }

    pub(crate) fn configure_update_sentinel(
        &self,
        store_index: usize,
        sentinel: TrioArc<CacheEntry<V>>,
    ) {
        *self.update_sentinel.lock() = Some((store_index, sentinel));
    }

    pub(crate) fn update_sentinel(&self) -> Option<(usize, TrioArc<CacheEntry<V>>)> {
        self.update_sentinel.lock().clone()
    }
}

impl<V> CacheEntry<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Final teardown of a removed entry: dispose the monitors it observes,
    /// trip the monitors observing it, fire its callback at most once, and
    /// close.
    ///
    /// `cache` is absent only when the owning cache has already been dropped,
    /// in which case the sentinel machinery has nothing left to refresh.
    pub(crate) fn release(&self, cache: Option<&Arc<CacheInner<V>>>, reason: RemovedReason) {
        let monitors = std::mem::take(&mut *self.monitors.lock());
        for monitor in &monitors {
            monitor.dispose();
        }

        self.notify_dependents();

        match &self.payload {
            EntryPayload::Sentinel(payload) => {
                if self
                    .callback_invoked
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    if let Some(cache) = cache {
                        cache.on_sentinel_removed(payload, reason);
                    }
                }
            }
            EntryPayload::Value(value) => {
                if let Some(callback) = &self.removed_callback {
                    let suppressed = reason == RemovedReason::Disposing
                        && !cache.map_or(false, |c| c.callbacks_on_dispose());
                    if !suppressed
                        && self
                            .callback_invoked
                            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                            .is_ok()
                    {
                        let args = RemovedArguments {
                            key: self.key.clone(),
                            value: value.clone(),
                            reason,
                        };
                        if catch_unwind(AssertUnwindSafe(|| callback(args))).is_err() {
                            log::error!("removed callback panicked for key {:?}", self.key);
                        }
                    }
                }
            }
        }

        *self.update_sentinel.lock() = None;
        self.set_state(EntryState::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn plain_entry(removed_callback: Option<RemovedCallback<String>>) -> CacheEntry<String> {
        CacheEntry::new(
            "k".to_string(),
            EntryPayload::Value("v".to_string()),
            Utc::now(),
            NEVER,
            Duration::ZERO,
            CacheItemPriority::Default,
            Vec::new(),
            removed_callback,
        )
    }

    #[test]
    fn state_advances_by_cas_exactly_once() {
        let entry = plain_entry(None);
        assert_eq!(entry.state(), EntryState::NotInCache);

        entry.set_state(EntryState::AddingToCache);
        assert!(entry.compare_exchange_state(EntryState::AddingToCache, EntryState::AddedToCache));
        // A second actor loses the race.
        assert!(!entry.compare_exchange_state(EntryState::AddingToCache, EntryState::AddedToCache));
        assert_eq!(entry.state(), EntryState::AddedToCache);
    }

    #[test]
    fn expiry_comparison_uses_ticks() {
        let entry = plain_entry(None);
        assert!(!entry.is_expired(i64::MAX - 1));

        entry.set_utc_abs_exp(1_000);
        assert!(entry.is_expired(1_000));
        assert!(entry.is_expired(2_000));
        assert!(!entry.is_expired(999));
    }

    #[test]
    fn removed_callback_fires_at_most_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let entry = plain_entry(Some(Arc::new(move |_args| {
            counter.fetch_add(1, Ordering::SeqCst);
        })));

        entry.release(None, RemovedReason::Removed);
        entry.release(None, RemovedReason::Removed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(entry.state(), EntryState::Closed);
    }

    #[test]
    fn disposing_reason_suppresses_callback_without_cache() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let entry = plain_entry(Some(Arc::new(move |_args| {
            counter.fetch_add(1, Ordering::SeqCst);
        })));

        entry.release(None, RemovedReason::Disposing);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn link_fields_round_trip() {
        let entry = plain_entry(None);
        assert!(!entry.in_expires());
        assert!(!entry.in_usage());

        entry.set_expires_link(3, EntryRef::new(2, 17));
        assert!(entry.in_expires());
        assert_eq!(entry.expires_bucket(), 3);
        assert_eq!(entry.expires_ref(), EntryRef::new(2, 17));

        entry.clear_expires_link();
        assert!(!entry.in_expires());
        assert!(entry.expires_ref().is_invalid());
    }
}
