use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use triomphe::Arc as TrioArc;

use crate::cache::CacheInner;
use crate::entry::{CacheEntry, EntryState};

pub type OnChangedCallback = Box<dyn FnOnce() + Send>;

/// A dependency an entry can be bound to. When the monitored state changes,
/// the cache removes the dependent entry with reason `ChangeMonitorChanged`.
pub trait ChangeMonitor: Send + Sync + 'static {
    /// Stable identifier for this monitor instance.
    fn unique_id(&self) -> String;

    fn has_changed(&self) -> bool;

    /// Registers the single change callback. Fires immediately when the
    /// monitored state has already changed (or the monitor is disposed), so
    /// no change is ever lost to the registration race.
    ///
    /// # Panics
    ///
    /// Panics when called a second time on the same monitor.
    fn notify_on_changed(&self, on_changed: OnChangedCallback);

    /// Stops watching. Idempotent.
    fn dispose(&self);
}

/// Implemented by anything registered on an entry's dependent list; the entry
/// calls it when it leaves `AddedToCache`.
pub(crate) trait EntryDependent: Send + Sync {
    fn entry_changed(&self);
}

/// The changed/disposed/callback bookkeeping every monitor needs: the change
/// flag flips once, and the callback fires exactly once, no matter how the
/// flag flip and the callback registration interleave.
pub(crate) struct MonitorState {
    changed: AtomicBool,
    disposed: AtomicBool,
    callback_set: AtomicBool,
    callback: Mutex<Option<OnChangedCallback>>,
}

impl MonitorState {
    pub(crate) fn new() -> Self {
        Self {
            changed: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            callback_set: AtomicBool::new(false),
            callback: Mutex::new(None),
        }
    }

    pub(crate) fn has_changed(&self) -> bool {
        self.changed.load(Ordering::Acquire)
    }

    pub(crate) fn set_changed(&self) {
        if !self.changed.swap(true, Ordering::AcqRel) {
            self.fire();
        }
    }

    pub(crate) fn set_disposed(&self) {
        self.disposed.store(true, Ordering::Release);
    }

    pub(crate) fn notify_on_changed(&self, on_changed: OnChangedCallback) {
        if self.callback_set.swap(true, Ordering::AcqRel) {
            panic!("notify_on_changed may only be called once per change monitor");
        }
        if self.changed.load(Ordering::Acquire) || self.disposed.load(Ordering::Acquire) {
            on_changed();
            return;
        }
        *self.callback.lock() = Some(on_changed);
        // A change may have slipped in while the slot was empty.
        if self.changed.load(Ordering::Acquire) {
            self.fire();
        }
    }

    fn fire(&self) {
        // Take the callback out first; it must run with the slot unlocked
        // because it may re-enter the cache.
        let callback = self.callback.lock().take();
        if let Some(callback) = callback {
            callback();
        }
    }
}

struct MonitorShared<V> {
    keys: Vec<String>,
    entries: Mutex<Vec<TrioArc<CacheEntry<V>>>>,
    unique_id: String,
    last_modified: DateTime<Utc>,
    state: MonitorState,
}

impl<V> EntryDependent for MonitorShared<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn entry_changed(&self) {
        self.state.set_changed();
    }
}

/// Watches a set of keys in the cache that created it. The monitor trips as
/// soon as any watched entry leaves `AddedToCache`; a key that is absent at
/// construction trips it immediately.
pub struct CacheEntryChangeMonitor<V> {
    shared: Arc<MonitorShared<V>>,
}

impl<V> Clone for CacheEntryChangeMonitor<V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<V> CacheEntryChangeMonitor<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn new<I>(inner: &Arc<CacheInner<V>>, keys: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let keys: Vec<String> = keys.into_iter().collect();
        let mut entries = Vec::with_capacity(keys.len());
        let mut tripped = false;
        for key in &keys {
            match inner.live_entry(key) {
                Some(entry) => entries.push(entry),
                None => tripped = true,
            }
        }

        let mut unique_id = String::new();
        let mut last_modified = DateTime::<Utc>::MIN_UTC;
        for entry in &entries {
            let created = entry.utc_created();
            unique_id.push_str(entry.key());
            unique_id.push_str(&format!("{:x}", created.timestamp_millis()));
            if created > last_modified {
                last_modified = created;
            }
        }

        let shared = Arc::new(MonitorShared {
            keys,
            entries: Mutex::new(entries),
            unique_id,
            last_modified,
            state: MonitorState::new(),
        });

        let shared_dyn: Arc<dyn EntryDependent> = shared.clone();
        let weak: Weak<dyn EntryDependent> = Arc::downgrade(&shared_dyn);
        for entry in shared.entries.lock().iter() {
            entry.add_dependent(weak.clone());
            // The entry may have been removed between lookup and
            // registration, in which case its dependents were already
            // notified without us.
            if matches!(
                entry.state(),
                EntryState::RemovingFromCache | EntryState::RemovedFromCache | EntryState::Closed
            ) {
                tripped = true;
            }
        }
        if tripped {
            shared.state.set_changed();
        }

        Self { shared }
    }

    /// The watched keys, in construction order.
    pub fn cache_keys(&self) -> Vec<String> {
        self.shared.keys.clone()
    }

    /// The newest creation instant among the entries that existed when the
    /// monitor was built.
    pub fn last_modified(&self) -> DateTime<Utc> {
        self.shared.last_modified
    }
}

impl<V> ChangeMonitor for CacheEntryChangeMonitor<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn unique_id(&self) -> String {
        self.shared.unique_id.clone()
    }

    fn has_changed(&self) -> bool {
        self.shared.state.has_changed()
    }

    fn notify_on_changed(&self, on_changed: OnChangedCallback) {
        self.shared.state.notify_on_changed(on_changed);
    }

    fn dispose(&self) {
        self.shared.state.set_disposed();
        let entries = std::mem::take(&mut *self.shared.entries.lock());
        let shared_dyn: Arc<dyn EntryDependent> = self.shared.clone();
        let weak: Weak<dyn EntryDependent> = Arc::downgrade(&shared_dyn);
        for entry in entries {
            entry.remove_dependent(&weak);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn change_fires_registered_callback_once() {
        let state = MonitorState::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        state.notify_on_changed(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        state.set_changed();
        state.set_changed();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(state.has_changed());
    }

    #[test]
    fn late_registration_fires_immediately() {
        let state = MonitorState::new();
        state.set_changed();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        state.notify_on_changed(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic(expected = "only be called once")]
    fn double_registration_panics() {
        let state = MonitorState::new();
        state.notify_on_changed(Box::new(|| {}));
        state.notify_on_changed(Box::new(|| {}));
    }
}
