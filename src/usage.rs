//! The per-shard usage ladder: a bucketed approximation of LRU.
//!
//! Entries live in the same page-table layout as the expiration wheel, with
//! two extra links per slot threading a most-recently-used order across the
//! whole bucket. Only bucket 0 is populated; `NotRemovable` entries are never
//! tracked. Trimming walks the LRU tail and bulk-evicts, preferring entries
//! that have been in the cache long enough to have proven themselves unused.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use triomphe::Arc as TrioArc;

use crate::common::page_table::{
    grown_page_count, EntryRef, PageLink, PageLinked, PageList, ENTRIES_PER_PAGE, NO_PAGE,
    SLOTS_PER_PAGE,
};
use crate::common::time::Ticks;
use crate::entry::CacheEntry;
use crate::store::MemoryCacheStore;

pub(crate) const USAGE_BUCKET: u8 = 0;

/// Entries younger than this are passed over by the first eviction sweep, and
/// entries expiring sooner than this are not worth tracking at all.
pub(crate) const NEWADD_INTERVAL_TICKS: Ticks = 10_000;

/// Upper bound on evictions per `flush_under_used` call.
const MAX_FLUSH_PER_CALL: usize = 1024;

enum UsageSlot<V> {
    Free { next: u8 },
    Used {
        entry: TrioArc<CacheEntry<V>>,
        utc_added: Ticks,
        /// Toward the MRU head (more recently used).
        prev: EntryRef,
        /// Toward the LRU tail (less recently used).
        next: EntryRef,
    },
}

struct UsagePage<V> {
    slots: Option<Box<[UsageSlot<V>]>>,
    free_head: u8,
    free_count: usize,
    link: PageLink,
}

impl<V> UsagePage<V> {
    fn unallocated() -> Self {
        Self {
            slots: None,
            free_head: 0,
            free_count: 0,
            link: PageLink::default(),
        }
    }

    fn allocate(&mut self) {
        debug_assert!(self.slots.is_none());
        let mut slots = Vec::with_capacity(SLOTS_PER_PAGE);
        slots.push(UsageSlot::Free { next: 0 });
        for i in 1..SLOTS_PER_PAGE {
            let next = if i == SLOTS_PER_PAGE - 1 { 0 } else { i + 1 } as u8;
            slots.push(UsageSlot::Free { next });
        }
        self.slots = Some(slots.into_boxed_slice());
        self.free_head = 1;
        self.free_count = ENTRIES_PER_PAGE;
    }
}

impl<V> PageLinked for UsagePage<V> {
    fn link(&self) -> PageLink {
        self.link
    }

    fn link_mut(&mut self) -> &mut PageLink {
        &mut self.link
    }
}

struct UsageBucketData<V> {
    pages: Vec<UsagePage<V>>,
    free_pages: PageList,
    free_slot_pages: PageList,
    pages_in_use: usize,
    entry_count: usize,
    mru_head: EntryRef,
    lru_tail: EntryRef,
}

impl<V> UsageBucketData<V> {
    fn new() -> Self {
        Self {
            pages: Vec::new(),
            free_pages: PageList::default(),
            free_slot_pages: PageList::default(),
            pages_in_use: 0,
            entry_count: 0,
            mru_head: EntryRef::INVALID,
            lru_tail: EntryRef::INVALID,
        }
    }

    fn slot(&self, r: EntryRef) -> &UsageSlot<V> {
        &self.pages[r.page()].slots.as_ref().expect("linked slot")[r.slot()]
    }

    fn slot_mut(&mut self, r: EntryRef) -> &mut UsageSlot<V> {
        &mut self.pages[r.page()].slots.as_mut().expect("linked slot")[r.slot()]
    }

    fn set_prev(&mut self, r: EntryRef, value: EntryRef) {
        match self.slot_mut(r) {
            UsageSlot::Used { prev, .. } => *prev = value,
            UsageSlot::Free { .. } => unreachable!("MRU link points at a free slot"),
        }
    }

    fn set_next(&mut self, r: EntryRef, value: EntryRef) {
        match self.slot_mut(r) {
            UsageSlot::Used { next, .. } => *next = value,
            UsageSlot::Free { .. } => unreachable!("MRU link points at a free slot"),
        }
    }

    fn links(&self, r: EntryRef) -> (EntryRef, EntryRef) {
        match self.slot(r) {
            UsageSlot::Used { prev, next, .. } => (*prev, *next),
            UsageSlot::Free { .. } => unreachable!("MRU link points at a free slot"),
        }
    }

    fn splice_at_head(&mut self, r: EntryRef) {
        let old_head = self.mru_head;
        self.set_prev(r, EntryRef::INVALID);
        self.set_next(r, old_head);
        if old_head.is_invalid() {
            self.lru_tail = r;
        } else {
            self.set_prev(old_head, r);
        }
        self.mru_head = r;
    }

    fn unlink(&mut self, r: EntryRef) {
        let (prev, next) = self.links(r);
        if prev.is_invalid() {
            self.mru_head = next;
        } else {
            self.set_next(prev, next);
        }
        if next.is_invalid() {
            self.lru_tail = prev;
        } else {
            self.set_prev(next, prev);
        }
    }

    fn grow(&mut self) {
        let old_len = self.pages.len();
        let new_len = grown_page_count(old_len);
        for _ in old_len..new_len {
            self.pages.push(UsagePage::unallocated());
        }
        for page in old_len..new_len {
            self.free_pages.push_head(&mut self.pages, page as i32);
        }
    }

    fn alloc_slot(&mut self) -> EntryRef {
        if let Some(r) = self.alloc_slot_no_grow() {
            return r;
        }
        if self.free_pages.is_empty() {
            self.grow();
        }
        let page = self.free_pages.pop_head(&mut self.pages);
        debug_assert!(page != NO_PAGE);
        self.pages[page as usize].allocate();
        self.pages_in_use += 1;
        self.free_slot_pages.push_head(&mut self.pages, page);
        self.alloc_slot_no_grow().expect("freshly allocated page has free slots")
    }

    fn alloc_slot_no_grow(&mut self) -> Option<EntryRef> {
        let page = self.free_slot_pages.head();
        if page == NO_PAGE {
            return None;
        }
        let p = &mut self.pages[page as usize];
        let slot = p.free_head as usize;
        debug_assert!(slot != 0);
        let next = match p.slots.as_ref().expect("page in free-slot list")[slot] {
            UsageSlot::Free { next } => next,
            UsageSlot::Used { .. } => unreachable!("free chain points at a used slot"),
        };
        p.free_head = next;
        p.free_count -= 1;
        if p.free_count == 0 {
            self.free_slot_pages.remove(&mut self.pages, page);
        }
        Some(EntryRef::new(page as usize, slot))
    }

    /// Frees a slot that has already been unlinked from the MRU order.
    fn free_slot(&mut self, r: EntryRef) -> TrioArc<CacheEntry<V>> {
        let (page, slot) = (r.page(), r.slot());
        let p = &mut self.pages[page];
        let slots = p.slots.as_mut().expect("freeing an unallocated page");
        let prev_head = p.free_head;
        let taken = std::mem::replace(&mut slots[slot], UsageSlot::Free { next: prev_head });
        p.free_head = slot as u8;
        p.free_count += 1;
        let free_count = p.free_count;
        if free_count == 1 {
            self.free_slot_pages.push_head(&mut self.pages, page as i32);
        } else if free_count == ENTRIES_PER_PAGE {
            self.release_page(page as i32);
        }
        match taken {
            UsageSlot::Used { entry, .. } => entry,
            UsageSlot::Free { .. } => unreachable!("freeing a free slot"),
        }
    }

    fn release_page(&mut self, page: i32) {
        self.free_slot_pages.remove(&mut self.pages, page);
        let p = &mut self.pages[page as usize];
        p.slots = None;
        p.free_head = 0;
        p.free_count = 0;
        self.pages_in_use -= 1;
        self.free_pages.push_head(&mut self.pages, page);
    }

    fn needs_reduce(&self) -> bool {
        self.pages_in_use > 1 && self.entry_count < self.pages_in_use * ENTRIES_PER_PAGE / 2
    }

    /// Compacts sparse pages, rewriting the MRU links of every migrated slot.
    fn reduce(&mut self) {
        while self.needs_reduce() {
            let mut victim = NO_PAGE;
            let mut max_free = 0;
            for page in self.free_slot_pages.iter(&self.pages) {
                let free = self.pages[page as usize].free_count;
                if free > max_free {
                    max_free = free;
                    victim = page;
                }
            }
            if victim == NO_PAGE {
                return;
            }

            self.free_slot_pages.remove(&mut self.pages, victim);

            for slot in 1..SLOTS_PER_PAGE {
                let used = matches!(
                    self.pages[victim as usize].slots.as_ref().expect("in-use page")[slot],
                    UsageSlot::Used { .. }
                );
                if !used {
                    continue;
                }
                let Some(dest) = self.alloc_slot_no_grow() else {
                    self.free_slot_pages.push_head(&mut self.pages, victim);
                    return;
                };
                let p = &mut self.pages[victim as usize];
                let slots = p.slots.as_mut().expect("in-use page");
                let prev_head = p.free_head;
                let taken =
                    std::mem::replace(&mut slots[slot], UsageSlot::Free { next: prev_head });
                p.free_head = slot as u8;
                p.free_count += 1;
                let (entry, utc_added, prev, next) = match taken {
                    UsageSlot::Used {
                        entry,
                        utc_added,
                        prev,
                        next,
                    } => (entry, utc_added, prev, next),
                    UsageSlot::Free { .. } => unreachable!(),
                };
                entry.set_usage_link(USAGE_BUCKET, dest);
                *self.slot_mut(dest) = UsageSlot::Used {
                    entry,
                    utc_added,
                    prev,
                    next,
                };
                if prev.is_invalid() {
                    self.mru_head = dest;
                } else {
                    self.set_next(prev, dest);
                }
                if next.is_invalid() {
                    self.lru_tail = dest;
                } else {
                    self.set_prev(next, dest);
                }
            }

            let p = &mut self.pages[victim as usize];
            p.slots = None;
            p.free_head = 0;
            p.free_count = 0;
            self.pages_in_use -= 1;
            self.free_pages.push_head(&mut self.pages, victim);
        }
    }
}

/// One usage ladder, owned by a shard.
pub(crate) struct CacheUsage<V> {
    bucket: Mutex<UsageBucketData<V>>,
    in_flush: AtomicBool,
}

impl<V> CacheUsage<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn new() -> Self {
        Self {
            bucket: Mutex::new(UsageBucketData::new()),
            in_flush: AtomicBool::new(false),
        }
    }

    pub(crate) fn add(&self, entry: &TrioArc<CacheEntry<V>>, now: Ticks) {
        let mut d = self.bucket.lock();
        let r = d.alloc_slot();
        *d.slot_mut(r) = UsageSlot::Used {
            entry: TrioArc::clone(entry),
            utc_added: now,
            prev: EntryRef::INVALID,
            next: EntryRef::INVALID,
        };
        d.entry_count += 1;
        d.splice_at_head(r);
        entry.set_usage_link(USAGE_BUCKET, r);
    }

    /// Moves the entry to the MRU head. Callers debounce this through the
    /// entry's last-usage-update timestamp.
    pub(crate) fn update(&self, entry: &TrioArc<CacheEntry<V>>) {
        let mut d = self.bucket.lock();
        let Some(r) = verified_ref(&*d, entry) else {
            return;
        };
        d.unlink(r);
        d.splice_at_head(r);
    }

    pub(crate) fn remove(&self, entry: &TrioArc<CacheEntry<V>>) {
        let mut d = self.bucket.lock();
        let Some(r) = verified_ref(&*d, entry) else {
            return;
        };
        d.unlink(r);
        d.free_slot(r);
        entry.clear_usage_link();
        d.entry_count -= 1;
        d.reduce();
    }

    #[cfg(test)]
    pub(crate) fn entry_count(&self) -> usize {
        self.bucket.lock().entry_count
    }

    /// Evicts up to `target` of the least-recently-used entries, seasoned
    /// entries first, and has the shard release them with reason `Evicted`.
    /// Concurrent calls while a flush is running are swallowed.
    pub(crate) fn flush_under_used(&self, store: &MemoryCacheStore<V>, target: usize) -> usize {
        if target == 0 {
            return 0;
        }
        if self
            .in_flush
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return 0;
        }

        let now = store.clock().now_ticks();
        let max = target.min(MAX_FLUSH_PER_CALL);
        let mut victims: Vec<TrioArc<CacheEntry<V>>> = Vec::new();
        {
            let mut d = self.bucket.lock();
            for seasoned_only in [true, false] {
                if victims.len() >= max {
                    break;
                }
                let mut cursor = d.lru_tail;
                while !cursor.is_invalid() && victims.len() < max {
                    let (toward_head, utc_added) = match d.slot(cursor) {
                        UsageSlot::Used {
                            prev, utc_added, ..
                        } => (*prev, *utc_added),
                        UsageSlot::Free { .. } => unreachable!("LRU walk hit a free slot"),
                    };
                    if seasoned_only && now - utc_added < NEWADD_INTERVAL_TICKS {
                        cursor = toward_head;
                        continue;
                    }
                    d.unlink(cursor);
                    let entry = d.free_slot(cursor);
                    entry.clear_usage_link();
                    d.entry_count -= 1;
                    victims.push(entry);
                    cursor = toward_head;
                }
            }
            d.reduce();
        }

        for entry in &victims {
            store.remove_evicted_entry(entry);
        }
        self.in_flush.store(false, Ordering::Release);
        victims.len()
    }
}

fn verified_ref<V>(d: &UsageBucketData<V>, entry: &TrioArc<CacheEntry<V>>) -> Option<EntryRef> {
    if entry.usage_bucket() != USAGE_BUCKET {
        return None;
    }
    let r = entry.usage_ref();
    if r.is_invalid() {
        return None;
    }
    match d.slot(r) {
        UsageSlot::Used { entry: e, .. } if TrioArc::ptr_eq(e, entry) => Some(r),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryPayload;
    use crate::policy::CacheItemPriority;
    use chrono::Utc;
    use std::time::Duration;

    fn entry(key: &str) -> TrioArc<CacheEntry<String>> {
        TrioArc::new(CacheEntry::new(
            key.to_string(),
            EntryPayload::Value("v".to_string()),
            Utc::now(),
            i64::MAX,
            Duration::ZERO,
            CacheItemPriority::Default,
            Vec::new(),
            None,
        ))
    }

    fn lru_order(usage: &CacheUsage<String>) -> Vec<String> {
        let d = usage.bucket.lock();
        let mut out = Vec::new();
        let mut cursor = d.lru_tail;
        while !cursor.is_invalid() {
            match d.slot(cursor) {
                UsageSlot::Used { entry, prev, .. } => {
                    out.push(entry.key().to_string());
                    cursor = *prev;
                }
                UsageSlot::Free { .. } => unreachable!(),
            }
        }
        out
    }

    #[test]
    fn add_splices_at_mru_head() {
        let usage = CacheUsage::new();
        for key in ["a", "b", "c"] {
            usage.add(&entry(key), 0);
        }
        // Tail-to-head: oldest first.
        assert_eq!(lru_order(&usage), vec!["a", "b", "c"]);
        assert_eq!(usage.entry_count(), 3);
    }

    #[test]
    fn update_moves_to_head() {
        let usage = CacheUsage::new();
        let a = entry("a");
        let b = entry("b");
        let c = entry("c");
        usage.add(&a, 0);
        usage.add(&b, 0);
        usage.add(&c, 0);

        usage.update(&a);
        assert_eq!(lru_order(&usage), vec!["b", "c", "a"]);
    }

    #[test]
    fn remove_unlinks_and_clears_the_entry() {
        let usage = CacheUsage::new();
        let a = entry("a");
        let b = entry("b");
        usage.add(&a, 0);
        usage.add(&b, 0);

        usage.remove(&a);
        assert!(!a.in_usage());
        assert_eq!(lru_order(&usage), vec!["b"]);
        // Stale removes are ignored.
        usage.remove(&a);
        assert_eq!(usage.entry_count(), 1);
    }

    #[test]
    fn reduce_preserves_mru_order() {
        let usage = CacheUsage::new();
        let entries: Vec<_> = (0..ENTRIES_PER_PAGE * 3)
            .map(|i| entry(&format!("k{:03}", i)))
            .collect();
        for e in &entries {
            usage.add(e, 0);
        }
        // Remove four of every five entries to force compaction.
        for (i, e) in entries.iter().enumerate() {
            if i % 5 != 0 {
                usage.remove(e);
            }
        }
        assert!(usage.bucket.lock().pages_in_use < 3);

        let expected: Vec<_> = entries
            .iter()
            .enumerate()
            .filter(|(i, _)| i % 5 == 0)
            .map(|(_, e)| e.key().to_string())
            .collect();
        assert_eq!(lru_order(&usage), expected);
    }
}
