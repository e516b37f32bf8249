//! The per-shard expiration wheel.
//!
//! Thirty buckets each cover a 20-second slice of wall time, so the wheel
//! cycles every 600 seconds. Entries are stored in page tables (127 payload
//! slots per page, slot 0 reserved) threaded onto free-page and free-slot
//! lists, and every bucket keeps a short histogram of upcoming deadlines so a
//! flush can tell in O(1) whether it would find anything.

use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::Mutex;
use triomphe::Arc as TrioArc;

use crate::common::page_table::{
    grown_page_count, EntryRef, PageLink, PageLinked, PageList, ENTRIES_PER_PAGE, NO_PAGE,
    SLOTS_PER_PAGE,
};
use crate::common::time::{Ticks, NEVER};
use crate::entry::{CacheEntry, NOT_IN_BUCKET};
use crate::store::MemoryCacheStore;

pub(crate) const NUM_BUCKETS: usize = 30;

const BUCKET_TICKS: Ticks = 20_000;
const CYCLE_TICKS: Ticks = NUM_BUCKETS as Ticks * BUCKET_TICKS;

/// Width of one histogram cell; four cells cover a bucket's 20-second slice.
const COUNT_INTERVAL_TICKS: Ticks = 5_000;
const NUM_COUNTS: usize = 4;

/// A full flush runs at most once per second per wheel.
const MIN_FLUSH_INTERVAL_TICKS: Ticks = 1_000;

/// Maps an absolute deadline to its wheel bucket.
pub(crate) fn bucket_index(utc_expires: Ticks) -> u8 {
    ((utc_expires.rem_euclid(CYCLE_TICKS) / BUCKET_TICKS + 1) % NUM_BUCKETS as Ticks) as u8
}

enum ExpiresSlot<V> {
    Free { next: u8 },
    Used {
        utc_expires: Ticks,
        entry: TrioArc<CacheEntry<V>>,
    },
}

struct ExpiresPage<V> {
    /// `None` while the page sits on the free-page list.
    slots: Option<Box<[ExpiresSlot<V>]>>,
    free_head: u8,
    free_count: usize,
    link: PageLink,
}

impl<V> ExpiresPage<V> {
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
        slots.push(ExpiresSlot::Free { next: 0 });
        for i in 1..SLOTS_PER_PAGE {
            let next = if i == SLOTS_PER_PAGE - 1 { 0 } else { i + 1 } as u8;
            slots.push(ExpiresSlot::Free { next });
        }
        self.slots = Some(slots.into_boxed_slice());
        self.free_head = 1;
        self.free_count = ENTRIES_PER_PAGE;
    }
}

impl<V> PageLinked for ExpiresPage<V> {
    fn link(&self) -> PageLink {
        self.link
    }

    fn link_mut(&mut self) -> &mut PageLink {
        &mut self.link
    }
}

struct BucketData<V> {
    pages: Vec<ExpiresPage<V>>,
    free_pages: PageList,
    free_slot_pages: PageList,
    pages_in_use: usize,
    entry_count: usize,
    counts: [u32; NUM_COUNTS],
    counts_anchor: Ticks,
    min_expires: Ticks,
    /// Set while a flush's removals are in progress so compaction stays out
    /// of the way.
    block_reduce: bool,
}

impl<V> BucketData<V> {
    fn new() -> Self {
        Self {
            pages: Vec::new(),
            free_pages: PageList::default(),
            free_slot_pages: PageList::default(),
            pages_in_use: 0,
            entry_count: 0,
            counts: [0; NUM_COUNTS],
            counts_anchor: 0,
            min_expires: NEVER,
            block_reduce: false,
        }
    }

    fn count_index(&self, utc_expires: Ticks) -> usize {
        let delta = (utc_expires - self.counts_anchor).max(0);
        ((delta / COUNT_INTERVAL_TICKS) as usize).min(NUM_COUNTS - 1)
    }

    fn note_add(&mut self, utc_expires: Ticks) {
        let idx = self.count_index(utc_expires);
        self.counts[idx] += 1;
        if utc_expires < self.min_expires {
            self.min_expires = utc_expires;
        }
    }

    fn note_remove(&mut self, utc_expires: Ticks) {
        let idx = self.count_index(utc_expires);
        self.counts[idx] = self.counts[idx].saturating_sub(1);
    }

    /// How many entries the histogram can already prove expired. Entries
    /// beyond the 20-second window pool in the last cell, which only counts
    /// once `now` has passed the whole window; `min_expires` covers the gap.
    fn expired_count(&self, now: Ticks) -> u32 {
        let mut total = 0;
        for (i, count) in self.counts.iter().enumerate() {
            let cell_end = self.counts_anchor + (i as Ticks + 1) * COUNT_INTERVAL_TICKS;
            if cell_end <= now {
                total += count;
            }
        }
        total
    }

    fn grow(&mut self) {
        let old_len = self.pages.len();
        let new_len = grown_page_count(old_len);
        for _ in old_len..new_len {
            self.pages.push(ExpiresPage::unallocated());
        }
        for page in old_len..new_len {
            self.free_pages.push_head(&mut self.pages, page as i32);
        }
    }

    fn alloc_slot(&mut self) -> (usize, usize) {
        self.alloc_slot_no_grow().unwrap_or_else(|| {
            if self.free_pages.is_empty() {
                self.grow();
            }
            let page = self.free_pages.pop_head(&mut self.pages);
            debug_assert!(page != NO_PAGE);
            self.pages[page as usize].allocate();
            self.pages_in_use += 1;
            self.free_slot_pages.push_head(&mut self.pages, page);
            self.alloc_slot_no_grow().expect("freshly allocated page has free slots")
        })
    }

    fn alloc_slot_no_grow(&mut self) -> Option<(usize, usize)> {
        let page = self.free_slot_pages.head();
        if page == NO_PAGE {
            return None;
        }
        let p = &mut self.pages[page as usize];
        let slot = p.free_head as usize;
        debug_assert!(slot != 0);
        let next = match p.slots.as_ref().expect("page in free-slot list")[slot] {
            ExpiresSlot::Free { next } => next,
            ExpiresSlot::Used { .. } => unreachable!("free chain points at a used slot"),
        };
        p.free_head = next;
        p.free_count -= 1;
        if p.free_count == 0 {
            self.free_slot_pages.remove(&mut self.pages, page);
        }
        Some((page as usize, slot))
    }

    /// Frees a used slot and returns its payload. Releases the page back to
    /// the free-page list when it empties out.
    fn take_slot(&mut self, page: usize, slot: usize) -> (Ticks, TrioArc<CacheEntry<V>>) {
        let p = &mut self.pages[page];
        let slots = p.slots.as_mut().expect("taking from an unallocated page");
        let prev_head = p.free_head;
        let taken = std::mem::replace(&mut slots[slot], ExpiresSlot::Free { next: prev_head });
        p.free_head = slot as u8;
        p.free_count += 1;
        let free_count = p.free_count;
        if free_count == 1 {
            self.free_slot_pages.push_head(&mut self.pages, page as i32);
        } else if free_count == ENTRIES_PER_PAGE {
            self.release_page(page as i32);
        }
        match taken {
            ExpiresSlot::Used { utc_expires, entry } => (utc_expires, entry),
            ExpiresSlot::Free { .. } => unreachable!("taking a free slot"),
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

    /// Compacts sparse pages by migrating their remaining entries into other
    /// pages, then releasing them.
    fn reduce(&mut self, bucket: u8) {
        while self.needs_reduce() {
            // The sparsest page is the cheapest to drain.
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

            // Hide the victim from the allocator while draining it.
            self.free_slot_pages.remove(&mut self.pages, victim);

            for slot in 1..SLOTS_PER_PAGE {
                let used = matches!(
                    self.pages[victim as usize].slots.as_ref().expect("in-use page")[slot],
                    ExpiresSlot::Used { .. }
                );
                if !used {
                    continue;
                }
                let Some((dest_page, dest_slot)) = self.alloc_slot_no_grow() else {
                    // Nowhere left to migrate; put the victim back and stop.
                    self.free_slot_pages.push_head(&mut self.pages, victim);
                    return;
                };
                let p = &mut self.pages[victim as usize];
                let slots = p.slots.as_mut().expect("in-use page");
                let prev_head = p.free_head;
                let taken =
                    std::mem::replace(&mut slots[slot], ExpiresSlot::Free { next: prev_head });
                p.free_head = slot as u8;
                p.free_count += 1;
                let (utc_expires, entry) = match taken {
                    ExpiresSlot::Used { utc_expires, entry } => (utc_expires, entry),
                    ExpiresSlot::Free { .. } => unreachable!(),
                };
                entry.set_expires_link(bucket, EntryRef::new(dest_page, dest_slot));
                self.pages[dest_page].slots.as_mut().expect("in-use page")[dest_slot] =
                    ExpiresSlot::Used { utc_expires, entry };
            }

            // Fully drained; release without going through the free-slot list.
            let p = &mut self.pages[victim as usize];
            p.slots = None;
            p.free_head = 0;
            p.free_count = 0;
            self.pages_in_use -= 1;
            self.free_pages.push_head(&mut self.pages, victim);
        }
    }
}

struct ExpiresBucket<V> {
    bucket_id: u8,
    data: Mutex<BucketData<V>>,
}

impl<V> ExpiresBucket<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn new(bucket_id: u8) -> Self {
        Self {
            bucket_id,
            data: Mutex::new(BucketData::new()),
        }
    }

    fn add(&self, entry: &TrioArc<CacheEntry<V>>, utc_expires: Ticks) {
        let mut d = self.data.lock();
        let (page, slot) = d.alloc_slot();
        d.pages[page].slots.as_mut().expect("in-use page")[slot] = ExpiresSlot::Used {
            utc_expires,
            entry: TrioArc::clone(entry),
        };
        d.entry_count += 1;
        d.note_add(utc_expires);
        entry.set_expires_link(self.bucket_id, EntryRef::new(page, slot));
    }

    fn remove(&self, entry: &TrioArc<CacheEntry<V>>) {
        let mut d = self.data.lock();
        // Re-read under the lock; a flush may have unlinked the entry already.
        if entry.expires_bucket() != self.bucket_id {
            return;
        }
        let entry_ref = entry.expires_ref();
        if entry_ref.is_invalid() {
            return;
        }
        let (page, slot) = (entry_ref.page(), entry_ref.slot());
        let matches = match &d.pages[page].slots.as_ref().expect("linked slot")[slot] {
            ExpiresSlot::Used { entry: e, .. } => TrioArc::ptr_eq(e, entry),
            ExpiresSlot::Free { .. } => false,
        };
        if !matches {
            return;
        }
        let (utc_expires, _taken) = d.take_slot(page, slot);
        entry.clear_expires_link();
        d.entry_count -= 1;
        d.note_remove(utc_expires);
        if !d.block_reduce {
            d.reduce(self.bucket_id);
        }
    }

    /// Rewrites the deadline of an entry that stays in this bucket.
    fn update_in_place(&self, entry: &TrioArc<CacheEntry<V>>, new_expires: Ticks) {
        let mut d = self.data.lock();
        if entry.expires_bucket() != self.bucket_id {
            return;
        }
        let entry_ref = entry.expires_ref();
        if entry_ref.is_invalid() {
            return;
        }
        let (page, slot) = (entry_ref.page(), entry_ref.slot());
        let old = match &mut d.pages[page].slots.as_mut().expect("linked slot")[slot] {
            ExpiresSlot::Used { utc_expires, entry: e } if TrioArc::ptr_eq(e, entry) => {
                std::mem::replace(utc_expires, new_expires)
            }
            _ => return,
        };
        d.note_remove(old);
        d.note_add(new_expires);
        entry.set_utc_abs_exp(new_expires);
    }

    fn flush(&self, store: &MemoryCacheStore<V>, now: Ticks, use_insert_block: bool) -> usize {
        {
            let d = self.data.lock();
            if d.entry_count == 0 || (d.expired_count(now) == 0 && d.min_expires > now) {
                return 0;
            }
        }

        if use_insert_block {
            store.block_inserts();
        }

        let mut removed: Vec<TrioArc<CacheEntry<V>>> = Vec::new();
        {
            let mut d = self.data.lock();
            d.block_reduce = true;
            d.counts = [0; NUM_COUNTS];
            d.counts_anchor = now;
            d.min_expires = NEVER;

            for page in 0..d.pages.len() {
                if d.pages[page].slots.is_none() {
                    continue;
                }
                for slot in 1..SLOTS_PER_PAGE {
                    if d.pages[page].slots.is_none() {
                        // The page emptied out and was released mid-walk.
                        break;
                    }
                    let live_expiry = match &d.pages[page].slots.as_ref().expect("checked")[slot] {
                        ExpiresSlot::Used { utc_expires, .. } => Some(*utc_expires),
                        ExpiresSlot::Free { .. } => None,
                    };
                    match live_expiry {
                        Some(expiry) if expiry <= now => {
                            let (_, entry) = d.take_slot(page, slot);
                            entry.clear_expires_link();
                            d.entry_count -= 1;
                            removed.push(entry);
                        }
                        Some(expiry) => d.note_add(expiry),
                        None => {}
                    }
                }
            }
        }

        if use_insert_block {
            store.release_inserts();
        }

        let flushed = removed.len();
        for entry in removed {
            store.remove_expired_entry(&entry);
        }

        let mut d = self.data.lock();
        d.block_reduce = false;
        d.reduce(self.bucket_id);
        flushed
    }
}

/// One expiration wheel, owned by a shard.
pub(crate) struct CacheExpires<V> {
    buckets: Box<[ExpiresBucket<V>]>,
    utc_last_flush: AtomicI64,
}

impl<V> CacheExpires<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn new() -> Self {
        let buckets = (0..NUM_BUCKETS as u8)
            .map(ExpiresBucket::new)
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            buckets,
            utc_last_flush: AtomicI64::new(0),
        }
    }

    pub(crate) fn utc_add(&self, entry: &TrioArc<CacheEntry<V>>, utc_expires: Ticks) {
        debug_assert!(utc_expires != NEVER);
        self.buckets[bucket_index(utc_expires) as usize].add(entry, utc_expires);
    }

    pub(crate) fn remove(&self, entry: &TrioArc<CacheEntry<V>>) {
        let bucket = entry.expires_bucket();
        if bucket != NOT_IN_BUCKET {
            self.buckets[bucket as usize].remove(entry);
        }
    }

    /// Moves an entry's deadline, staying in place when the new deadline maps
    /// to the same bucket.
    pub(crate) fn utc_update(&self, entry: &TrioArc<CacheEntry<V>>, new_expires: Ticks) {
        let bucket = entry.expires_bucket();
        if bucket == NOT_IN_BUCKET {
            entry.set_utc_abs_exp(new_expires);
            return;
        }
        let new_bucket = bucket_index(new_expires);
        if new_bucket == bucket {
            self.buckets[bucket as usize].update_in_place(entry, new_expires);
        } else {
            self.buckets[bucket as usize].remove(entry);
            entry.set_utc_abs_exp(new_expires);
            self.buckets[new_bucket as usize].add(entry, new_expires);
        }
    }

    /// Deletes every entry whose deadline has passed, then has the shard
    /// release them with reason `Expired`. Rate-limited to once per second
    /// unless `force` is set.
    pub(crate) fn flush_expired_items(&self, store: &MemoryCacheStore<V>, force: bool) -> usize {
        let now = store.clock().now_ticks();
        if force {
            self.utc_last_flush.store(now, Ordering::Release);
        } else {
            let last = self.utc_last_flush.load(Ordering::Acquire);
            if now - last < MIN_FLUSH_INTERVAL_TICKS {
                return 0;
            }
            if self
                .utc_last_flush
                .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return 0;
            }
        }

        let use_insert_block = store.use_insert_block();
        let mut flushed = 0;
        for bucket in self.buckets.iter() {
            flushed += bucket.flush(store, now, use_insert_block);
        }
        flushed
    }
}
