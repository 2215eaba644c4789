//! Bounded clock-eviction cache of page-sized buffers.
//!
//! Slots are claimed from a free pool via CAS while the cache warms up; once
//! full, the clock hand sweeps under the eviction monitor, skipping pinned
//! and referenced slots (clearing referenced bits on the way). Statistics
//! are lock-free counters.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;

#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheStats {
    fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

struct SlotPage {
    page_id: Option<u64>,
    buf: Vec<u8>,
}

struct Slot {
    page: Mutex<SlotPage>,
    referenced: AtomicBool,
    pinned: AtomicBool,
}

/// Fixed-capacity page cache keyed by page id. Safe for concurrent readers
/// and writers.
pub struct PageCache {
    page_size: usize,
    slots: Vec<Slot>,
    index: DashMap<u64, usize>,
    /// Eviction monitor: protects only the clock sweep and slot install.
    hand: Mutex<usize>,
    claimed: AtomicUsize,
    stats: CacheStats,
}

impl PageCache {
    #[must_use]
    pub fn new(capacity: usize, page_size: usize) -> Self {
        let capacity = capacity.max(1);
        let slots = (0..capacity)
            .map(|_| Slot {
                page: Mutex::new(SlotPage { page_id: None, buf: Vec::new() }),
                referenced: AtomicBool::new(false),
                pinned: AtomicBool::new(false),
            })
            .collect();
        Self {
            page_size,
            slots,
            index: DashMap::new(),
            hand: Mutex::new(0),
            claimed: AtomicUsize::new(0),
            stats: CacheStats::default(),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    /// Copy the cached page into `dest`. Returns `false` on a miss.
    pub fn try_get(&self, page_id: u64, dest: &mut [u8]) -> bool {
        debug_assert_eq!(dest.len(), self.page_size);
        let Some(slot_idx) = self.index.get(&page_id).map(|e| *e) else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        let slot = &self.slots[slot_idx];
        let page = slot.page.lock();
        if page.page_id != Some(page_id) {
            // Evicted between the index lookup and the slot lock.
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        dest.copy_from_slice(&page.buf);
        slot.referenced.store(true, Ordering::Release);
        self.stats.hits.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Insert or update a page image.
    pub fn put(&self, page_id: u64, src: &[u8]) {
        debug_assert_eq!(src.len(), self.page_size);
        if let Some(slot_idx) = self.index.get(&page_id).map(|e| *e) {
            let slot = &self.slots[slot_idx];
            let mut page = slot.page.lock();
            if page.page_id == Some(page_id) {
                page.buf.copy_from_slice(src);
                slot.referenced.store(true, Ordering::Release);
                return;
            }
        }

        let mut hand = self.hand.lock();
        let slot_idx = match self.claim_slot() {
            Some(idx) => idx,
            None => match self.evict_locked(&mut hand) {
                Some(idx) => idx,
                // Every slot pinned; skip caching rather than block.
                None => return,
            },
        };
        let slot = &self.slots[slot_idx];
        let mut page = slot.page.lock();
        if let Some(old_id) = page.page_id.take() {
            self.index.remove_if(&old_id, |_, &idx| idx == slot_idx);
        }
        if page.buf.len() != self.page_size {
            page.buf = vec![0u8; self.page_size];
        }
        page.buf.copy_from_slice(src);
        page.page_id = Some(page_id);
        // Fresh installs start unreferenced; only an access sets the bit.
        slot.referenced.store(false, Ordering::Release);
        self.index.insert(page_id, slot_idx);
    }

    /// Drop the mapping for a page; the buffer is retained for reuse.
    pub fn invalidate(&self, page_id: u64) {
        if let Some((_, slot_idx)) = self.index.remove(&page_id) {
            let slot = &self.slots[slot_idx];
            let mut page = slot.page.lock();
            if page.page_id == Some(page_id) {
                page.page_id = None;
                slot.referenced.store(false, Ordering::Release);
                slot.pinned.store(false, Ordering::Release);
            }
        }
    }

    /// Pin a resident page against eviction. Returns whether it was resident.
    pub fn pin(&self, page_id: u64) -> bool {
        self.set_pinned(page_id, true)
    }

    pub fn unpin(&self, page_id: u64) -> bool {
        self.set_pinned(page_id, false)
    }

    fn set_pinned(&self, page_id: u64, pinned: bool) -> bool {
        let Some(slot_idx) = self.index.get(&page_id).map(|e| *e) else {
            return false;
        };
        let slot = &self.slots[slot_idx];
        let page = slot.page.lock();
        if page.page_id != Some(page_id) {
            return false;
        }
        slot.pinned.store(pinned, Ordering::Release);
        true
    }

    /// Claim a never-used slot via CAS on the claimed count.
    fn claim_slot(&self) -> Option<usize> {
        let mut current = self.claimed.load(Ordering::Acquire);
        loop {
            if current >= self.slots.len() {
                return None;
            }
            match self.claimed.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(current),
                Err(observed) => current = observed,
            }
        }
    }

    /// Clock sweep: skip pinned and referenced slots, clearing referenced
    /// bits on the way. After a full sweep with no unreferenced victim, the
    /// first unpinned slot seen is evicted unconditionally.
    fn evict_locked(&self, hand: &mut usize) -> Option<usize> {
        let capacity = self.slots.len();
        let mut fallback = None;
        for _ in 0..capacity * 2 {
            let slot_idx = *hand;
            *hand = (*hand + 1) % capacity;
            let slot = &self.slots[slot_idx];
            if slot.pinned.load(Ordering::Acquire) {
                continue;
            }
            if slot.referenced.swap(false, Ordering::AcqRel) {
                if fallback.is_none() {
                    fallback = Some(slot_idx);
                }
                continue;
            }
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            return Some(slot_idx);
        }
        if fallback.is_some() {
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        }
        fallback
    }
}

impl std::fmt::Debug for PageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageCache")
            .field("capacity", &self.slots.len())
            .field("page_size", &self.page_size)
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}
