//! Cache of segments believed to have free slots.
//!
//! A small open-addressed array of segment indices that amortizes the
//! search for allocatable segments under contention. Entries are hints:
//! a cached segment may have filled up concurrently, in which case the
//! allocator removes it and retries. `append`/`remove` are lock-free
//! per-entry CAS; `get` is serialized by a single gate so only one thread
//! at a time performs the refill/grow slow path.

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use super::table::SegmentTable;
use crate::segment::Segment;
use crate::store::MemoryContext;

/// Number of cache entries.
pub(crate) const CACHE_SIZE: usize = 16;

/// Entry encoding: `segment index + 1`, zero means vacant.
pub(crate) struct SegmentCache {
    entries: [AtomicU32; CACHE_SIZE],
    count: AtomicI32,
    gate: Mutex<()>,
}

impl SegmentCache {
    pub fn new() -> Self {
        Self {
            entries: std::array::from_fn(|_| AtomicU32::new(0)),
            count: AtomicI32::new(0),
            gate: Mutex::new(()),
        }
    }

    #[inline]
    fn home(ctx: &MemoryContext) -> usize {
        ctx.id as usize % CACHE_SIZE
    }

    /// Records `seg_id` as a segment with free slots. Silently discarded
    /// when the cache is full.
    pub fn append(&self, ctx: &MemoryContext, seg_id: u16) {
        let tagged = seg_id as u32 + 1;
        let home = Self::home(ctx);
        for i in 0..CACHE_SIZE {
            let entry = &self.entries[(home + i) % CACHE_SIZE];
            if entry
                .compare_exchange(0, tagged, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.count.fetch_add(1, Ordering::AcqRel);
                break;
            }
        }
    }

    /// Drops one cached reference to `seg_id`, if present.
    pub fn remove(&self, ctx: &MemoryContext, seg_id: u16) {
        let tagged = seg_id as u32 + 1;
        let home = Self::home(ctx);
        for i in 0..CACHE_SIZE {
            let entry = &self.entries[(home + i) % CACHE_SIZE];
            if entry
                .compare_exchange(tagged, 0, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.count.fetch_sub(1, Ordering::AcqRel);
                break;
            }
        }
    }

    /// Returns a segment believed to have a free slot, refilling the
    /// cache from the table and finally growing the table when nothing is
    /// cached. `None` means the capacity ceiling was reached.
    pub fn get(&self, ctx: &MemoryContext, table: &SegmentTable) -> Option<Arc<Segment>> {
        let _gate = self.gate.lock();

        if self.count.load(Ordering::Acquire) > 0 {
            if let Some(seg) = self.scan(ctx, table) {
                return Some(seg);
            }
        }

        self.refill(ctx, table);
        if let Some(seg) = self.scan(ctx, table) {
            return Some(seg);
        }

        let seg = table.add()?;
        self.append(ctx, seg.id());
        Some(seg)
    }

    /// First cached segment starting from the caller's home index. The
    /// entry is left in place; the allocator removes it only on failure.
    fn scan(&self, ctx: &MemoryContext, table: &SegmentTable) -> Option<Arc<Segment>> {
        let home = Self::home(ctx);
        for i in 0..CACHE_SIZE {
            let tagged = self.entries[(home + i) % CACHE_SIZE].load(Ordering::Acquire);
            if tagged == 0 {
                continue;
            }
            if let Some(seg) = table.get((tagged - 1) as u16) {
                return Some(seg);
            }
        }
        None
    }

    /// Walks the published table and caches every segment advertising
    /// free slots, stopping once the cache is full.
    fn refill(&self, ctx: &MemoryContext, table: &SegmentTable) {
        trace!("refilling empty-slot cache");
        for seg in table.iter_published() {
            if self.count.load(Ordering::Acquire) >= CACHE_SIZE as i32 {
                break;
            }
            if seg.has_empty_slot() {
                self.append(ctx, seg.id());
            }
        }
    }
}
