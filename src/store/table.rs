//! The segment table: a dense, grow-only array of published segments.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use tracing::debug;

use crate::error::{Result, StoreError};
use crate::segment::Segment;

/// Highest number of segments any table may hold; segment index
/// `u16::MAX` is reserved for the empty-address sentinel.
const TABLE_CEILING: u32 = u16::MAX as u32;

/// Ordered array of segments with atomic publication.
///
/// Growth is two-phase: an index is reserved by advancing `count`, then
/// the constructed segment is published at that index. Readers walking
/// `0..count` must treat a reserved-but-unpublished index as "not ready",
/// which `get` does by returning `None`.
pub(crate) struct SegmentTable {
    slots: Box<[OnceLock<Arc<Segment>>]>,
    count: AtomicU32,
}

impl SegmentTable {
    pub fn new(max_segments: u32) -> Self {
        let cap = max_segments.min(TABLE_CEILING) as usize;
        let slots: Vec<OnceLock<Arc<Segment>>> = (0..cap).map(|_| OnceLock::new()).collect();
        Self {
            slots: slots.into_boxed_slice(),
            count: AtomicU32::new(0),
        }
    }

    /// Number of reserved segment indices. Grows monotonically.
    #[inline]
    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    /// The published segment at `idx`, if any.
    pub fn get(&self, idx: u16) -> Option<Arc<Segment>> {
        if (idx as u32) >= self.count() {
            return None;
        }
        self.slots.get(idx as usize)?.get().cloned()
    }

    /// Reserves the next index, constructs the segment and publishes it.
    /// Returns `None` when the capacity ceiling has been reached, without
    /// advancing the counter.
    pub fn add(&self) -> Option<Arc<Segment>> {
        let len = self.slots.len() as u32;
        let idx = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                if n < len {
                    Some(n + 1)
                } else {
                    None
                }
            })
            .ok()?;
        let seg = Arc::new(Segment::new(idx as u16));
        // The index was reserved by this thread, so publication can only
        // happen once.
        let _ = self.slots[idx as usize].set(Arc::clone(&seg));
        debug!(segment = idx, "published new segment");
        Some(seg)
    }

    /// Installs a segment rebuilt from a persisted image. Images must
    /// arrive as a dense prefix, in order.
    pub fn install(&self, seg: Arc<Segment>) -> Result<()> {
        let idx = seg.id() as u32;
        if idx != self.count.load(Ordering::Acquire) {
            return Err(StoreError::Corruption("segment images out of order"));
        }
        if idx as usize >= self.slots.len() {
            return Err(StoreError::Corruption(
                "segment image beyond configured capacity",
            ));
        }
        self.slots[idx as usize]
            .set(seg)
            .map_err(|_| StoreError::Corruption("segment index already published"))?;
        self.count.store(idx + 1, Ordering::Release);
        Ok(())
    }

    /// Iterates the published prefix, skipping not-yet-published indices.
    pub fn iter_published(&self) -> impl Iterator<Item = Arc<Segment>> + '_ {
        (0..self.count()).filter_map(move |i| self.slots[i as usize].get().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_publishes_dense_indices() {
        let table = SegmentTable::new(4);
        let a = table.add().unwrap();
        let b = table.add().unwrap();
        assert_eq!(a.id(), 0);
        assert_eq!(b.id(), 1);
        assert_eq!(table.count(), 2);
        assert!(table.get(0).is_some());
        assert!(table.get(2).is_none());
    }

    #[test]
    fn ceiling_stops_growth_without_advancing() {
        let table = SegmentTable::new(2);
        assert!(table.add().is_some());
        assert!(table.add().is_some());
        assert!(table.add().is_none());
        assert_eq!(table.count(), 2);
    }

    #[test]
    fn install_requires_dense_order() {
        let table = SegmentTable::new(4);
        let seg1 = Arc::new(Segment::new(1));
        assert!(matches!(
            table.install(seg1),
            Err(StoreError::Corruption(_))
        ));
        let seg0 = Arc::new(Segment::new(0));
        table.install(seg0).unwrap();
        assert_eq!(table.count(), 1);
    }
}
