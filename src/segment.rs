//! Segments: fixed-capacity slot arrays with per-slot locks.
//!
//! A segment owns `SEGMENT_CAPACITY` element slots. Every slot carries its
//! own raw mutex; all reads and writes of the enclosed element go through
//! a [`SlotGuard`] obtained from one of the locking entry points, so the
//! unsafe interior-mutability plumbing stays inside this module.
//!
//! Lock acquisition is spin-then-park with eventual fairness (parking_lot),
//! which keeps deletion from being starved indefinitely by allocation.

#![allow(unsafe_code)]

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::lock_api::RawMutex as _;
use parking_lot::RawMutex;

use crate::addr::Addr;
use crate::element::Element;
use crate::error::{Result, StoreError};
use crate::persist::SegmentImage;
use crate::stats::ElementsStat;

/// Number of element slots per segment.
pub const SEGMENT_CAPACITY: usize = 1024;

/// Try-lock attempts spent per slot when collecting advisory statistics.
const STAT_LOCK_ATTEMPTS: u32 = 4;

struct Slot {
    lock: RawMutex,
    cell: UnsafeCell<Element>,
}

// A slot's element is only ever touched while its lock is held.
unsafe impl Sync for Slot {}

impl Slot {
    fn new(element: Element) -> Self {
        Self {
            lock: RawMutex::INIT,
            cell: UnsafeCell::new(element),
        }
    }
}

/// Fixed-capacity array of element slots; the unit of table growth.
pub struct Segment {
    id: u16,
    slots: Box<[Slot]>,
    /// Count of claimed (non-empty or being-populated) slots. Serves as
    /// the "empty slots exist" hint.
    live: AtomicU32,
}

impl Segment {
    /// Creates a segment of empty slots.
    pub fn new(id: u16) -> Self {
        let slots: Vec<Slot> = (0..SEGMENT_CAPACITY)
            .map(|_| Slot::new(Element::default()))
            .collect();
        Self {
            id,
            slots: slots.into_boxed_slice(),
            live: AtomicU32::new(0),
        }
    }

    /// Rebuilds a segment from a persisted image. Slots beyond the image
    /// length come up empty.
    pub fn from_image(image: SegmentImage) -> Result<Self> {
        if image.elements.len() > SEGMENT_CAPACITY {
            return Err(StoreError::Corruption(
                "segment image larger than segment capacity",
            ));
        }
        let live = image
            .elements
            .iter()
            .filter(|el| !el.kind.is_empty())
            .count() as u32;
        let mut elements = image.elements;
        elements.resize(SEGMENT_CAPACITY, Element::default());
        let slots: Vec<Slot> = elements.into_iter().map(Slot::new).collect();
        Ok(Self {
            id: image.id,
            slots: slots.into_boxed_slice(),
            live: AtomicU32::new(live),
        })
    }

    #[inline]
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Hint query: true when the segment is believed to have a free slot.
    /// May be stale in either direction for an instant; callers that act
    /// on it must tolerate `lock_empty` failing.
    #[inline]
    pub fn has_empty_slot(&self) -> bool {
        self.live.load(Ordering::Relaxed) < SEGMENT_CAPACITY as u32
    }

    /// Finds an empty slot, acquires its lock and returns the guard.
    ///
    /// Serialization-safe: the emptiness check happens under the slot
    /// lock and the slot stays locked until the caller has populated it,
    /// so two concurrent callers never claim the same slot.
    pub(crate) fn lock_empty(self: &Arc<Self>) -> Option<SlotGuard> {
        if !self.has_empty_slot() {
            return None;
        }
        for (offset, slot) in self.slots.iter().enumerate() {
            if !slot.lock.try_lock() {
                continue;
            }
            let empty = unsafe { (*slot.cell.get()).kind.is_empty() };
            if empty {
                self.live.fetch_add(1, Ordering::Relaxed);
                return Some(SlotGuard::claim(Arc::clone(self), offset as u16));
            }
            unsafe { slot.lock.unlock() };
        }
        None
    }

    /// Blocking acquisition of one slot lock. `offset` must be in range.
    pub(crate) fn lock(self: &Arc<Self>, offset: u16) -> SlotGuard {
        debug_assert!((offset as usize) < self.slots.len());
        self.slots[offset as usize].lock.lock();
        SlotGuard::claim(Arc::clone(self), offset)
    }

    /// Bounded acquisition: spins up to `attempts` times, returns `None`
    /// when the slot stays busy.
    pub(crate) fn try_lock(self: &Arc<Self>, offset: u16, attempts: u32) -> Option<SlotGuard> {
        debug_assert!((offset as usize) < self.slots.len());
        let slot = &self.slots[offset as usize];
        for _ in 0..attempts.max(1) {
            if slot.lock.try_lock() {
                return Some(SlotGuard::claim(Arc::clone(self), offset));
            }
            std::hint::spin_loop();
        }
        None
    }

    /// Adds this segment's slot counts to `stat`. Busy slots are skipped;
    /// the result is advisory.
    pub(crate) fn collect_stat(&self, stat: &mut ElementsStat) {
        for slot in self.slots.iter() {
            let mut acquired = false;
            for _ in 0..STAT_LOCK_ATTEMPTS {
                if slot.lock.try_lock() {
                    acquired = true;
                    break;
                }
                std::hint::spin_loop();
            }
            if !acquired {
                continue;
            }
            let kind = unsafe { (*slot.cell.get()).kind };
            unsafe { slot.lock.unlock() };
            if kind.is_empty() {
                stat.empty_count += 1;
            } else if kind.is_connector() {
                stat.arc_count += 1;
            } else if kind.is_link() {
                stat.link_count += 1;
            } else {
                stat.node_count += 1;
            }
        }
    }

    /// Copies out every slot for the persistence collaborator, locking
    /// each briefly. Intended for shutdown, when mutation has quiesced.
    pub(crate) fn snapshot(&self) -> SegmentImage {
        let mut elements = Vec::with_capacity(self.slots.len());
        for slot in self.slots.iter() {
            slot.lock.lock();
            let el = unsafe { *slot.cell.get() };
            unsafe { slot.lock.unlock() };
            elements.push(el);
        }
        SegmentImage {
            id: self.id,
            elements,
        }
    }
}

/// Held slot lock with access to the enclosed element.
///
/// Dropping the guard releases the lock. Guards are deliberately `!Send`:
/// the underlying raw lock must be released on the thread that acquired it.
pub(crate) struct SlotGuard {
    seg: Arc<Segment>,
    offset: u16,
    _not_send: PhantomData<*mut ()>,
}

impl SlotGuard {
    fn claim(seg: Arc<Segment>, offset: u16) -> Self {
        Self {
            seg,
            offset,
            _not_send: PhantomData,
        }
    }

    #[inline]
    pub fn addr(&self) -> Addr {
        Addr::new(self.seg.id, self.offset)
    }

    /// Snapshot of the element.
    #[inline]
    pub fn get(&self) -> Element {
        unsafe { *self.seg.slots[self.offset as usize].cell.get() }
    }

    /// Overwrites the whole element.
    #[inline]
    pub fn set(&mut self, element: Element) {
        unsafe {
            *self.seg.slots[self.offset as usize].cell.get() = element;
        }
    }

    /// In-place mutation.
    #[inline]
    pub fn update(&mut self, f: impl FnOnce(&mut Element)) {
        unsafe {
            f(&mut *self.seg.slots[self.offset as usize].cell.get());
        }
    }

    /// Restores the slot to empty. The lock stays held until the guard
    /// drops, so no allocator can observe a half-erased slot.
    pub fn erase(&mut self) {
        if !self.get().kind.is_empty() {
            self.set(Element::default());
            self.seg.live.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        unsafe { self.seg.slots[self.offset as usize].lock.unlock() };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ElementType;

    #[test]
    fn lock_empty_claims_distinct_slots() {
        let seg = Arc::new(Segment::new(0));
        let mut a = seg.lock_empty().unwrap();
        let mut b = seg.lock_empty().unwrap();
        assert_ne!(a.addr(), b.addr());
        a.set(Element::node(ElementType::NODE));
        b.set(Element::node(ElementType::NODE));
    }

    #[test]
    fn segment_fills_to_capacity() {
        let seg = Arc::new(Segment::new(3));
        let mut guards = Vec::new();
        for _ in 0..SEGMENT_CAPACITY {
            let mut g = seg.lock_empty().expect("segment has room");
            g.set(Element::node(ElementType::NODE));
            guards.push(g);
        }
        assert!(!seg.has_empty_slot());
        drop(guards);
        // Still full: dropping the guards releases locks, not slots.
        assert!(seg.lock_empty().is_none());
    }

    #[test]
    fn erase_makes_slot_reusable() {
        let seg = Arc::new(Segment::new(0));
        let addr = {
            let mut g = seg.lock_empty().unwrap();
            g.set(Element::link());
            g.addr()
        };
        {
            let mut g = seg.lock(addr.offset);
            g.erase();
        }
        let g = seg.lock(addr.offset);
        assert!(g.get().kind.is_empty());
        drop(g);
        assert!(seg.has_empty_slot());
    }

    #[test]
    fn try_lock_reports_busy() {
        let seg = Arc::new(Segment::new(0));
        let held = seg.lock(5);
        assert!(seg.try_lock(5, 3).is_none());
        drop(held);
        assert!(seg.try_lock(5, 3).is_some());
    }

    #[test]
    fn image_roundtrip_preserves_elements() {
        let seg = Arc::new(Segment::new(2));
        {
            let mut g = seg.lock_empty().unwrap();
            g.set(Element::node(ElementType::NODE | ElementType::CONST));
        }
        let image = seg.snapshot();
        let rebuilt = Segment::from_image(image).unwrap();
        assert_eq!(rebuilt.id(), 2);
        let rebuilt = Arc::new(rebuilt);
        let g = rebuilt.lock(0);
        assert_eq!(g.get().kind, ElementType::NODE | ElementType::CONST);
    }

    #[test]
    fn oversized_image_is_rejected() {
        let image = SegmentImage {
            id: 0,
            elements: vec![Element::default(); SEGMENT_CAPACITY + 1],
        };
        assert!(matches!(
            Segment::from_image(image),
            Err(StoreError::Corruption(_))
        ));
    }
}
