//! The storage façade.
//!
//! `Storage` owns the segment table and the empty-slot cache and exposes
//! the public operations: element creation, recursive deletion, type and
//! endpoint reads, link content access, and scoped locking by address.
//!
//! # Locking protocol
//!
//! Every element field is guarded by its slot lock. Operations that need
//! a single slot take it with a blocking lock. Operations that need
//! several slots at once follow one of two disciplines:
//!
//! - **Arc creation** does not know its full lock set up front (the list
//!   heads are read under the endpoint locks), so it acquires every slot
//!   with a bounded `try_lock` and, on any failure, releases everything
//!   and restarts the whole protocol.
//! - **Recursive deletion** must lock an unbounded frontier, so it works
//!   in rounds: blocking-lock the candidate set in ascending address
//!   order while holding nothing else, walk the closure under those
//!   locks (newly discovered slots are only ever taken with bounded
//!   try-locks), and relock the enlarged sorted set whenever the walk
//!   came up short. Blocking waits thus always happen in ascending
//!   address order, which rules out deadlock between overlapping
//!   deletions.
//!
//! All mutation happens only after the full lock set is held, so no other
//! thread can observe a half-spliced list.

mod cache;
mod table;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use tracing::info;

use crate::addr::Addr;
use crate::checksum::content_checksum;
use crate::config::StoreConfig;
use crate::element::Element;
use crate::error::{Result, StoreError};
use crate::events::EventSink;
use crate::persist::Persistence;
use crate::segment::{Segment, SlotGuard, SEGMENT_CAPACITY};
use crate::stats::ElementsStat;
use crate::types::ElementType;

use self::cache::SegmentCache;
use self::table::SegmentTable;

/// Caller identity. The store uses only `id`, as the probe origin into
/// the empty-slot cache, so contexts with distinct ids contend less.
#[derive(Clone, Copy, Debug)]
pub struct MemoryContext {
    pub id: u32,
}

impl MemoryContext {
    pub const fn new(id: u32) -> Self {
        Self { id }
    }
}

/// Held element lock with read access to the element state.
///
/// Dropping the guard releases the lock. Guards must stay on the thread
/// that acquired them.
pub struct ElementGuard {
    inner: SlotGuard,
}

impl ElementGuard {
    pub fn addr(&self) -> Addr {
        self.inner.addr()
    }

    /// Snapshot of the element under the held lock.
    pub fn element(&self) -> Element {
        self.inner.get()
    }
}

/// Concurrent segmented element store.
pub struct Storage {
    config: StoreConfig,
    table: SegmentTable,
    cache: SegmentCache,
    events: Arc<dyn EventSink>,
    persistence: Arc<dyn Persistence>,
    initialized: AtomicBool,
    next_ctx: AtomicU32,
}

impl Storage {
    /// Builds a store with the given collaborators. No segments exist
    /// until `initialize` has run.
    pub fn new(
        config: StoreConfig,
        events: Arc<dyn EventSink>,
        persistence: Arc<dyn Persistence>,
    ) -> Self {
        let table = SegmentTable::new(config.max_loaded_segments);
        Self {
            config,
            table,
            cache: SegmentCache::new(),
            events,
            persistence,
            initialized: AtomicBool::new(false),
            next_ctx: AtomicU32::new(0),
        }
    }

    /// Prepares the persistence collaborator and, unless `clear` is set,
    /// loads the persisted segment image.
    pub fn initialize(&self, clear: bool) -> Result<()> {
        if self.is_initialized() {
            return Err(StoreError::AlreadyInitialized);
        }
        self.persistence.initialize(&self.config.path, clear)?;
        if !clear {
            for image in self.persistence.read_segments()? {
                let seg = Arc::new(Segment::from_image(image)?);
                self.table.install(seg)?;
            }
        }
        self.initialized.store(true, Ordering::Release);
        info!(
            path = %self.config.path.display(),
            segments = self.table.count(),
            "element store initialized"
        );
        Ok(())
    }

    /// Final write-out. When `save_state` is set, the full segment image
    /// is snapshotted and handed to the persistence collaborator.
    pub fn shutdown(self, save_state: bool) -> Result<()> {
        if !self.is_initialized() {
            return Err(StoreError::NotInitialized);
        }
        let images = if save_state {
            self.table.iter_published().map(|seg| seg.snapshot()).collect()
        } else {
            Vec::new()
        };
        self.persistence.shutdown(images, save_state)?;
        info!(segments = self.table.count(), "element store shut down");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Allocates a caller context with a fresh id.
    pub fn create_context(&self) -> MemoryContext {
        MemoryContext::new(self.next_ctx.fetch_add(1, Ordering::Relaxed))
    }

    /// Number of reserved segments.
    pub fn segments_count(&self) -> u32 {
        self.table.count()
    }

    /// True when `addr` names a live (non-empty) element.
    pub fn is_element(&self, addr: Addr) -> bool {
        match self.lock_slot(addr) {
            Ok(guard) => !guard.get().kind.is_empty(),
            Err(_) => false,
        }
    }

    // ------------------------------------------------------------------
    // Creation
    // ------------------------------------------------------------------

    /// Creates a node element. `subtype` must not carry connector-class
    /// bits. No events are emitted. Capacity exhaustion surfaces as
    /// `StoreError::Capacity`.
    pub fn create_node(&self, ctx: &MemoryContext, subtype: ElementType) -> Result<Addr> {
        if subtype.intersects(ElementType::CONNECTOR_MASK) {
            return Err(StoreError::InvalidParams(
                "node subtype must not carry a connector class",
            ));
        }
        let (addr, _slot) = self.alloc_element(ctx, Element::node(ElementType::NODE | subtype))?;
        Ok(addr)
    }

    /// Creates a link element with cleared content.
    pub fn create_link(&self, ctx: &MemoryContext) -> Result<Addr> {
        let (addr, _slot) = self.alloc_element(ctx, Element::link())?;
        Ok(addr)
    }

    /// Creates a connector from `begin` to `end` and weaves it into the
    /// heads of both endpoint lists.
    ///
    /// `kind` must not carry the node class; a kind without any connector
    /// class gets the common arc class OR-ed in. The new arc address is
    /// published in `begin.first_out` and `end.first_in` before any lock
    /// is released, and `add_output_arc`/`add_input_arc` fire under those
    /// locks.
    pub fn create_arc(
        &self,
        ctx: &MemoryContext,
        kind: ElementType,
        begin: Addr,
        end: Addr,
    ) -> Result<Addr> {
        if kind.intersects(ElementType::NODE) {
            return Err(StoreError::InvalidParams(
                "connector kind must not carry the node class",
            ));
        }
        let kind = if kind.intersects(ElementType::CONNECTOR_MASK) {
            kind
        } else {
            ElementType::ARC | kind
        };

        loop {
            let mut held = GuardSet::new();

            let Some(bg) = self.try_lock_slot(begin)? else {
                std::thread::yield_now();
                continue;
            };
            let beg_el = bg.get();
            held.insert(bg);

            let end_el = if end == begin {
                beg_el
            } else {
                let Some(eg) = self.try_lock_slot(end)? else {
                    std::thread::yield_now();
                    continue;
                };
                let el = eg.get();
                held.insert(eg);
                el
            };

            if beg_el.kind.is_empty() || end_el.kind.is_empty() {
                return Err(StoreError::InvalidAddr);
            }

            // List heads are snapshotted under the endpoint locks; the
            // head arcs are then locked as well so their back-pointers
            // can be patched.
            let first_out = beg_el.first_out;
            let first_in = end_el.first_in;

            if !first_out.is_empty() && !held.contains(first_out) {
                let Some(g) = self.try_lock_slot(first_out)? else {
                    std::thread::yield_now();
                    continue;
                };
                held.insert(g);
            }
            if !first_in.is_empty() && !held.contains(first_in) {
                let Some(g) = self.try_lock_slot(first_in)? else {
                    std::thread::yield_now();
                    continue;
                };
                held.insert(g);
            }

            let mut el = Element::arc(kind, begin, end);
            el.arc.next_out = first_out;
            el.arc.next_in = first_in;
            let (addr, _slot) = self.alloc_element(ctx, el)?;

            if !first_out.is_empty() {
                if let Some(g) = held.get_mut(first_out) {
                    g.update(|n| n.arc.prev_out = addr);
                }
            }
            if !first_in.is_empty() {
                if let Some(g) = held.get_mut(first_in) {
                    g.update(|n| n.arc.prev_in = addr);
                }
            }
            if let Some(g) = held.get_mut(begin) {
                g.update(|b| b.first_out = addr);
            }
            if let Some(g) = held.get_mut(end) {
                g.update(|e| e.first_in = addr);
            }

            self.events.add_output_arc(begin, addr);
            self.events.add_input_arc(end, addr);
            return Ok(addr);
        }
    }

    // ------------------------------------------------------------------
    // Deletion
    // ------------------------------------------------------------------

    /// Recursively deletes `addr`: the element itself plus every arc
    /// transitively reachable through the incident arc lists.
    ///
    /// The full lock set is unknown until the closure has been walked,
    /// so acquisition runs in rounds: the candidate set is
    /// blocking-locked in ascending address order while nothing else is
    /// held, then the closure is re-walked under those locks, taking
    /// newly discovered slots with bounded try-locks only. A round that
    /// ends fully locked proceeds to erasure; any other round releases
    /// everything and relocks the enlarged set. Blocking waits therefore
    /// only ever happen in ascending address order, so overlapping
    /// deletions cannot deadlock. Deletion events fire per element while
    /// its slot still holds the pre-erasure state.
    pub fn free(&self, ctx: &MemoryContext, addr: Addr) -> Result<()> {
        let mut want: Vec<Addr> = vec![addr];
        loop {
            let mut locked: FxHashMap<u32, SlotGuard> = FxHashMap::default();
            for a in &want {
                locked.insert(a.raw(), self.lock_slot(*a)?);
            }
            match locked.get(&addr.raw()) {
                Some(g) if !g.get().kind.is_empty() => {}
                _ => return Err(StoreError::InvalidAddr),
            }

            let walk = self.walk_closure(addr, &mut locked)?;
            if walk.complete {
                self.erase_closure(ctx, &walk.order, &mut locked);
                return Ok(());
            }

            let mut next = walk.required;
            next.sort_unstable();
            next.dedup();
            want = next;
        }
    }

    /// One walk of the deletion closure under the currently held locks.
    ///
    /// Doomed elements are discovered by chasing `first_out`/`first_in`
    /// chains; for every doomed connector the endpoints and list
    /// siblings are required as well, since their pointers get patched.
    /// Slots not yet locked are taken opportunistically with a bounded
    /// try-lock; when one stays busy the walk is reported incomplete and
    /// `required` carries the set the next round must lock up front.
    fn walk_closure(
        &self,
        root: Addr,
        locked: &mut FxHashMap<u32, SlotGuard>,
    ) -> Result<ClosureWalk> {
        let mut walk = ClosureWalk {
            complete: true,
            order: vec![root],
            required: vec![root],
        };
        let mut doomed: FxHashSet<u32> = FxHashSet::default();
        let mut required: FxHashSet<u32> = FxHashSet::default();
        let mut queue: VecDeque<Addr> = VecDeque::new();
        doomed.insert(root.raw());
        required.insert(root.raw());
        queue.push_back(root);

        while let Some(a) = queue.pop_front() {
            let el = match locked.get(&a.raw()) {
                Some(g) => g.get(),
                None => continue,
            };

            if el.kind.is_connector() {
                for n in [
                    el.arc.begin,
                    el.arc.end,
                    el.arc.prev_out,
                    el.arc.next_out,
                    el.arc.prev_in,
                    el.arc.next_in,
                ] {
                    if n.is_empty() {
                        continue;
                    }
                    if required.insert(n.raw()) {
                        walk.required.push(n);
                    }
                    if !locked.contains_key(&n.raw()) {
                        match self.try_lock_slot(n)? {
                            Some(g) => {
                                locked.insert(n.raw(), g);
                            }
                            None => walk.complete = false,
                        }
                    }
                }
            }

            let mut cur = el.first_out;
            while !cur.is_empty() {
                if required.insert(cur.raw()) {
                    walk.required.push(cur);
                }
                if !locked.contains_key(&cur.raw()) {
                    match self.try_lock_slot(cur)? {
                        Some(g) => {
                            locked.insert(cur.raw(), g);
                        }
                        None => {
                            walk.complete = false;
                            break;
                        }
                    }
                }
                if doomed.insert(cur.raw()) {
                    walk.order.push(cur);
                    queue.push_back(cur);
                }
                cur = match locked.get(&cur.raw()) {
                    Some(g) => g.get().arc.next_out,
                    None => Addr::EMPTY,
                };
            }

            let mut cur = el.first_in;
            while !cur.is_empty() {
                if required.insert(cur.raw()) {
                    walk.required.push(cur);
                }
                if !locked.contains_key(&cur.raw()) {
                    match self.try_lock_slot(cur)? {
                        Some(g) => {
                            locked.insert(cur.raw(), g);
                        }
                        None => {
                            walk.complete = false;
                            break;
                        }
                    }
                }
                if doomed.insert(cur.raw()) {
                    walk.order.push(cur);
                    queue.push_back(cur);
                }
                cur = match locked.get(&cur.raw()) {
                    Some(g) => g.get().arc.next_in,
                    None => Addr::EMPTY,
                };
            }
        }

        Ok(walk)
    }

    /// Splices every doomed arc out of both lists, then zeroes the
    /// slots. Every address touched here is present in `locked`;
    /// re-reading through the guard picks up splices made for earlier
    /// elements of the same closure.
    fn erase_closure(
        &self,
        ctx: &MemoryContext,
        order: &[Addr],
        locked: &mut FxHashMap<u32, SlotGuard>,
    ) {
        for &a in order {
            let el = match locked.get(&a.raw()) {
                Some(g) => g.get(),
                None => continue,
            };

            self.events.element_deleted(a);

            if el.kind.is_connector() {
                self.events.remove_output_arc(el.arc.begin, a);
                self.events.remove_input_arc(el.arc.end, a);

                if !el.arc.prev_out.is_empty() {
                    if let Some(g) = locked.get_mut(&el.arc.prev_out.raw()) {
                        g.update(|p| p.arc.next_out = el.arc.next_out);
                    }
                }
                if !el.arc.next_out.is_empty() {
                    if let Some(g) = locked.get_mut(&el.arc.next_out.raw()) {
                        g.update(|n| n.arc.prev_out = el.arc.prev_out);
                    }
                }
                if let Some(g) = locked.get_mut(&el.arc.begin.raw()) {
                    if g.get().first_out == a {
                        g.update(|b| b.first_out = el.arc.next_out);
                    }
                }

                if !el.arc.prev_in.is_empty() {
                    if let Some(g) = locked.get_mut(&el.arc.prev_in.raw()) {
                        g.update(|p| p.arc.next_in = el.arc.next_in);
                    }
                }
                if !el.arc.next_in.is_empty() {
                    if let Some(g) = locked.get_mut(&el.arc.next_in.raw()) {
                        g.update(|n| n.arc.prev_in = el.arc.prev_in);
                    }
                }
                if let Some(g) = locked.get_mut(&el.arc.end.raw()) {
                    if g.get().first_in == a {
                        g.update(|e| e.first_in = el.arc.next_in);
                    }
                }
            }

            self.events.element_removed(a);
            if let Some(g) = locked.get_mut(&a.raw()) {
                g.erase();
            }
            self.cache.append(ctx, a.seg);
        }
    }

    // ------------------------------------------------------------------
    // Reads and field updates
    // ------------------------------------------------------------------

    /// The composed type of the element at `addr`.
    pub fn element_type(&self, addr: Addr) -> Result<ElementType> {
        Ok(self.lock_slot(addr)?.get().kind)
    }

    /// Overwrites the subtype bits of the element at `addr`, keeping its
    /// class bits. `subtype` must not carry class bits.
    pub fn change_subtype(&self, addr: Addr, subtype: ElementType) -> Result<()> {
        if subtype.intersects(ElementType::CLASS_MASK) {
            return Err(StoreError::InvalidParams(
                "subtype must not carry class bits",
            ));
        }
        let mut guard = self.lock_slot(addr)?;
        if guard.get().kind.is_empty() {
            return Err(StoreError::InvalidAddr);
        }
        guard.update(|el| el.kind = el.kind.class() | subtype);
        Ok(())
    }

    /// The begin endpoint of the connector at `addr`.
    pub fn arc_begin(&self, addr: Addr) -> Result<Addr> {
        let el = self.lock_slot(addr)?.get();
        if !el.kind.is_connector() {
            return Err(StoreError::InvalidType);
        }
        Ok(el.arc.begin)
    }

    /// The end endpoint of the connector at `addr`.
    pub fn arc_end(&self, addr: Addr) -> Result<Addr> {
        let el = self.lock_slot(addr)?.get();
        if !el.kind.is_connector() {
            return Err(StoreError::InvalidType);
        }
        Ok(el.arc.end)
    }

    // ------------------------------------------------------------------
    // Link content
    // ------------------------------------------------------------------

    /// Stores `content` for the link at `addr`: the blob goes to the
    /// persistence collaborator, its checksum into the slot.
    pub fn set_link_content(&self, addr: Addr, content: &[u8]) -> Result<()> {
        let mut guard = self.lock_slot(addr)?;
        if !guard.get().kind.is_link() {
            return Err(StoreError::InvalidType);
        }
        let checksum = content_checksum(content);
        self.persistence.write_content(addr, checksum, content)?;
        guard.update(|el| el.checksum = checksum);
        Ok(())
    }

    /// Materializes the content of the link at `addr`. The checksum is
    /// copied out under the slot lock; the collaborator is consulted
    /// after the lock is released.
    pub fn link_content(&self, addr: Addr) -> Result<Vec<u8>> {
        let checksum = {
            let el = self.lock_slot(addr)?.get();
            if !el.kind.is_link() {
                return Err(StoreError::InvalidType);
            }
            el.checksum
        };
        self.persistence
            .content(checksum)?
            .ok_or(StoreError::NotFound)
    }

    /// Addresses of all links whose content equals `content`.
    pub fn find_links_with_content(&self, content: &[u8]) -> Result<Vec<Addr>> {
        self.persistence
            .links_with_checksum(content_checksum(content))
    }

    // ------------------------------------------------------------------
    // Statistics and locking
    // ------------------------------------------------------------------

    /// Advisory element counts over all published segments.
    pub fn elements_stat(&self) -> ElementsStat {
        let mut stat = ElementsStat {
            segments_count: self.table.count(),
            ..ElementsStat::default()
        };
        for seg in self.table.iter_published() {
            seg.collect_stat(&mut stat);
        }
        stat
    }

    /// Blocking scoped acquisition of the slot lock at `addr`. The lock
    /// releases when the returned guard drops.
    pub fn lock(&self, addr: Addr) -> Result<ElementGuard> {
        Ok(ElementGuard {
            inner: self.lock_slot(addr)?,
        })
    }

    /// Bounded scoped acquisition; `Ok(None)` means the slot stayed busy
    /// for the configured attempt budget.
    pub fn try_lock(&self, addr: Addr) -> Result<Option<ElementGuard>> {
        Ok(self
            .try_lock_slot(addr)?
            .map(|inner| ElementGuard { inner }))
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn resolve(&self, addr: Addr) -> Result<Arc<Segment>> {
        if addr.is_empty() || (addr.offset as usize) >= SEGMENT_CAPACITY {
            return Err(StoreError::InvalidAddr);
        }
        self.table.get(addr.seg).ok_or(StoreError::InvalidAddr)
    }

    fn lock_slot(&self, addr: Addr) -> Result<SlotGuard> {
        Ok(self.resolve(addr)?.lock(addr.offset))
    }

    fn try_lock_slot(&self, addr: Addr) -> Result<Option<SlotGuard>> {
        Ok(self
            .resolve(addr)?
            .try_lock(addr.offset, self.config.lock_attempts))
    }

    /// Claims an empty slot somewhere in the store and writes `element`
    /// into it. The returned guard still holds the slot lock.
    fn alloc_element(&self, ctx: &MemoryContext, element: Element) -> Result<(Addr, SlotGuard)> {
        loop {
            let Some(seg) = self.cache.get(ctx, &self.table) else {
                return Err(StoreError::Capacity);
            };
            if let Some(mut guard) = seg.lock_empty() {
                guard.set(element);
                return Ok((guard.addr(), guard));
            }
            // The cached segment filled up concurrently; forget it and
            // try another.
            self.cache.remove(ctx, seg.id());
        }
    }
}

/// Outcome of one deletion-closure walk.
struct ClosureWalk {
    /// Every required slot ended up locked; the closure can be erased.
    complete: bool,
    /// Doomed elements in discovery order.
    order: Vec<Addr>,
    /// Everything the closure needs locked: the doomed elements plus the
    /// neighbors whose pointers get patched.
    required: Vec<Addr>,
}

/// Small set of held slot guards keyed by address, used by the bounded
/// arc-creation protocol. Dropping the set releases every held lock.
struct GuardSet {
    guards: SmallVec<[(u32, SlotGuard); 4]>,
}

impl GuardSet {
    fn new() -> Self {
        Self {
            guards: SmallVec::new(),
        }
    }

    fn contains(&self, addr: Addr) -> bool {
        self.guards.iter().any(|(raw, _)| *raw == addr.raw())
    }

    fn insert(&mut self, guard: SlotGuard) {
        self.guards.push((guard.addr().raw(), guard));
    }

    fn get_mut(&mut self, addr: Addr) -> Option<&mut SlotGuard> {
        self.guards
            .iter_mut()
            .find(|(raw, _)| *raw == addr.raw())
            .map(|(_, g)| g)
    }
}
