//! Persistence collaborator interface.
//!
//! The store keeps elements in memory; durable storage of the segment
//! image and of link content blobs is delegated through this interface.
//! The store dictates only the exchange format: segment images form a
//! dense prefix of the fixed-capacity segment table.

use std::path::Path;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::addr::Addr;
use crate::checksum::Checksum;
use crate::element::Element;
use crate::error::Result;

/// Dense snapshot of one segment's elements.
#[derive(Clone, Debug)]
pub struct SegmentImage {
    pub id: u16,
    pub elements: Vec<Element>,
}

/// Durable storage for segment images and link content.
pub trait Persistence: Send + Sync {
    /// Prepares the backing store at `path`; `clear` discards any
    /// previous image.
    fn initialize(&self, path: &Path, clear: bool) -> Result<()>;

    /// Reads the persisted segment images, ordered by segment id.
    fn read_segments(&self) -> Result<Vec<SegmentImage>>;

    /// Final write-out. `images` is the live segment prefix; it is only
    /// meaningful when `save_state` is set.
    fn shutdown(&self, images: Vec<SegmentImage>, save_state: bool) -> Result<()>;

    /// Stores a content blob under its checksum on behalf of the link at
    /// `addr`.
    fn write_content(&self, addr: Addr, checksum: Checksum, content: &[u8]) -> Result<()>;

    /// Materializes the content blob stored under `checksum`.
    fn content(&self, checksum: Checksum) -> Result<Option<Vec<u8>>>;

    /// Addresses of all links whose content hashes to `checksum`.
    fn links_with_checksum(&self, checksum: Checksum) -> Result<Vec<Addr>>;
}

/// In-memory collaborator.
///
/// Backs the test suite and any embedder that does not need durability.
/// A saving shutdown followed by `read_segments` on the same value
/// round-trips the full element state.
#[derive(Default)]
pub struct MemPersistence {
    inner: Mutex<MemState>,
}

#[derive(Default)]
struct MemState {
    images: Vec<SegmentImage>,
    contents: FxHashMap<Checksum, Vec<u8>>,
    links: FxHashMap<Checksum, Vec<Addr>>,
    /// Current checksum per link, so an overwrite can drop the stale
    /// reverse mapping.
    by_addr: FxHashMap<Addr, Checksum>,
}

impl Persistence for MemPersistence {
    fn initialize(&self, _path: &Path, clear: bool) -> Result<()> {
        if clear {
            let mut state = self.inner.lock();
            state.images.clear();
            state.contents.clear();
            state.links.clear();
            state.by_addr.clear();
        }
        Ok(())
    }

    fn read_segments(&self) -> Result<Vec<SegmentImage>> {
        Ok(self.inner.lock().images.clone())
    }

    fn shutdown(&self, images: Vec<SegmentImage>, save_state: bool) -> Result<()> {
        if save_state {
            self.inner.lock().images = images;
        }
        Ok(())
    }

    fn write_content(&self, addr: Addr, checksum: Checksum, content: &[u8]) -> Result<()> {
        let mut state = self.inner.lock();
        if let Some(old) = state.by_addr.insert(addr, checksum) {
            if old != checksum {
                let now_empty = match state.links.get_mut(&old) {
                    Some(links) => {
                        links.retain(|a| *a != addr);
                        links.is_empty()
                    }
                    None => false,
                };
                if now_empty {
                    state.links.remove(&old);
                }
            }
        }
        state.contents.insert(checksum, content.to_vec());
        let links = state.links.entry(checksum).or_default();
        if !links.contains(&addr) {
            links.push(addr);
        }
        Ok(())
    }

    fn content(&self, checksum: Checksum) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.lock().contents.get(&checksum).cloned())
    }

    fn links_with_checksum(&self, checksum: Checksum) -> Result<Vec<Addr>> {
        Ok(self
            .inner
            .lock()
            .links
            .get(&checksum)
            .cloned()
            .unwrap_or_default())
    }
}
