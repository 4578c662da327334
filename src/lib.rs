pub mod addr;
pub mod checksum;
pub mod config;
pub mod element;
pub mod error;
pub mod events;
pub mod persist;
pub mod segment;
pub mod stats;
pub mod store;
pub mod types;

pub use crate::addr::Addr;
pub use crate::checksum::{content_checksum, Checksum, CHECKSUM_LEN};
pub use crate::config::StoreConfig;
pub use crate::element::{ArcLinks, Element};
pub use crate::error::{Result, StoreError};
pub use crate::events::{EventSink, NoopEvents};
pub use crate::persist::{MemPersistence, Persistence, SegmentImage};
pub use crate::segment::{Segment, SEGMENT_CAPACITY};
pub use crate::stats::ElementsStat;
pub use crate::store::{ElementGuard, MemoryContext, Storage};
pub use crate::types::ElementType;
