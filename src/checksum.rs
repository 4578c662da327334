//! Link content checksums.
//!
//! Link slots do not hold their content; they hold a fixed-length checksum
//! of the blob stored by the persistence collaborator. The checksum is the
//! content's identity for lookup and deduplication.

use std::fmt;

use xxhash_rust::xxh3::xxh3_128;

/// Length of a content checksum in bytes.
pub const CHECKSUM_LEN: usize = 16;

/// Fixed-length checksum of a link content blob.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Default)]
pub struct Checksum([u8; CHECKSUM_LEN]);

impl Checksum {
    #[inline]
    pub const fn from_bytes(bytes: [u8; CHECKSUM_LEN]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub const fn as_bytes(&self) -> &[u8; CHECKSUM_LEN] {
        &self.0
    }

    /// True for the all-zero checksum a fresh link carries before any
    /// content has been set.
    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; CHECKSUM_LEN]
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum(")?;
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

/// Computes the checksum of a content blob.
pub fn content_checksum(content: &[u8]) -> Checksum {
    Checksum(xxh3_128(content).to_be_bytes())
}
