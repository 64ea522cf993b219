//! Page buffers and page references.
//!
//! A page is the fundamental unit handed to and returned from a page store.
//! Pages are immutable once built: the tree never writes into a page that a
//! store has already accepted, it builds a replacement instead.

use std::sync::Arc;

/// Default page size in bytes (4KB).
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// An opaque reference to a page held by a page store.
///
/// References are lookup keys, not addresses. No arithmetic is defined on
/// them; two references are only ever compared for equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageRef(u64);

impl PageRef {
    /// Wrap a raw reference value.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw reference value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Encode the reference as it is stored in a page (little-endian).
    #[must_use]
    pub const fn to_le_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    /// Decode a reference stored in a page.
    #[must_use]
    pub const fn from_le_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_le_bytes(bytes))
    }
}

impl std::fmt::Display for PageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An immutable page buffer.
///
/// Cloning a page is cheap: the bytes are shared, which lets readers keep a
/// page alive while the writer publishes newer versions of the tree.
#[derive(Clone, PartialEq, Eq)]
pub struct Page {
    data: Arc<[u8]>,
}

impl Page {
    /// Create a page from raw bytes exactly as they were stored.
    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { data: bytes.into() }
    }

    /// Create a `page_size` page from encoded node bytes, zero-padding the tail.
    ///
    /// # Errors
    ///
    /// Returns `PageError::Oversized` if the encoded bytes do not fit.
    pub fn from_encoded(mut encoded: Vec<u8>, page_size: usize) -> Result<Self, PageError> {
        if encoded.len() > page_size {
            return Err(PageError::Oversized {
                len: encoded.len(),
                page_size,
            });
        }
        encoded.resize(page_size, 0);
        Ok(Self::from_bytes(encoded))
    }

    /// Get the raw page data.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Length of the page buffer in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the buffer is empty (never true for a page built by the tree).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Compute the CRC32 checksum of the page data.
    #[must_use]
    pub fn compute_checksum(&self) -> u32 {
        crc32fast::hash(&self.data)
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shown = self.data.len().min(16);
        f.debug_struct("Page")
            .field("len", &self.data.len())
            .field("first_16_bytes", &&self.data[..shown])
            .finish_non_exhaustive()
    }
}

/// Errors related to page construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageError {
    /// Encoded node bytes are longer than the page size.
    Oversized { len: usize, page_size: usize },
}

impl std::fmt::Display for PageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Oversized { len, page_size } => {
                write!(f, "encoded page of {len} bytes exceeds page size {page_size}")
            }
        }
    }
}

impl std::error::Error for PageError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_ref_le_roundtrip() {
        let page_ref = PageRef::new(0x0102_0304_0506_0708);
        let bytes = page_ref.to_le_bytes();
        assert_eq!(bytes[0], 0x08);
        assert_eq!(PageRef::from_le_bytes(bytes), page_ref);
        assert_eq!(page_ref.to_string(), format!("#{}", 0x0102_0304_0506_0708_u64));
    }

    #[test]
    fn test_from_encoded_pads_to_page_size() {
        let page = Page::from_encoded(vec![2, 0, 0, 0], 64).expect("should fit");
        assert_eq!(page.len(), 64);
        assert_eq!(&page.as_bytes()[..4], &[2, 0, 0, 0]);
        assert!(page.as_bytes()[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_from_encoded_rejects_oversized() {
        let err = Page::from_encoded(vec![0; 65], 64).expect_err("should not fit");
        assert_eq!(
            err,
            PageError::Oversized {
                len: 65,
                page_size: 64
            }
        );
        assert!(err.to_string().contains("65 bytes"));
    }

    #[test]
    fn test_checksum_detects_change() {
        let a = Page::from_bytes(vec![1, 2, 3, 4]);
        let b = Page::from_bytes(vec![1, 2, 3, 5]);
        assert_ne!(a.compute_checksum(), b.compute_checksum());
        assert_eq!(a.compute_checksum(), a.clone().compute_checksum());
    }
}
