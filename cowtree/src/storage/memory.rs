//! In-memory page store.
//!
//! Pages live in a `HashMap` keyed by reference. Every stored page carries a
//! CRC32 computed at allocation time and verified on each dereference, so a
//! page that was altered after allocation is reported as corrupt instead of
//! being decoded.
//!
//! # Design
//!
//! - References are handed out from a monotonically increasing counter and are
//!   never reused, starting at 1
//! - Thread-safe: pages sit behind an `RwLock`, counters are atomics
//! - Optional capacity: allocation fails once `capacity` pages are live
//! - Optional deferred reclamation: `release` only queues the reference and
//!   `reclaim` frees queued pages once the caller knows no reader needs them
//!
//! # Invariants
//!
//! - `live_pages() + pending_release() == pages.len()`
//! - A reference is never live twice

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::storage::io::{PageStore, StoreError};
use crate::storage::page::{Page, PageRef};

/// A stored page and the checksum it had when it was allocated.
#[derive(Debug)]
struct StoredPage {
    page: Page,
    checksum: u32,
}

#[derive(Debug, Default)]
struct MemoryInner {
    pages: HashMap<PageRef, StoredPage>,
    /// Released references waiting for `reclaim` (deferred mode only).
    pending: HashSet<PageRef>,
    next_ref: u64,
}

/// Statistics about memory store operations.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MemoryStoreStats {
    /// Number of dereferences.
    pub dereferences: u64,
    /// Number of successful allocations.
    pub allocations: u64,
    /// Number of release calls.
    pub releases: u64,
    /// Number of dereferences that failed the checksum.
    pub corrupt_reads: u64,
}

#[derive(Debug, Default)]
struct Counters {
    dereferences: AtomicU64,
    allocations: AtomicU64,
    releases: AtomicU64,
    corrupt_reads: AtomicU64,
}

/// An in-memory `PageStore`.
#[derive(Debug)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
    /// Maximum number of stored pages, if bounded.
    capacity: Option<u64>,
    /// Whether `release` defers freeing until `reclaim`.
    deferred_release: bool,
    counters: Counters,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an unbounded store that frees pages as soon as they are released.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryInner {
                next_ref: 1,
                ..MemoryInner::default()
            }),
            capacity: None,
            deferred_release: false,
            counters: Counters::default(),
        }
    }

    /// Create a store that refuses to hold more than `capacity` pages.
    ///
    /// Pages awaiting deferred reclamation count against the capacity.
    #[must_use]
    pub fn with_capacity(capacity: u64) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::new()
        }
    }

    /// Switch to deferred reclamation: released pages stay readable until
    /// `reclaim` is called.
    #[must_use]
    pub const fn with_deferred_release(mut self) -> Self {
        self.deferred_release = true;
        self
    }

    #[allow(clippy::expect_used)] // Lock poisoning indicates unrecoverable state
    fn read_inner(&self) -> std::sync::RwLockReadGuard<'_, MemoryInner> {
        self.inner.read().expect("lock poisoned")
    }

    #[allow(clippy::expect_used)] // Lock poisoning indicates unrecoverable state
    fn write_inner(&self) -> std::sync::RwLockWriteGuard<'_, MemoryInner> {
        self.inner.write().expect("lock poisoned")
    }

    /// Free every page whose release was deferred.
    ///
    /// Returns the number of pages freed.
    pub fn reclaim(&self) -> usize {
        let mut inner = self.write_inner();
        let pending = std::mem::take(&mut inner.pending);
        for page_ref in &pending {
            inner.pages.remove(page_ref);
        }
        if !pending.is_empty() {
            tracing::debug!(freed = pending.len(), "reclaimed released pages");
        }
        pending.len()
    }

    /// Number of pages that are allocated and not released.
    #[must_use]
    pub fn live_pages(&self) -> usize {
        let inner = self.read_inner();
        inner.pages.len() - inner.pending.len()
    }

    /// Number of released pages still held for deferred reclamation.
    #[must_use]
    pub fn pending_release(&self) -> usize {
        self.read_inner().pending.len()
    }

    /// Whether `page_ref` names a live (allocated, unreleased) page.
    #[must_use]
    pub fn contains(&self, page_ref: PageRef) -> bool {
        let inner = self.read_inner();
        inner.pages.contains_key(&page_ref) && !inner.pending.contains(&page_ref)
    }

    /// All live references in ascending order.
    #[must_use]
    pub fn live_refs(&self) -> Vec<PageRef> {
        let inner = self.read_inner();
        let mut refs: Vec<PageRef> = inner
            .pages
            .keys()
            .filter(|r| !inner.pending.contains(r))
            .copied()
            .collect();
        refs.sort_unstable();
        refs
    }

    /// Get the current statistics.
    #[must_use]
    pub fn stats(&self) -> MemoryStoreStats {
        MemoryStoreStats {
            dereferences: self.counters.dereferences.load(Ordering::Relaxed),
            allocations: self.counters.allocations.load(Ordering::Relaxed),
            releases: self.counters.releases.load(Ordering::Relaxed),
            corrupt_reads: self.counters.corrupt_reads.load(Ordering::Relaxed),
        }
    }

    /// Flip one byte of a stored page without updating its checksum.
    ///
    /// Fault-injection hook: the next dereference of `page_ref` reports
    /// corruption. Returns `false` if the page does not exist.
    pub fn corrupt_page(&self, page_ref: PageRef, offset: usize) -> bool {
        let mut inner = self.write_inner();
        let Some(stored) = inner.pages.get_mut(&page_ref) else {
            return false;
        };
        let mut bytes = stored.page.as_bytes().to_vec();
        if bytes.is_empty() {
            return false;
        }
        let offset = offset % bytes.len();
        bytes[offset] ^= 0xFF;
        stored.page = Page::from_bytes(bytes);
        true
    }

    /// Replace the bytes of a stored page and recompute its checksum.
    ///
    /// Fault-injection hook for pages that are well-formed at the storage
    /// level but structurally invalid as tree nodes.
    pub fn overwrite_page(&self, page_ref: PageRef, page: Page) -> bool {
        let mut inner = self.write_inner();
        let Some(stored) = inner.pages.get_mut(&page_ref) else {
            return false;
        };
        stored.checksum = page.compute_checksum();
        stored.page = page;
        true
    }
}

impl PageStore for MemoryStore {
    fn dereference(&self, page_ref: PageRef) -> Result<Page, StoreError> {
        self.counters.dereferences.fetch_add(1, Ordering::Relaxed);

        let inner = self.read_inner();
        let stored = inner
            .pages
            .get(&page_ref)
            .ok_or(StoreError::UnknownPage(page_ref))?;

        let actual = stored.page.compute_checksum();
        if actual != stored.checksum {
            self.counters.corrupt_reads.fetch_add(1, Ordering::Relaxed);
            return Err(StoreError::Corruption {
                page_ref,
                reason: format!(
                    "checksum mismatch: expected {:#010x}, got {actual:#010x}",
                    stored.checksum
                ),
            });
        }

        Ok(stored.page.clone())
    }

    fn allocate(&self, page: Page) -> Result<PageRef, StoreError> {
        let mut inner = self.write_inner();

        if let Some(capacity) = self.capacity {
            if inner.pages.len() as u64 >= capacity {
                return Err(StoreError::Full { capacity });
            }
        }

        let page_ref = PageRef::new(inner.next_ref);
        inner.next_ref += 1;
        let checksum = page.compute_checksum();
        inner.pages.insert(page_ref, StoredPage { page, checksum });

        self.counters.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(page_ref)
    }

    fn release(&self, page_ref: PageRef) {
        self.counters.releases.fetch_add(1, Ordering::Relaxed);

        let mut inner = self.write_inner();
        if !inner.pages.contains_key(&page_ref) || inner.pending.contains(&page_ref) {
            tracing::warn!(%page_ref, "release of a page that is not live");
            return;
        }

        if self.deferred_release {
            inner.pending.insert(page_ref);
        } else {
            inner.pages.remove(&page_ref);
        }
    }
}
