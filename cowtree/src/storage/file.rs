//! File-backed page store.
//!
//! The file is a flat array of `page_size` slots. Page reference `n` lives in
//! slot `n - 1`, so reference 0 is never handed out. Page bytes are written
//! exactly as the tree encoded them.
//!
//! Released slots go to an in-memory free list and are reused by later
//! allocations, lowest slot first. The free list and the current root
//! reference are not persisted here; a reopened store starts with an empty
//! free list and the caller supplies the root it recorded.
//!
//! A reused slot is overwritten in place, so a reader still walking an older
//! root would decode another version's page. Stores shared with concurrent
//! readers or long-lived iterators should use `with_deferred_release`:
//! released slots stay readable until `reclaim` moves them to the free list.

use std::collections::{BTreeSet, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

use crate::storage::io::{PageStore, StoreError};
use crate::storage::page::{Page, PageRef};

#[derive(Debug)]
struct FileInner {
    file: File,
    /// Number of slots in the file.
    total_slots: u64,
    /// Released slots available for reuse.
    free: BTreeSet<PageRef>,
    /// Released slots waiting for `reclaim` (deferred mode only).
    pending: HashSet<PageRef>,
}

impl FileInner {
    fn new(file: File, total_slots: u64) -> Self {
        Self {
            file,
            total_slots,
            free: BTreeSet::new(),
            pending: HashSet::new(),
        }
    }

    fn in_use(&self, page_ref: PageRef) -> bool {
        page_ref.get() != 0
            && page_ref.get() <= self.total_slots
            && !self.free.contains(&page_ref)
            && !self.pending.contains(&page_ref)
    }
}

/// A `PageStore` backed by a single file.
#[derive(Debug)]
pub struct FileStore {
    inner: Mutex<FileInner>,
    page_size: usize,
    /// Whether `release` defers reuse until `reclaim`.
    deferred_release: bool,
}

impl FileStore {
    /// Create a new, empty store file at the given path.
    ///
    /// Returns an error if the file already exists.
    pub fn create(path: &Path, page_size: usize) -> Result<Self, StoreError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;

        tracing::debug!(path = %path.display(), page_size, "created page file");

        Ok(Self {
            inner: Mutex::new(FileInner::new(file, 0)),
            page_size,
            deferred_release: false,
        })
    }

    /// Open an existing store file.
    pub fn open(path: &Path, page_size: usize) -> Result<Self, StoreError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        let len = file.metadata()?.len();
        let page_size_u64 = page_size as u64;
        if len % page_size_u64 != 0 {
            return Err(StoreError::InvalidPageSize {
                expected: page_size,
                actual: usize::try_from(len % page_size_u64).unwrap_or(usize::MAX),
            });
        }
        let total_slots = len / page_size_u64;

        tracing::debug!(path = %path.display(), total_slots, "opened page file");

        Ok(Self {
            inner: Mutex::new(FileInner::new(file, total_slots)),
            page_size,
            deferred_release: false,
        })
    }

    /// Switch to deferred reuse: released slots keep their bytes and stay
    /// readable until `reclaim` is called.
    #[must_use]
    pub const fn with_deferred_release(mut self) -> Self {
        self.deferred_release = true;
        self
    }

    /// Make every slot whose release was deferred available for reuse.
    ///
    /// Call once no reader can still hold a root older than the current one.
    /// Returns the number of slots reclaimed.
    pub fn reclaim(&self) -> usize {
        let mut inner = self.lock();
        let pending = std::mem::take(&mut inner.pending);
        let count = pending.len();
        inner.free.extend(pending);
        if count > 0 {
            tracing::debug!(reclaimed = count, "reclaimed released slots");
        }
        count
    }

    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    fn lock(&self) -> std::sync::MutexGuard<'_, FileInner> {
        self.inner.lock().expect("lock poisoned")
    }

    /// Page size in bytes.
    #[must_use]
    pub const fn page_size(&self) -> usize {
        self.page_size
    }

    /// Total number of slots in the file, free or not.
    #[must_use]
    pub fn total_slots(&self) -> u64 {
        self.lock().total_slots
    }

    /// Number of released slots waiting for reuse.
    #[must_use]
    pub fn free_slots(&self) -> usize {
        self.lock().free.len()
    }

    /// Number of released slots held back until `reclaim`.
    #[must_use]
    pub fn pending_release(&self) -> usize {
        self.lock().pending.len()
    }

    /// Sync all pending writes to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.lock().file.sync_all()?;
        Ok(())
    }

    fn slot_offset(&self, page_ref: PageRef) -> u64 {
        (page_ref.get() - 1) * self.page_size as u64
    }
}

fn write_slot(file: &mut File, offset: u64, page: &Page) -> std::io::Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(page.as_bytes())
}

impl PageStore for FileStore {
    fn dereference(&self, page_ref: PageRef) -> Result<Page, StoreError> {
        let mut inner = self.lock();
        // Pending slots are still intact and remain readable.
        if !inner.in_use(page_ref) && !inner.pending.contains(&page_ref) {
            return Err(StoreError::UnknownPage(page_ref));
        }

        let mut buf = vec![0u8; self.page_size];
        inner.file.seek(SeekFrom::Start(self.slot_offset(page_ref)))?;
        inner.file.read_exact(&mut buf)?;

        Ok(Page::from_bytes(buf))
    }

    fn allocate(&self, page: Page) -> Result<PageRef, StoreError> {
        if page.len() != self.page_size {
            return Err(StoreError::InvalidPageSize {
                expected: self.page_size,
                actual: page.len(),
            });
        }

        let mut inner = self.lock();
        let (page_ref, reused) = match inner.free.pop_first() {
            Some(page_ref) => (page_ref, true),
            None => (PageRef::new(inner.total_slots + 1), false),
        };

        let offset = self.slot_offset(page_ref);
        if let Err(e) = write_slot(&mut inner.file, offset, &page) {
            if reused {
                inner.free.insert(page_ref);
            }
            return Err(StoreError::Io(e));
        }

        if !reused {
            inner.total_slots += 1;
        }
        Ok(page_ref)
    }

    fn release(&self, page_ref: PageRef) {
        let mut inner = self.lock();
        if !inner.in_use(page_ref) {
            tracing::warn!(%page_ref, "release of a slot that is not in use");
            return;
        }
        if self.deferred_release {
            inner.pending.insert(page_ref);
        } else {
            inner.free.insert(page_ref);
        }
    }
}
