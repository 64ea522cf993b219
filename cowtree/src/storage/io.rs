//! Page store abstraction.
//!
//! This module provides the `PageStore` trait, the only boundary the B-tree
//! depends on. It lets the tree run against an in-memory map in tests, a
//! fault-injecting simulation, or a file, without code duplication.
//!
//! # Design
//!
//! The trait is a minimal capability interface with three operations:
//! - Dereference a page reference to its bytes
//! - Allocate a new page and obtain a fresh reference
//! - Release a reference that no longer belongs to the current tree version
//!
//! All methods take `&self`: stores synchronize internally so that readers
//! can dereference pages concurrently with a single writer.

use std::sync::Arc;

use crate::storage::page::{Page, PageRef};

/// Errors that can occur during page store operations.
#[derive(Debug)]
pub enum StoreError {
    /// I/O error.
    Io(std::io::Error),
    /// The reference does not name a live page.
    UnknownPage(PageRef),
    /// The stored bytes failed an integrity check.
    Corruption { page_ref: PageRef, reason: String },
    /// The store has no room for another page.
    Full { capacity: u64 },
    /// A page of the wrong size was handed to the store.
    InvalidPageSize { expected: usize, actual: usize },
    /// Injected fault for simulation.
    InjectedFault(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::UnknownPage(page_ref) => write!(f, "unknown page {page_ref}"),
            Self::Corruption { page_ref, reason } => {
                write!(f, "page {page_ref} is corrupt: {reason}")
            }
            Self::Full { capacity } => write!(f, "page store full ({capacity} pages)"),
            Self::InvalidPageSize { expected, actual } => {
                write!(f, "invalid page size: expected {expected} bytes, got {actual}")
            }
            Self::InjectedFault(msg) => write!(f, "injected fault: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Abstraction over copy-on-write page storage.
///
/// # Implementation Notes
///
/// Implementations must ensure:
/// - `dereference` returns exactly the bytes passed to the `allocate` call
///   that produced the reference, until that reference is released
/// - `allocate` never returns a reference that is still live
/// - `release` is best-effort: failures are logged by the store, not surfaced
/// - Reclamation timing is the store's responsibility. A store shared with
///   concurrent readers should defer reuse until no reader can still reach
///   the released page.
pub trait PageStore {
    /// Read the page behind a reference.
    fn dereference(&self, page_ref: PageRef) -> Result<Page, StoreError>;

    /// Store a new page and return its reference.
    fn allocate(&self, page: Page) -> Result<PageRef, StoreError>;

    /// Give a page back to the store.
    fn release(&self, page_ref: PageRef);
}

impl<S: PageStore + ?Sized> PageStore for Arc<S> {
    fn dereference(&self, page_ref: PageRef) -> Result<Page, StoreError> {
        (**self).dereference(page_ref)
    }

    fn allocate(&self, page: Page) -> Result<PageRef, StoreError> {
        (**self).allocate(page)
    }

    fn release(&self, page_ref: PageRef) {
        (**self).release(page_ref);
    }
}

impl<S: PageStore + ?Sized> PageStore for &S {
    fn dereference(&self, page_ref: PageRef) -> Result<Page, StoreError> {
        (**self).dereference(page_ref)
    }

    fn allocate(&self, page: Page) -> Result<PageRef, StoreError> {
        (**self).allocate(page)
    }

    fn release(&self, page_ref: PageRef) {
        (**self).release(page_ref);
    }
}
