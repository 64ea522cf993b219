//! Page storage for the B-tree.
//!
//! The tree talks to storage only through the `PageStore` trait. This module
//! defines that trait, the page buffer and reference types it exchanges, and
//! two concrete stores:
//!
//! - `MemoryStore`: pages in a map, checksummed, optionally bounded, with
//!   optional deferred reclamation for concurrent readers
//! - `FileStore`: pages in fixed-size slots of a single file
//!
//! # Usage
//!
//! ```
//! use cowtree::storage::{MemoryStore, Page, PageStore};
//!
//! let store = MemoryStore::new();
//! let page_ref = store.allocate(Page::from_bytes(vec![2, 0, 0, 0])).unwrap();
//! assert_eq!(store.dereference(page_ref).unwrap().as_bytes(), &[2, 0, 0, 0]);
//! store.release(page_ref);
//! ```

mod file;
mod io;
mod memory;
mod page;

pub use file::FileStore;
pub use io::{PageStore, StoreError};
pub use memory::{MemoryStore, MemoryStoreStats};
pub use page::{DEFAULT_PAGE_SIZE, Page, PageError, PageRef};
