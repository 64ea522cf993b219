// Life of a write:
// 1. Descend from the current root, reading pages through the store
// 2. Rebuild the touched path bottom-up into fresh pages
//    (split what overflows, merge or rebalance what underflows)
// 3. Publish the new root under the writer lock
// 4. Release the pages the old path occupied
//
// Readers load the root once and never see a partial write.
//
// Components:
//  - storage: page store trait with memory and file backends
//  - btree: page codec, node operations and the tree engine
//  - simulation: seeded fault injection and model checking

pub mod btree;
pub mod config;
pub mod simulation;
pub mod storage;

#[cfg(test)]
mod testing;

pub use btree::{BTree, BTreeError, BTreeIterator, TreeStats};
pub use config::{ConfigError, TreeConfig};
pub use storage::{FileStore, MemoryStore, Page, PageRef, PageStore, StoreError};
