//! Copy-on-write B+tree over a page store.
//!
//! # Structure
//!
//! - `codec`: the binary page layout, decoding views and page builders
//! - `node`: pure operations on one or two nodes (lookup, insert, delete,
//!   split, merge)
//! - `tree`: the engine that owns the root reference and drives
//!   copy-on-write descent, commit and release
//!
//! Keys and values are arbitrary byte strings of at most `MAX_KEY_SIZE` and
//! `MAX_VAL_SIZE` bytes. Internal nodes route with the first key of each
//! child, so a lookup follows the largest key not greater than the target.
//!
//! # Usage
//!
//! ```
//! use cowtree::btree::BTree;
//! use cowtree::config::TreeConfig;
//! use cowtree::storage::MemoryStore;
//!
//! let tree = BTree::create(MemoryStore::new(), TreeConfig::default()).unwrap();
//! tree.insert(b"a", b"1").unwrap();
//! tree.insert(b"m", b"2").unwrap();
//!
//! assert_eq!(tree.get(b"m").unwrap(), Some(b"2".to_vec()));
//! assert!(tree.delete(b"m").unwrap());
//! assert_eq!(tree.get(b"m").unwrap(), None);
//! ```

pub mod codec;
mod iter;
pub mod node;
mod tree;
mod verify;

pub use codec::{CodecError, MAX_KEY_SIZE, MAX_VAL_SIZE, NodeType, PageBuilder, PageView};
pub use iter::BTreeIterator;
pub use node::{MergeResult, SearchResult};
pub use tree::{BTree, BTreeError};
pub use verify::TreeStats;
