//! Structural verification of a whole tree.
//!
//! `check_invariants` walks every page reachable from the current root and
//! checks what the engine promises after each successful mutation:
//!
//! - Every page decodes and its encoded size fits in the page size
//! - No page is reachable twice
//! - Keys are strictly ascending within a page and fall inside the range the
//!   parent routes to that page
//! - An internal key equals the first key of its child
//! - Non-root pages are non-empty
//! - All leaves are at the same depth
//! - The root is never an internal page with a single child

use std::collections::HashSet;

use crate::btree::codec::NodeType;
use crate::btree::node::is_underfull;
use crate::btree::tree::{BTree, BTreeError, MAX_DEPTH};
use crate::storage::{PageRef, PageStore};

/// Shape of a verified tree.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TreeStats {
    /// Number of levels, 1 for a single leaf root.
    pub height: usize,
    pub internal_pages: usize,
    pub leaf_pages: usize,
    /// Number of key/value records in the leaves.
    pub keys: usize,
    /// Non-root pages below the occupancy threshold.
    pub underfull_pages: usize,
    /// Largest encoded page size seen.
    pub max_page_bytes: usize,
}

impl TreeStats {
    /// Total number of pages in the tree.
    #[must_use]
    pub const fn pages(&self) -> usize {
        self.internal_pages + self.leaf_pages
    }
}

struct Walk<'t, S: PageStore> {
    tree: &'t BTree<S>,
    seen: HashSet<PageRef>,
    leaf_depth: Option<usize>,
    stats: TreeStats,
}

fn violation(page_ref: PageRef, reason: String) -> BTreeError {
    tracing::error!(%page_ref, %reason, "tree invariant violated");
    BTreeError::CorruptPage { page_ref, reason }
}

impl<S: PageStore> Walk<'_, S> {
    /// Verify the subtree at `page_ref`. `first_key` is the parent's key for
    /// this page and `upper` the parent's next key, if any.
    fn visit(
        &mut self,
        page_ref: PageRef,
        depth: usize,
        first_key: Option<&[u8]>,
        upper: Option<&[u8]>,
    ) -> Result<(), BTreeError> {
        if depth >= MAX_DEPTH {
            return Err(violation(page_ref, format!("deeper than {MAX_DEPTH} levels")));
        }
        if !self.seen.insert(page_ref) {
            return Err(violation(page_ref, "page reachable twice".to_string()));
        }

        let page = self.tree.read_page(page_ref)?;
        let view = self.tree.decode(page_ref, &page)?;
        let n = view.key_count();
        let is_root = depth == 0;

        self.stats.max_page_bytes = self.stats.max_page_bytes.max(view.encoded_size());
        if !is_root && is_underfull(view.encoded_size(), self.tree.config()) {
            self.stats.underfull_pages += 1;
        }

        if n == 0 && !is_root {
            return Err(violation(page_ref, "empty non-root page".to_string()));
        }
        if let Some(expected) = first_key {
            if view.key_at(0)? != expected {
                return Err(violation(
                    page_ref,
                    "first key differs from the parent key".to_string(),
                ));
            }
        }
        if let Some(upper) = upper {
            if n > 0 && view.key_at(n - 1)? >= upper {
                return Err(violation(
                    page_ref,
                    "last key is not below the next parent key".to_string(),
                ));
            }
        }

        match view.node_type() {
            NodeType::Leaf => {
                self.stats.leaf_pages += 1;
                self.stats.keys += usize::from(n);
                match self.leaf_depth {
                    None => self.leaf_depth = Some(depth),
                    Some(d) if d != depth => {
                        return Err(violation(
                            page_ref,
                            format!("leaf at depth {depth}, others at depth {d}"),
                        ));
                    }
                    Some(_) => {}
                }
            }
            NodeType::Internal => {
                self.stats.internal_pages += 1;
                if is_root && n == 1 {
                    return Err(violation(
                        page_ref,
                        "internal root with a single child".to_string(),
                    ));
                }
                for i in 0..n {
                    let child = view.child_ref(i)?;
                    let key = view.key_at(i)?;
                    let next = if i + 1 < n {
                        Some(view.key_at(i + 1)?)
                    } else {
                        upper
                    };
                    self.visit(child, depth + 1, Some(key), next)?;
                }
            }
        }

        Ok(())
    }
}

impl<S: PageStore> BTree<S> {
    /// Walk the whole tree and verify its structural invariants.
    ///
    /// # Errors
    ///
    /// Returns `CorruptPage` naming the first page that breaks an invariant,
    /// or any error raised while reading pages.
    pub fn check_invariants(&self) -> Result<TreeStats, BTreeError> {
        let mut walk = Walk {
            tree: self,
            seen: HashSet::new(),
            leaf_depth: None,
            stats: TreeStats::default(),
        };
        walk.visit(self.root(), 0, None, None)?;

        let mut stats = walk.stats;
        stats.height = walk.leaf_depth.map_or(0, |d| d + 1);
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::codec::{PageBuilder, Payload};
    use crate::config::TreeConfig;
    use crate::storage::{MemoryStore, Page};
    use crate::testing::init_tracing;

    fn new_tree() -> BTree<MemoryStore> {
        init_tracing();
        BTree::create(MemoryStore::new(), TreeConfig::default()).expect("create")
    }

    fn internal_page(entries: &[(&[u8], PageRef)]) -> Page {
        let count = u16::try_from(entries.len()).expect("count");
        let mut builder = PageBuilder::new(NodeType::Internal, count);
        for (key, child) in entries {
            builder
                .append_record(key, Payload::Child(*child))
                .expect("append");
        }
        Page::from_encoded(builder.finish().expect("finish"), 4096).expect("page")
    }

    fn leaf_page(keys: &[&[u8]]) -> Page {
        let count = u16::try_from(keys.len()).expect("count");
        let mut builder = PageBuilder::new(NodeType::Leaf, count);
        for key in keys {
            builder
                .append_record(key, Payload::Value(b"v"))
                .expect("append");
        }
        Page::from_encoded(builder.finish().expect("finish"), 4096).expect("page")
    }

    #[test]
    fn test_stats_of_single_leaf() {
        let tree = new_tree();
        tree.insert(b"a", b"1").expect("insert");

        let stats = tree.check_invariants().expect("invariants");
        assert_eq!(stats.height, 1);
        assert_eq!(stats.leaf_pages, 1);
        assert_eq!(stats.internal_pages, 0);
        assert_eq!(stats.keys, 1);
        assert_eq!(stats.underfull_pages, 0);
    }

    #[test]
    fn test_stats_of_grown_tree() {
        let tree = new_tree();
        for i in 0..400 {
            tree.insert(format!("key{i:04}").as_bytes(), &[b'v'; 80])
                .expect("insert");
        }

        let stats = tree.check_invariants().expect("invariants");
        assert_eq!(stats.height, 2);
        assert_eq!(stats.internal_pages, 1);
        assert!(stats.leaf_pages > 1);
        assert_eq!(stats.keys, 400);
        assert!(stats.max_page_bytes <= 4096);
    }

    #[test]
    fn test_detects_wrong_parent_key() {
        init_tracing();
        let store = MemoryStore::new();
        let left = store.allocate(leaf_page(&[b"a", b"b"])).expect("allocate");
        let right = store.allocate(leaf_page(&[b"m", b"n"])).expect("allocate");
        let root = store
            .allocate(internal_page(&[(b"a", left), (b"k", right)]))
            .expect("allocate");

        let tree = BTree::open(store, TreeConfig::default(), root).expect("open");
        let err = tree.check_invariants().expect_err("should fail");
        assert!(matches!(err, BTreeError::CorruptPage { page_ref, .. } if page_ref == right));
    }

    #[test]
    fn test_detects_key_outside_parent_range() {
        init_tracing();
        let store = MemoryStore::new();
        let left = store.allocate(leaf_page(&[b"a", b"x"])).expect("allocate");
        let right = store.allocate(leaf_page(&[b"m", b"n"])).expect("allocate");
        let root = store
            .allocate(internal_page(&[(b"a", left), (b"m", right)]))
            .expect("allocate");

        let tree = BTree::open(store, TreeConfig::default(), root).expect("open");
        let err = tree.check_invariants().expect_err("should fail");
        assert!(matches!(err, BTreeError::CorruptPage { page_ref, .. } if page_ref == left));
    }

    #[test]
    fn test_detects_shared_page() {
        init_tracing();
        let store = MemoryStore::new();
        let leaf = store.allocate(leaf_page(&[b"a"])).expect("allocate");
        let root = store
            .allocate(internal_page(&[(b"a", leaf), (b"b", leaf)]))
            .expect("allocate");

        let tree = BTree::open(store, TreeConfig::default(), root).expect("open");
        assert!(tree.check_invariants().is_err());
    }

    #[test]
    fn test_detects_single_child_root() {
        init_tracing();
        let store = MemoryStore::new();
        let leaf = store.allocate(leaf_page(&[b"a"])).expect("allocate");
        let root = store
            .allocate(internal_page(&[(b"a", leaf)]))
            .expect("allocate");

        let tree = BTree::open(store, TreeConfig::default(), root).expect("open");
        let err = tree.check_invariants().expect_err("should fail");
        assert!(err.to_string().contains("single child"));
    }

    #[test]
    fn test_detects_uneven_leaf_depth() {
        init_tracing();
        let store = MemoryStore::new();
        let a = store.allocate(leaf_page(&[b"a"])).expect("allocate");
        let b = store.allocate(leaf_page(&[b"b"])).expect("allocate");
        let c = store.allocate(leaf_page(&[b"c"])).expect("allocate");
        let inner = store
            .allocate(internal_page(&[(b"b", b), (b"c", c)]))
            .expect("allocate");
        let root = store
            .allocate(internal_page(&[(b"a", a), (b"b", inner)]))
            .expect("allocate");

        let tree = BTree::open(store, TreeConfig::default(), root).expect("open");
        let err = tree.check_invariants().expect_err("should fail");
        assert!(err.to_string().contains("depth"));
    }
}
