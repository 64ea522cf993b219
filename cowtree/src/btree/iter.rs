//! Ordered iteration over a tree snapshot.
//!
//! Copy-on-write pages carry no sibling links, so the iterator keeps the path
//! from the root as a stack of child lists and walks it like a depth-first
//! traversal. The iterator is pinned to the root it was created from and
//! never observes later mutations, as long as the store keeps released pages
//! intact while it is alive (`with_deferred_release` on both stores).

use crate::btree::codec::NodeType;
use crate::btree::node::{self, SearchResult};
use crate::btree::tree::{BTree, BTreeError, MAX_DEPTH};
use crate::storage::{PageRef, PageStore};

/// One internal node on the path: its children and the next one to visit.
#[derive(Debug)]
struct Level {
    children: Vec<PageRef>,
    next: usize,
}

/// Iterator over B-tree entries in ascending key order.
pub struct BTreeIterator<'a, S: PageStore> {
    tree: &'a BTree<S>,
    stack: Vec<Level>,
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    position: usize,
}

impl<S: PageStore> BTree<S> {
    /// Iterate over all entries in key order.
    pub fn iter(&self) -> Result<BTreeIterator<'_, S>, BTreeError> {
        self.iter_from(b"")
    }

    /// Iterate over entries with keys greater than or equal to `start`.
    pub fn iter_from(&self, start: &[u8]) -> Result<BTreeIterator<'_, S>, BTreeError> {
        let mut iter = BTreeIterator {
            tree: self,
            stack: Vec::new(),
            entries: Vec::new(),
            position: 0,
        };
        iter.descend(self.root(), Some(start))?;
        Ok(iter)
    }

    /// Count the total number of entries in the tree.
    pub fn count(&self) -> Result<usize, BTreeError> {
        let mut iter = self.iter()?;
        let mut count = 0;
        while iter.next_entry()?.is_some() {
            count += 1;
        }
        Ok(count)
    }
}

impl<S: PageStore> BTreeIterator<'_, S> {
    /// Walk down from `page_ref` to a leaf and load its entries.
    ///
    /// With a `start` key the walk follows the routing path for that key and
    /// positions on the first entry not below it; without one it takes the
    /// leftmost path.
    fn descend(&mut self, mut page_ref: PageRef, start: Option<&[u8]>) -> Result<(), BTreeError> {
        for _ in 0..MAX_DEPTH {
            let page = self.tree.read_page(page_ref)?;
            let view = self.tree.decode(page_ref, &page)?;

            match view.node_type() {
                NodeType::Internal => {
                    let index = match start {
                        Some(key) => node::child_index(&view, key)?,
                        None => 0,
                    };
                    let children = (0..view.key_count())
                        .map(|i| view.child_ref(i))
                        .collect::<Result<Vec<_>, _>>()?;
                    page_ref = children[usize::from(index)];
                    self.stack.push(Level {
                        children,
                        next: usize::from(index) + 1,
                    });
                }
                NodeType::Leaf => {
                    self.entries = (0..view.key_count())
                        .map(|i| Ok((view.key_at(i)?.to_vec(), view.value_at(i)?.to_vec())))
                        .collect::<Result<Vec<_>, BTreeError>>()?;
                    self.position = match start {
                        Some(key) => match node::lookup(&view, key)? {
                            SearchResult::Found(i) | SearchResult::NotFound(i) => usize::from(i),
                            SearchResult::Child(_) => 0,
                        },
                        None => 0,
                    };
                    return Ok(());
                }
            }
        }

        Err(BTreeError::CorruptPage {
            page_ref,
            reason: format!("tree deeper than {MAX_DEPTH} levels"),
        })
    }

    /// Get the next entry.
    pub fn next_entry(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>, BTreeError> {
        loop {
            if self.position < self.entries.len() {
                let entry = std::mem::take(&mut self.entries[self.position]);
                self.position += 1;
                return Ok(Some(entry));
            }

            // Current leaf exhausted: find the next unvisited subtree.
            let next = loop {
                let Some(level) = self.stack.last_mut() else {
                    return Ok(None);
                };
                if level.next < level.children.len() {
                    let child = level.children[level.next];
                    level.next += 1;
                    break child;
                }
                self.stack.pop();
            };

            self.descend(next, None)?;
        }
    }
}
