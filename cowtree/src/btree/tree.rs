//! Copy-on-write B+tree engine.
//!
//! The tree owns exactly one piece of mutable state: the reference of the
//! current root page. Every mutation builds a new chain of pages bottom-up
//! through the page store, publishes the new root with a single atomic
//! store, and only then releases the pages the new version no longer uses.
//!
//! # Concurrency
//!
//! - Mutations are serialized by an internal writer lock
//! - `get`, `iter` and friends take `&self` and may run on any number of
//!   threads while a writer is active
//! - A reader that loaded an older root keeps seeing that version, as long as
//!   the store does not reclaim released pages under it (see
//!   `MemoryStore::with_deferred_release`)
//!
//! # Failure
//!
//! A failed mutation releases every page it had allocated and leaves the
//! root untouched. Oversized keys and values are rejected before any page
//! is read or allocated.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::btree::codec::{
    CodecError, MAX_KEY_SIZE, MAX_VAL_SIZE, NodeType, PageBuilder, PageView,
};
use crate::btree::node::{self, ChildEntry, MergeResult, SearchResult};
use crate::config::{ConfigError, TreeConfig};
use crate::storage::{Page, PageRef, PageStore, StoreError};

/// Deepest tree the engine will descend before declaring a page cycle.
pub(crate) const MAX_DEPTH: usize = 64;

/// Pages touched by one in-flight mutation.
#[derive(Debug, Default)]
struct Mutation {
    /// Pages allocated so far, released again if the mutation fails.
    allocated: Vec<PageRef>,
    /// Pages of the current version that the new version replaces.
    superseded: Vec<PageRef>,
}

/// A B+tree over a page store.
pub struct BTree<S: PageStore> {
    store: S,
    config: TreeConfig,
    root: AtomicU64,
    writer: Mutex<()>,
}

impl<S: PageStore> BTree<S> {
    /// Create an empty tree: a single leaf root with no keys.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the config fails validation, or
    /// `AllocationFailed` if the store cannot take the root page.
    pub fn create(store: S, config: TreeConfig) -> Result<Self, BTreeError> {
        config.validate()?;

        let tree = Self {
            store,
            config,
            root: AtomicU64::new(0),
            writer: Mutex::new(()),
        };

        let mut mutation = Mutation::default();
        let root = tree.allocate_page(&mut mutation, empty_leaf()?)?;
        tree.root.store(root.get(), Ordering::Release);

        tracing::debug!(%root, page_size = config.page_size, "created empty tree");
        Ok(tree)
    }

    /// Open an existing tree rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the config fails validation, or `CorruptPage` if
    /// the root page cannot be read or decoded.
    pub fn open(store: S, config: TreeConfig, root: PageRef) -> Result<Self, BTreeError> {
        config.validate()?;

        let tree = Self {
            store,
            config,
            root: AtomicU64::new(root.get()),
            writer: Mutex::new(()),
        };

        let page = tree.read_page(root)?;
        let view = tree.decode(root, &page)?;
        tracing::debug!(%root, node_type = %view.node_type(), "opened tree");

        Ok(tree)
    }

    /// Reference of the current root page.
    #[must_use]
    pub fn root(&self) -> PageRef {
        PageRef::new(self.root.load(Ordering::Acquire))
    }

    /// The tree's configuration.
    #[must_use]
    pub const fn config(&self) -> &TreeConfig {
        &self.config
    }

    /// The underlying page store.
    #[must_use]
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Consume the tree, returning the page store.
    #[must_use]
    pub fn into_store(self) -> S {
        self.store
    }

    #[allow(clippy::expect_used)] // Mutex poisoning indicates unrecoverable state
    fn lock_writer(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().expect("lock poisoned")
    }

    /// Look up a key.
    ///
    /// Returns `None` if the key is not present. A key longer than
    /// `MAX_KEY_SIZE` can never be stored and is answered without a read.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, BTreeError> {
        if key.len() > MAX_KEY_SIZE {
            return Ok(None);
        }

        let mut page_ref = self.root();
        for _ in 0..MAX_DEPTH {
            let page = self.read_page(page_ref)?;
            let view = self.decode(page_ref, &page)?;
            match node::lookup(&view, key)? {
                SearchResult::Child(index) => page_ref = view.child_ref(index)?,
                SearchResult::Found(index) => return Ok(Some(view.value_at(index)?.to_vec())),
                SearchResult::NotFound(_) => return Ok(None),
            }
        }

        Err(too_deep(page_ref))
    }

    /// Whether the tree holds `key`.
    pub fn contains_key(&self, key: &[u8]) -> Result<bool, BTreeError> {
        self.get(key).map(|value| value.is_some())
    }

    /// Insert or update a key-value pair.
    ///
    /// # Errors
    ///
    /// - `KeyTooLarge` / `ValueTooLarge` before anything is touched
    /// - `CorruptPage` if a page on the path cannot be read or decoded
    /// - `AllocationFailed` if the store refuses a new page
    ///
    /// On error the tree is unchanged.
    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<(), BTreeError> {
        check_key(key)?;
        if value.len() > MAX_VAL_SIZE {
            return Err(BTreeError::ValueTooLarge {
                len: value.len(),
                max: MAX_VAL_SIZE,
            });
        }

        let _guard = self.lock_writer();
        let old_root = self.root();
        let mut mutation = Mutation::default();

        let result = self
            .insert_into(&mut mutation, old_root, key, value, 0)
            .and_then(|pages| self.grow_root(&mut mutation, pages));

        match result {
            Ok(new_root) => {
                self.commit(mutation, old_root, new_root, "insert");
                Ok(())
            }
            Err(e) => {
                self.abort(mutation, &e, "insert");
                Err(e)
            }
        }
    }

    /// Delete a key.
    ///
    /// Returns `true` if a record was removed and `false` if the key was not
    /// present, in which case nothing is allocated or released.
    ///
    /// # Errors
    ///
    /// `CorruptPage` or `AllocationFailed` as for `insert`; on error the
    /// tree is unchanged.
    pub fn delete(&self, key: &[u8]) -> Result<bool, BTreeError> {
        if key.len() > MAX_KEY_SIZE {
            return Ok(false);
        }

        let _guard = self.lock_writer();
        let old_root = self.root();
        let mut mutation = Mutation::default();

        let result = self
            .delete_from(&mut mutation, old_root, key, 0)
            .and_then(|pages| match pages {
                Some(pages) => self.shrink_root(&mut mutation, pages).map(Some),
                None => Ok(None),
            });

        match result {
            Ok(Some(new_root)) => {
                self.commit(mutation, old_root, new_root, "delete");
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(e) => {
                self.abort(mutation, &e, "delete");
                Err(e)
            }
        }
    }

    /// Copy-on-write insert below `page_ref`.
    ///
    /// Returns the replacement pages for `page_ref` in key order: one if the
    /// page still fits, more if it had to be split.
    fn insert_into(
        &self,
        mutation: &mut Mutation,
        page_ref: PageRef,
        key: &[u8],
        value: &[u8],
        depth: usize,
    ) -> Result<Vec<Vec<u8>>, BTreeError> {
        if depth >= MAX_DEPTH {
            return Err(too_deep(page_ref));
        }

        let page = self.read_page(page_ref)?;
        let view = self.decode(page_ref, &page)?;

        let updated = match view.node_type() {
            NodeType::Leaf => node::insert_into_leaf(&view, key, value)?,
            NodeType::Internal => {
                let index = node::child_index(&view, key)?;
                let child = view.child_ref(index)?;
                let pages = self.insert_into(mutation, child, key, value, depth + 1)?;
                let entries = self.allocate_children(mutation, pages)?;
                node::insert_into_internal(&view, index, &entries)?
            }
        };

        mutation.superseded.push(page_ref);
        Ok(node::split_to_fit(updated, self.config.page_size)?)
    }

    /// Copy-on-write delete below `page_ref`.
    ///
    /// Returns `None` if the key is absent. Otherwise returns the replacement
    /// pages for `page_ref`; an empty list means the subtree is now empty.
    fn delete_from(
        &self,
        mutation: &mut Mutation,
        page_ref: PageRef,
        key: &[u8],
        depth: usize,
    ) -> Result<Option<Vec<Vec<u8>>>, BTreeError> {
        if depth >= MAX_DEPTH {
            return Err(too_deep(page_ref));
        }

        let page = self.read_page(page_ref)?;
        let view = self.decode(page_ref, &page)?;

        let updated = match view.node_type() {
            NodeType::Leaf => {
                let Some(updated) = node::delete_from_leaf(&view, key)? else {
                    return Ok(None);
                };
                updated
            }
            NodeType::Internal => {
                let index = node::child_index(&view, key)?;
                let child = view.child_ref(index)?;
                let Some(pages) = self.delete_from(mutation, child, key, depth + 1)? else {
                    return Ok(None);
                };

                let underfull = pages.len() == 1
                    && view.key_count() > 1
                    && node::is_underfull(pages[0].len(), &self.config);

                let fixed = if underfull {
                    self.fix_underflow(mutation, &view, index, &pages[0])?
                } else {
                    None
                };

                if pages.is_empty() {
                    tracing::trace!(%page_ref, index, "dropping empty child");
                    node::replace_children(&view, index, 1, &[])?
                } else if let Some((start, replacement)) = fixed {
                    let entries = self.allocate_children(mutation, replacement)?;
                    node::replace_children(&view, start, 2, &entries)?
                } else {
                    let entries = self.allocate_children(mutation, pages)?;
                    node::insert_into_internal(&view, index, &entries)?
                }
            }
        };

        mutation.superseded.push(page_ref);

        if PageView::new(&updated)?.key_count() == 0 {
            return Ok(Some(Vec::new()));
        }
        Ok(Some(node::split_to_fit(updated, self.config.page_size)?))
    }

    /// Merge or rebalance an underfull child with an adjacent sibling.
    ///
    /// The left sibling is preferred. Returns the index of the first of the
    /// two parent entries to replace and the replacement pages, or `None` if
    /// the sibling cannot give up a record and stays in place.
    fn fix_underflow(
        &self,
        mutation: &mut Mutation,
        parent: &PageView<'_>,
        index: u16,
        child: &[u8],
    ) -> Result<Option<(u16, Vec<Vec<u8>>)>, BTreeError> {
        let sibling_index = if index > 0 { index - 1 } else { index + 1 };
        let sibling_ref = parent.child_ref(sibling_index)?;
        let sibling_page = self.read_page(sibling_ref)?;
        let sibling = self.decode(sibling_ref, &sibling_page)?;
        let child_view = PageView::new(child)?;

        let (start, left, right) = if index > 0 {
            (index - 1, sibling, child_view)
        } else {
            (index, child_view, sibling)
        };

        let separator = right.key_at(0)?;
        let pages = match node::merge_or_rebalance(&left, &right, separator, &self.config)? {
            MergeResult::Merged(merged) => vec![merged],
            MergeResult::Rebalanced { left, right, .. } => vec![left, right],
            MergeResult::Unchanged => {
                tracing::trace!(child = index, %sibling_ref, "underfull child left as is");
                return Ok(None);
            }
        };

        tracing::trace!(
            child = index,
            %sibling_ref,
            merged = pages.len() == 1,
            "fixed underfull child"
        );

        mutation.superseded.push(sibling_ref);
        Ok(Some((start, pages)))
    }

    /// Allocate the top-level pages produced by an insert.
    ///
    /// While there is more than one page, a new internal level is built over
    /// them. This is the only place the tree grows in height.
    fn grow_root(
        &self,
        mutation: &mut Mutation,
        mut pages: Vec<Vec<u8>>,
    ) -> Result<PageRef, BTreeError> {
        loop {
            if pages.len() <= 1 {
                let bytes = match pages.pop() {
                    Some(bytes) => bytes,
                    None => empty_leaf()?,
                };
                return self.allocate_page(mutation, bytes);
            }

            let entries = self.allocate_children(mutation, pages)?;
            tracing::debug!(children = entries.len(), "adding a root level");
            pages = node::split_to_fit(node::build_internal(&entries)?, self.config.page_size)?;
        }
    }

    /// Allocate the top-level pages produced by a delete.
    ///
    /// An empty result becomes an empty leaf root. An internal root left with
    /// a single child is dropped in favour of that child, repeatedly.
    fn shrink_root(
        &self,
        mutation: &mut Mutation,
        pages: Vec<Vec<u8>>,
    ) -> Result<PageRef, BTreeError> {
        let collapse_to = match pages.as_slice() {
            [] => return self.allocate_page(mutation, empty_leaf()?),
            [only] => {
                let view = PageView::new(only)?;
                (view.node_type() == NodeType::Internal && view.key_count() == 1)
                    .then(|| view.child_ref(0))
                    .transpose()?
            }
            _ => None,
        };

        let Some(mut root) = collapse_to else {
            return self.grow_root(mutation, pages);
        };

        for _ in 0..MAX_DEPTH {
            let page = self.read_page(root)?;
            let view = self.decode(root, &page)?;
            if view.is_leaf() || view.key_count() != 1 {
                tracing::debug!(%root, "collapsed root");
                return Ok(root);
            }
            mutation.superseded.push(root);
            root = view.child_ref(0)?;
        }

        Err(too_deep(root))
    }

    /// Allocate child pages and pair each with its first key.
    fn allocate_children(
        &self,
        mutation: &mut Mutation,
        pages: Vec<Vec<u8>>,
    ) -> Result<Vec<ChildEntry>, BTreeError> {
        let mut entries = Vec::with_capacity(pages.len());
        for bytes in pages {
            let key = PageView::new(&bytes)?.key_at(0)?.to_vec();
            let child = self.allocate_page(mutation, bytes)?;
            entries.push(ChildEntry { key, child });
        }
        Ok(entries)
    }

    fn allocate_page(&self, mutation: &mut Mutation, bytes: Vec<u8>) -> Result<PageRef, BTreeError> {
        let len = bytes.len();
        let page = Page::from_encoded(bytes, self.config.page_size).map_err(|_| {
            BTreeError::PageOverflow {
                len,
                page_size: self.config.page_size,
            }
        })?;

        let page_ref = self
            .store
            .allocate(page)
            .map_err(BTreeError::AllocationFailed)?;
        mutation.allocated.push(page_ref);
        Ok(page_ref)
    }

    /// Publish `new_root`, then release every page the old version used
    /// and the new one does not.
    fn commit(&self, mutation: Mutation, old_root: PageRef, new_root: PageRef, operation: &str) {
        self.root.store(new_root.get(), Ordering::Release);

        tracing::debug!(
            operation,
            %old_root,
            %new_root,
            allocated = mutation.allocated.len(),
            released = mutation.superseded.len(),
            "committed"
        );

        for page_ref in mutation.superseded {
            self.store.release(page_ref);
        }
    }

    /// Roll back a failed mutation: release what it allocated.
    fn abort(&self, mutation: Mutation, error: &BTreeError, operation: &str) {
        tracing::warn!(
            operation,
            error = %error,
            rolled_back = mutation.allocated.len(),
            "mutation failed, tree unchanged"
        );

        for page_ref in mutation.allocated {
            self.store.release(page_ref);
        }
    }

    /// Read a page, mapping any store failure to `CorruptPage`.
    pub(crate) fn read_page(&self, page_ref: PageRef) -> Result<Page, BTreeError> {
        let page = self.store.dereference(page_ref).map_err(|e| {
            tracing::error!(%page_ref, error = %e, "failed to read page");
            BTreeError::CorruptPage {
                page_ref,
                reason: e.to_string(),
            }
        })?;

        if page.len() != self.config.page_size {
            tracing::error!(%page_ref, len = page.len(), "page has the wrong size");
            return Err(BTreeError::CorruptPage {
                page_ref,
                reason: format!(
                    "page is {} bytes, expected {}",
                    page.len(),
                    self.config.page_size
                ),
            });
        }

        Ok(page)
    }

    /// Decode a page read from the store.
    pub(crate) fn decode<'p>(
        &self,
        page_ref: PageRef,
        page: &'p Page,
    ) -> Result<PageView<'p>, BTreeError> {
        let view = PageView::new(page.as_bytes()).map_err(|e| {
            tracing::error!(%page_ref, error = %e, "failed to decode page");
            BTreeError::CorruptPage {
                page_ref,
                reason: e.to_string(),
            }
        })?;

        if view.node_type() == NodeType::Internal && view.key_count() == 0 {
            tracing::error!(%page_ref, "internal page without children");
            return Err(BTreeError::CorruptPage {
                page_ref,
                reason: "internal page without children".to_string(),
            });
        }

        Ok(view)
    }
}

fn check_key(key: &[u8]) -> Result<(), BTreeError> {
    if key.len() > MAX_KEY_SIZE {
        return Err(BTreeError::KeyTooLarge {
            len: key.len(),
            max: MAX_KEY_SIZE,
        });
    }
    Ok(())
}

fn empty_leaf() -> Result<Vec<u8>, CodecError> {
    PageBuilder::new(NodeType::Leaf, 0).finish()
}

fn too_deep(page_ref: PageRef) -> BTreeError {
    tracing::error!(%page_ref, max_depth = MAX_DEPTH, "tree too deep, page cycle suspected");
    BTreeError::CorruptPage {
        page_ref,
        reason: format!("tree deeper than {MAX_DEPTH} levels"),
    }
}

/// Errors that can occur during B-tree operations.
#[derive(Debug)]
pub enum BTreeError {
    /// Key longer than `MAX_KEY_SIZE`.
    KeyTooLarge { len: usize, max: usize },
    /// Value longer than `MAX_VAL_SIZE`.
    ValueTooLarge { len: usize, max: usize },
    /// A page could not be read, decoded, or breaks a tree invariant.
    CorruptPage { page_ref: PageRef, reason: String },
    /// The store refused to allocate a page.
    AllocationFailed(StoreError),
    /// Index beyond a node's entry count. Always an internal bug.
    OutOfBounds { index: u16, key_count: u16 },
    /// A node operation failed. Always an internal bug.
    Codec(CodecError),
    /// A built page does not fit in the page size. Always an internal bug.
    PageOverflow { len: usize, page_size: usize },
    /// The configuration failed the startup check.
    Config(ConfigError),
}

impl std::fmt::Display for BTreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::KeyTooLarge { len, max } => {
                write!(f, "key too large: {len} bytes (max {max})")
            }
            Self::ValueTooLarge { len, max } => {
                write!(f, "value too large: {len} bytes (max {max})")
            }
            Self::CorruptPage { page_ref, reason } => {
                write!(f, "corrupt page {page_ref}: {reason}")
            }
            Self::AllocationFailed(e) => write!(f, "page allocation failed: {e}"),
            Self::OutOfBounds { index, key_count } => {
                write!(f, "index {index} out of bounds ({key_count} entries)")
            }
            Self::Codec(e) => write!(f, "node error: {e}"),
            Self::PageOverflow { len, page_size } => {
                write!(f, "built page of {len} bytes exceeds page size {page_size}")
            }
            Self::Config(e) => write!(f, "configuration error: {e}"),
        }
    }
}

impl std::error::Error for BTreeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::AllocationFailed(e) => Some(e),
            Self::Codec(e) => Some(e),
            Self::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CodecError> for BTreeError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::OutOfBounds { index, key_count } => Self::OutOfBounds { index, key_count },
            other => Self::Codec(other),
        }
    }
}

impl From<ConfigError> for BTreeError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}
