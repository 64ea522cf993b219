//! Node operations.
//!
//! Pure functions over one or two decoded nodes. Every operation builds
//! brand-new page buffers with `PageBuilder`; an existing page is never
//! modified. Results are encoded at their exact length, so a result may be
//! larger than the page size and it is up to the caller to split it.
//!
//! All size decisions (overflow, underflow, split points) are made on the
//! encoded byte size, never on entry counts.

use crate::btree::codec::{
    CodecError, NodeType, PageBuilder, PageView, Payload, REF_SIZE, encoded_size, record_size,
};
use crate::config::TreeConfig;
use crate::storage::PageRef;

/// Outcome of searching a node for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchResult {
    /// Internal node: index of the child whose subtree may contain the key.
    Child(u16),
    /// Leaf node: index of the entry with exactly this key.
    Found(u16),
    /// Leaf node: the key is absent and would be inserted at this index.
    NotFound(u16),
}

/// A `(first key, child)` pair destined for an internal node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildEntry {
    pub key: Vec<u8>,
    pub child: PageRef,
}

/// Result of splitting an over-full node in two.
#[derive(Debug)]
pub struct Split {
    pub left: Vec<u8>,
    pub right: Vec<u8>,
    /// First key of `right`.
    pub split_key: Vec<u8>,
}

/// Result of fixing an underfull node together with a sibling.
#[derive(Debug, PartialEq, Eq)]
pub enum MergeResult {
    /// Both siblings fit in one node; the parent drops the right entry.
    Merged(Vec<u8>),
    /// Records moved across the boundary; the parent keeps two entries and
    /// routes to `right` with `separator`.
    Rebalanced {
        left: Vec<u8>,
        right: Vec<u8>,
        separator: Vec<u8>,
    },
    /// The donor's boundary record does not fit in the receiver, so nothing
    /// can move; both siblings stay as they are.
    Unchanged,
}

/// Number of entries whose key is less than or equal to `key`.
fn upper_bound(page: &PageView<'_>, key: &[u8]) -> Result<u16, CodecError> {
    let (mut lo, mut hi) = (0u16, page.key_count());
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if page.key_at(mid)? <= key {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    Ok(lo)
}

/// Binary search for `key`.
///
/// For an internal node the result is always `Child`: the index of the
/// largest key not greater than `key`, or 0 when `key` sorts before every
/// key in the node. For a leaf the result is `Found` or `NotFound`.
pub fn lookup(page: &PageView<'_>, key: &[u8]) -> Result<SearchResult, CodecError> {
    let le = upper_bound(page, key)?;
    match page.node_type() {
        NodeType::Internal => Ok(SearchResult::Child(le.saturating_sub(1))),
        NodeType::Leaf => {
            if le > 0 && page.key_at(le - 1)? == key {
                Ok(SearchResult::Found(le - 1))
            } else {
                Ok(SearchResult::NotFound(le))
            }
        }
    }
}

/// Routing index for `key` in an internal node.
pub fn child_index(page: &PageView<'_>, key: &[u8]) -> Result<u16, CodecError> {
    match lookup(page, key)? {
        SearchResult::Child(index) => Ok(index),
        SearchResult::Found(_) | SearchResult::NotFound(_) => Err(CodecError::WrongNodeType {
            expected: NodeType::Internal,
            actual: NodeType::Leaf,
        }),
    }
}

fn entry_count(count: usize) -> Result<u16, CodecError> {
    u16::try_from(count).map_err(|_| CodecError::TooManyEntries(count))
}

fn expect_type(page: &PageView<'_>, expected: NodeType) -> Result<(), CodecError> {
    if page.node_type() == expected {
        Ok(())
    } else {
        Err(CodecError::WrongNodeType {
            expected,
            actual: page.node_type(),
        })
    }
}

/// Insert or replace `key` in a leaf.
pub fn insert_into_leaf(
    page: &PageView<'_>,
    key: &[u8],
    value: &[u8],
) -> Result<Vec<u8>, CodecError> {
    expect_type(page, NodeType::Leaf)?;
    let n = page.key_count();

    let (at, skip) = match lookup(page, key)? {
        SearchResult::Found(i) => (i, 1),
        SearchResult::NotFound(i) => (i, 0),
        SearchResult::Child(_) => {
            return Err(CodecError::WrongNodeType {
                expected: NodeType::Leaf,
                actual: NodeType::Internal,
            });
        }
    };

    let count = entry_count(usize::from(n) + 1 - usize::from(skip))?;
    let mut builder = PageBuilder::new(NodeType::Leaf, count);
    builder.append_range(page, 0..at)?;
    builder.append_record(key, Payload::Value(value))?;
    builder.append_range(page, at + skip..n)?;
    builder.finish()
}

/// Remove `key` from a leaf. Returns `None` if the key is absent.
pub fn delete_from_leaf(page: &PageView<'_>, key: &[u8]) -> Result<Option<Vec<u8>>, CodecError> {
    expect_type(page, NodeType::Leaf)?;
    let n = page.key_count();

    let SearchResult::Found(at) = lookup(page, key)? else {
        return Ok(None);
    };

    let mut builder = PageBuilder::new(NodeType::Leaf, n - 1);
    builder.append_range(page, 0..at)?;
    builder.append_range(page, at + 1..n)?;
    builder.finish().map(Some)
}

/// Replace entries `index..index + count` of an internal node with `entries`.
///
/// `entries` may be empty (the children vanished), hold one entry (a child
/// was rewritten or two children merged) or several (a child split).
pub fn replace_children(
    page: &PageView<'_>,
    index: u16,
    count: u16,
    entries: &[ChildEntry],
) -> Result<Vec<u8>, CodecError> {
    expect_type(page, NodeType::Internal)?;
    let n = page.key_count();
    let end = index
        .checked_add(count)
        .filter(|end| *end <= n)
        .ok_or_else(|| CodecError::OutOfBounds {
            index: index.saturating_add(count),
            key_count: n,
        })?;

    let total = entry_count(usize::from(n - count) + entries.len())?;
    let mut builder = PageBuilder::new(NodeType::Internal, total);
    builder.append_range(page, 0..index)?;
    for entry in entries {
        builder.append_record(&entry.key, Payload::Child(entry.child))?;
    }
    builder.append_range(page, end..n)?;
    builder.finish()
}

/// Replace the child at `index` with one or more new children.
pub fn insert_into_internal(
    page: &PageView<'_>,
    index: u16,
    new_children: &[ChildEntry],
) -> Result<Vec<u8>, CodecError> {
    replace_children(page, index, 1, new_children)
}

/// Build a fresh internal node over `entries`.
pub fn build_internal(entries: &[ChildEntry]) -> Result<Vec<u8>, CodecError> {
    let mut builder = PageBuilder::new(NodeType::Internal, entry_count(entries.len())?);
    for entry in entries {
        builder.append_record(&entry.key, Payload::Child(entry.child))?;
    }
    builder.finish()
}

/// Encoded sizes of the left and right halves for every boundary `1..n`.
struct Halves {
    record_lens: Vec<usize>,
    total_records: usize,
}

impl Halves {
    fn new(page: &PageView<'_>) -> Result<Self, CodecError> {
        let record_lens = (0..page.key_count())
            .map(|i| page.record_len(i))
            .collect::<Result<Vec<_>, _>>()?;
        let total_records = record_lens.iter().sum();
        Ok(Self {
            record_lens,
            total_records,
        })
    }

    fn left(&self, boundary: usize) -> usize {
        encoded_size(boundary, self.left_records(boundary))
    }

    fn right(&self, boundary: usize) -> usize {
        let n = self.record_lens.len();
        encoded_size(n - boundary, self.total_records - self.left_records(boundary))
    }

    fn left_records(&self, boundary: usize) -> usize {
        self.record_lens[..boundary].iter().sum()
    }
}

/// Split a node in two, roughly in half by entry count.
///
/// The boundary starts at the middle entry and moves outward until both
/// halves fit in `page_size`. If no boundary gives two fitting halves, the
/// left half takes as many entries as fit and the right half is left for
/// the caller to split again (see `split_to_fit`).
pub fn split(page: &PageView<'_>, page_size: usize) -> Result<Split, CodecError> {
    let n = usize::from(page.key_count());
    if n < 2 {
        return Err(CodecError::Unsplittable {
            key_count: page.key_count(),
        });
    }

    let halves = Halves::new(page)?;
    let fits = |k: usize| halves.left(k) <= page_size && halves.right(k) <= page_size;

    let mid = n / 2;
    let boundary = (0..n)
        .flat_map(|d| [mid.checked_sub(d), mid.checked_add(d)])
        .flatten()
        .filter(|k| (1..n).contains(k))
        .find(|k| fits(*k))
        .unwrap_or_else(|| {
            (1..n)
                .rev()
                .find(|k| halves.left(*k) <= page_size)
                .unwrap_or(1)
        });

    let boundary = entry_count(boundary)?;
    let node_type = page.node_type();
    let count = page.key_count();

    let mut left = PageBuilder::new(node_type, boundary);
    left.append_range(page, 0..boundary)?;
    let mut right = PageBuilder::new(node_type, count - boundary);
    right.append_range(page, boundary..count)?;

    tracing::trace!(
        %node_type,
        entries = count,
        boundary,
        "split node"
    );

    Ok(Split {
        left: left.finish()?,
        right: right.finish()?,
        split_key: page.key_at(boundary)?.to_vec(),
    })
}

/// Split `bytes` repeatedly until every piece fits in `page_size`.
///
/// Returns the pieces in key order. A node that already fits comes back
/// unchanged as the only piece. One insertion into a fitting node never
/// yields more than three pieces.
pub fn split_to_fit(bytes: Vec<u8>, page_size: usize) -> Result<Vec<Vec<u8>>, CodecError> {
    let mut pieces = Vec::new();
    let mut rest = bytes;
    while rest.len() > page_size {
        let view = PageView::new(&rest)?;
        let Split { left, right, .. } = split(&view, page_size)?;
        pieces.push(left);
        rest = right;
    }
    pieces.push(rest);
    Ok(pieces)
}

/// Whether a node of `encoded_len` bytes is below the occupancy threshold.
#[must_use]
pub const fn is_underfull(encoded_len: usize, config: &TreeConfig) -> bool {
    encoded_len < config.min_fill_bytes()
}

/// Merge two adjacent siblings, or move records between them.
///
/// `separator` is the parent key routing to `right`. For internal nodes it
/// replaces the first key of `right` in the combined sequence.
///
/// If the concatenation fits in one page the siblings are merged. Otherwise
/// boundary records move from the larger sibling to the smaller one: at least
/// one, then more until the smaller side is no longer underfull, stopping early
/// if the donor would become underfull or the receiver would overflow. If not
/// even the first record fits in the receiver the result is `Unchanged`.
pub fn merge_or_rebalance(
    left: &PageView<'_>,
    right: &PageView<'_>,
    separator: &[u8],
    config: &TreeConfig,
) -> Result<MergeResult, CodecError> {
    let node_type = left.node_type();
    expect_type(right, node_type)?;

    let mut entries =
        Vec::with_capacity(usize::from(left.key_count()) + usize::from(right.key_count()));
    for i in 0..left.key_count() {
        entries.push((left.key_at(i)?, left.payload_at(i)?));
    }
    for i in 0..right.key_count() {
        let key = if i == 0 && node_type == NodeType::Internal {
            separator
        } else {
            right.key_at(i)?
        };
        entries.push((key, right.payload_at(i)?));
    }

    let record_lens: Vec<usize> = entries
        .iter()
        .map(|(key, payload)| match payload {
            Payload::Value(value) => record_size(key.len(), value.len()),
            Payload::Child(_) => record_size(key.len(), REF_SIZE),
        })
        .collect();
    let n = entries.len();
    let left_size = |k: usize| encoded_size(k, record_lens[..k].iter().sum());
    let right_size = |k: usize| encoded_size(n - k, record_lens[k..].iter().sum());

    if left_size(n) <= config.page_size {
        tracing::trace!(%node_type, entries = n, "merged siblings");
        return build(node_type, &entries).map(MergeResult::Merged);
    }

    let min_fill = config.min_fill_bytes();
    let page_size = config.page_size;
    let mut boundary = usize::from(left.key_count());

    if left.encoded_size() <= right.encoded_size() {
        // Move from the front of `right` to the back of `left`.
        while boundary + 1 < n {
            let next = boundary + 1;
            let moved = boundary > usize::from(left.key_count());
            if left_size(next) > page_size || (moved && right_size(next) < min_fill) {
                break;
            }
            boundary = next;
            if left_size(boundary) >= min_fill {
                break;
            }
        }
    } else {
        // Move from the back of `left` to the front of `right`.
        while boundary > 1 {
            let next = boundary - 1;
            let moved = boundary < usize::from(left.key_count());
            if right_size(next) > page_size || (moved && left_size(next) < min_fill) {
                break;
            }
            boundary = next;
            if right_size(boundary) >= min_fill {
                break;
            }
        }
    }

    if boundary == usize::from(left.key_count()) {
        tracing::trace!(%node_type, entries = n, "boundary record does not fit, siblings unchanged");
        return Ok(MergeResult::Unchanged);
    }

    tracing::trace!(
        %node_type,
        entries = n,
        from = left.key_count(),
        to = boundary,
        "rebalanced siblings"
    );

    Ok(MergeResult::Rebalanced {
        left: build(node_type, &entries[..boundary])?,
        right: build(node_type, &entries[boundary..])?,
        separator: entries[boundary].0.to_vec(),
    })
}

fn build(node_type: NodeType, entries: &[(&[u8], Payload<'_>)]) -> Result<Vec<u8>, CodecError> {
    let mut builder = PageBuilder::new(node_type, entry_count(entries.len())?);
    for (key, payload) in entries {
        builder.append_record(key, *payload)?;
    }
    builder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::codec::MAX_VAL_SIZE;

    fn leaf(entries: &[(&[u8], &[u8])]) -> Vec<u8> {
        build(
            NodeType::Leaf,
            &entries
                .iter()
                .map(|(k, v)| (*k, Payload::Value(v)))
                .collect::<Vec<_>>(),
        )
        .expect("build leaf")
    }

    fn numbered_leaf(count: usize, value_len: usize) -> Vec<u8> {
        let keys: Vec<Vec<u8>> = (0..count).map(|i| format!("key{i:05}").into_bytes()).collect();
        let value = vec![b'v'; value_len];
        let pairs: Vec<(&[u8], &[u8])> = keys.iter().map(|k| (k.as_slice(), value.as_slice())).collect();
        leaf(&pairs)
    }

    fn keys_of(bytes: &[u8]) -> Vec<Vec<u8>> {
        let view = PageView::new(bytes).expect("decode");
        (0..view.key_count())
            .map(|i| view.key_at(i).expect("key").to_vec())
            .collect()
    }

    fn entry(key: &[u8], child: u64) -> ChildEntry {
        ChildEntry {
            key: key.to_vec(),
            child: PageRef::new(child),
        }
    }

    #[test]
    fn test_lookup_leaf() {
        let bytes = leaf(&[(b"b", b"1"), (b"d", b"2"), (b"f", b"3")]);
        let view = PageView::new(&bytes).expect("decode");

        assert_eq!(lookup(&view, b"d").expect("lookup"), SearchResult::Found(1));
        assert_eq!(lookup(&view, b"a").expect("lookup"), SearchResult::NotFound(0));
        assert_eq!(lookup(&view, b"e").expect("lookup"), SearchResult::NotFound(2));
        assert_eq!(lookup(&view, b"z").expect("lookup"), SearchResult::NotFound(3));
    }

    #[test]
    fn test_lookup_internal_routes_to_largest_lower_key() {
        let bytes = build_internal(&[entry(b"b", 1), entry(b"m", 2), entry(b"t", 3)])
            .expect("build internal");
        let view = PageView::new(&bytes).expect("decode");

        assert_eq!(child_index(&view, b"a").expect("route"), 0);
        assert_eq!(child_index(&view, b"b").expect("route"), 0);
        assert_eq!(child_index(&view, b"l").expect("route"), 0);
        assert_eq!(child_index(&view, b"m").expect("route"), 1);
        assert_eq!(child_index(&view, b"zzz").expect("route"), 2);
    }

    #[test]
    fn test_insert_into_leaf_upserts() {
        let bytes = leaf(&[(b"a", b"1"), (b"c", b"3")]);
        let view = PageView::new(&bytes).expect("decode");

        let inserted = insert_into_leaf(&view, b"b", b"2").expect("insert");
        assert_eq!(keys_of(&inserted), vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);

        let view = PageView::new(&inserted).expect("decode");
        let replaced = insert_into_leaf(&view, b"b", b"two").expect("replace");
        let view = PageView::new(&replaced).expect("decode");
        assert_eq!(view.key_count(), 3);
        assert_eq!(view.value_at(1).expect("value"), b"two");
    }

    #[test]
    fn test_insert_does_not_touch_source() {
        let bytes = leaf(&[(b"a", b"1")]);
        let before = bytes.clone();
        let view = PageView::new(&bytes).expect("decode");
        insert_into_leaf(&view, b"b", b"2").expect("insert");
        assert_eq!(bytes, before);
    }

    #[test]
    fn test_delete_from_leaf() {
        let bytes = leaf(&[(b"a", b"1"), (b"b", b"2"), (b"c", b"3")]);
        let view = PageView::new(&bytes).expect("decode");

        let deleted = delete_from_leaf(&view, b"b")
            .expect("delete")
            .expect("key present");
        assert_eq!(keys_of(&deleted), vec![b"a".to_vec(), b"c".to_vec()]);
        assert_eq!(delete_from_leaf(&view, b"x").expect("delete"), None);
    }

    #[test]
    fn test_replace_children() {
        let bytes = build_internal(&[entry(b"a", 1), entry(b"k", 2), entry(b"t", 3)])
            .expect("build internal");
        let view = PageView::new(&bytes).expect("decode");

        let split = insert_into_internal(&view, 1, &[entry(b"k", 10), entry(b"p", 11)])
            .expect("replace one with two");
        let split_view = PageView::new(&split).expect("decode");
        assert_eq!(split_view.key_count(), 4);
        assert_eq!(split_view.child_ref(1).expect("child"), PageRef::new(10));
        assert_eq!(split_view.key_at(2).expect("key"), b"p");
        assert_eq!(split_view.child_ref(3).expect("child"), PageRef::new(3));

        let merged = replace_children(&view, 0, 2, &[entry(b"a", 20)]).expect("merge two");
        assert_eq!(keys_of(&merged), vec![b"a".to_vec(), b"t".to_vec()]);

        let dropped = replace_children(&view, 2, 1, &[]).expect("drop");
        assert_eq!(keys_of(&dropped), vec![b"a".to_vec(), b"k".to_vec()]);

        assert!(matches!(
            replace_children(&view, 2, 2, &[]),
            Err(CodecError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_split_halves_fit_and_key_is_first_of_right() {
        let bytes = numbered_leaf(60, 80);
        assert!(bytes.len() > 4096);
        let view = PageView::new(&bytes).expect("decode");

        let Split {
            left,
            right,
            split_key,
        } = split(&view, 4096).expect("split");

        assert!(left.len() <= 4096);
        assert!(right.len() <= 4096);
        assert_eq!(
            PageView::new(&right).expect("decode").key_at(0).expect("key"),
            split_key.as_slice()
        );

        let mut all = keys_of(&left);
        all.extend(keys_of(&right));
        assert_eq!(all, keys_of(&bytes));
        assert_eq!(keys_of(&left).len(), 30);
    }

    #[test]
    fn test_split_moves_boundary_for_uneven_records() {
        let large = vec![b'l'; 100];
        let small = vec![b's'; 10];
        let bytes = leaf(&[
            (b"a", &large),
            (b"b", &large),
            (b"c", &small),
            (b"d", &small),
        ]);
        let view = PageView::new(&bytes).expect("decode");

        // The count midpoint leaves both large records on the left.
        let result = split(&view, 200).expect("split");
        assert!(result.left.len() <= 200);
        assert!(result.right.len() <= 200);
        assert_eq!(result.split_key, b"b".to_vec());
    }

    #[test]
    fn test_split_to_fit_three_way() {
        let big = vec![b'x'; MAX_VAL_SIZE];
        let mid = vec![b'm'; 1800];
        let bytes = leaf(&[(b"a", &mid), (b"b", &big), (b"c", &mid)]);
        let view = PageView::new(&bytes).expect("decode");
        // No single boundary gives two fitting halves.
        assert!((1..3).all(|k| {
            let halves = Halves::new(&view).expect("halves");
            halves.left(k) > 4096 || halves.right(k) > 4096
        }));

        let pieces = split_to_fit(bytes, 4096).expect("split to fit");
        assert_eq!(pieces.len(), 3);
        assert!(pieces.iter().all(|p| p.len() <= 4096));
    }

    #[test]
    fn test_split_to_fit_leaves_small_node_alone() {
        let bytes = leaf(&[(b"a", b"1")]);
        let pieces = split_to_fit(bytes.clone(), 4096).expect("split to fit");
        assert_eq!(pieces, vec![bytes]);
    }

    #[test]
    fn test_split_single_entry_is_rejected() {
        let big = vec![0u8; MAX_VAL_SIZE];
        let bytes = leaf(&[(b"a", &big)]);
        let view = PageView::new(&bytes).expect("decode");
        assert!(matches!(
            split(&view, 100),
            Err(CodecError::Unsplittable { key_count: 1 })
        ));
    }

    #[test]
    fn test_merge_when_concatenation_fits() {
        let config = TreeConfig::default();
        let left = leaf(&[(b"a", b"1"), (b"b", b"2")]);
        let right = leaf(&[(b"c", b"3")]);
        let left_view = PageView::new(&left).expect("decode");
        let right_view = PageView::new(&right).expect("decode");

        let result = merge_or_rebalance(&left_view, &right_view, b"c", &config).expect("merge");
        let MergeResult::Merged(merged) = result else {
            panic!("expected merge, got {result:?}");
        };
        assert_eq!(
            keys_of(&merged),
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]
        );
    }

    #[test]
    fn test_rebalance_moves_records_to_smaller_sibling() {
        let config = TreeConfig::default();
        let left = leaf(&[(b"a", b"1")]);
        let right = numbered_leaf(40, 80);
        let left_view = PageView::new(&left).expect("decode");
        let right_view = PageView::new(&right).expect("decode");
        assert!(right.len() <= 4096);
        assert!(left.len() + right.len() > 4096);

        let result = merge_or_rebalance(&left_view, &right_view, b"key00000", &config)
            .expect("rebalance");
        let MergeResult::Rebalanced {
            left,
            right,
            separator,
        } = result
        else {
            panic!("expected rebalance");
        };

        assert!(!is_underfull(left.len(), &config));
        assert!(!is_underfull(right.len(), &config));
        assert!(left.len() <= 4096 && right.len() <= 4096);
        assert_eq!(keys_of(&right)[0], separator);
        assert_eq!(keys_of(&left).len() + keys_of(&right).len(), 41);
    }

    #[test]
    fn test_rebalance_from_left_to_right() {
        let config = TreeConfig::default();
        let left = numbered_leaf(40, 80);
        let right = leaf(&[(b"zz", b"1")]);
        let left_view = PageView::new(&left).expect("decode");
        let right_view = PageView::new(&right).expect("decode");

        let result = merge_or_rebalance(&left_view, &right_view, b"zz", &config)
            .expect("rebalance");
        let MergeResult::Rebalanced { right, separator, .. } = result else {
            panic!("expected rebalance");
        };
        assert!(!is_underfull(right.len(), &config));
        assert_eq!(keys_of(&right)[0], separator);
        assert_eq!(keys_of(&right).last().expect("last"), &b"zz".to_vec());
    }

    #[test]
    fn test_rebalance_is_skipped_when_boundary_record_does_not_fit() {
        let config = TreeConfig::default();
        let mut big_key = b"m".to_vec();
        big_key.extend([b'x'; 99]);
        let big_value = vec![7u8; MAX_VAL_SIZE];
        let filler = vec![1u8; 1000];

        // Underfull left, right starts with a record too large to move left.
        let left = leaf(&[(b"a", &filler)]);
        let right = leaf(&[(&big_key, &big_value), (b"n", b"0123456789")]);
        assert!(is_underfull(left.len(), &config));
        assert!(left.len() + right.len() > 4096);
        let left_view = PageView::new(&left).expect("decode");
        let right_view = PageView::new(&right).expect("decode");
        let result =
            merge_or_rebalance(&left_view, &right_view, &big_key, &config).expect("rebalance");
        assert_eq!(result, MergeResult::Unchanged);

        // Mirror image: the large record sits at the end of the left sibling.
        let left = leaf(&[(b"a", b"0123456789"), (&big_key, &big_value)]);
        let right = leaf(&[(b"z", &filler)]);
        assert!(is_underfull(right.len(), &config));
        let left_view = PageView::new(&left).expect("decode");
        let right_view = PageView::new(&right).expect("decode");
        let result = merge_or_rebalance(&left_view, &right_view, b"z", &config).expect("rebalance");
        assert_eq!(result, MergeResult::Unchanged);
    }

    #[test]
    fn test_merge_internal_uses_separator() {
        let config = TreeConfig::default();
        let left = build_internal(&[entry(b"a", 1), entry(b"c", 2)]).expect("build");
        let right = build_internal(&[entry(b"m", 3)]).expect("build");
        let left_view = PageView::new(&left).expect("decode");
        let right_view = PageView::new(&right).expect("decode");

        let result = merge_or_rebalance(&left_view, &right_view, b"k", &config).expect("merge");
        let MergeResult::Merged(merged) = result else {
            panic!("expected merge");
        };
        let view = PageView::new(&merged).expect("decode");
        assert_eq!(view.key_at(2).expect("key"), b"k");
        assert_eq!(view.child_ref(2).expect("child"), PageRef::new(3));
    }

    #[test]
    fn test_merge_rejects_mixed_types() {
        let config = TreeConfig::default();
        let left = leaf(&[(b"a", b"1")]);
        let right = build_internal(&[entry(b"m", 3)]).expect("build");
        let left_view = PageView::new(&left).expect("decode");
        let right_view = PageView::new(&right).expect("decode");
        assert!(matches!(
            merge_or_rebalance(&left_view, &right_view, b"m", &config),
            Err(CodecError::WrongNodeType { .. })
        ));
    }

    #[test]
    fn test_is_underfull() {
        let config = TreeConfig::default();
        assert!(is_underfull(1023, &config));
        assert!(!is_underfull(1024, &config));
    }
}
