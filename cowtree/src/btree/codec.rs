//! Page codec: the binary layout of a B-tree node.
//!
//! Layout of every node page (all integers little-endian):
//!
//! ```text
//! | type | nkeys | child refs | offsets        | records ... |
//! | 2B   | 2B    | nkeys * 8B | (nkeys-1) * 2B |             |
//! ```
//!
//! Each record is:
//!
//! ```text
//! | klen | vlen | key  | value |
//! | 2B   | 2B   | ...  | ...   |
//! ```
//!
//! - Internal pages store the child reference of entry `i` in slot `i` and
//!   repeat it as the 8-byte value of record `i`.
//! - Leaf pages leave the reference slots zeroed and store the application
//!   value in the record.
//! - `offsets[j - 1]` is the start of record `j` relative to the start of the
//!   record area, for `j` in `1..nkeys`. Record 0 always starts at 0.
//!
//! Decoding (`PageView::new`) validates the whole buffer once, so the
//! accessors afterwards only fail on out-of-range indices.

#![allow(clippy::cast_possible_truncation)]

use std::cmp::Ordering;
use std::ops::Range;

use crate::storage::PageRef;

/// Node header size: `type` (2 bytes) + `nkeys` (2 bytes).
pub const HEADER_SIZE: usize = 4;

/// Size of one child reference slot.
pub const REF_SIZE: usize = 8;

/// Size of one entry in the offset table.
pub const OFFSET_SIZE: usize = 2;

/// Record header size: `klen` (2 bytes) + `vlen` (2 bytes).
pub const RECORD_HEADER_SIZE: usize = 4;

/// Largest permitted key.
pub const MAX_KEY_SIZE: usize = 1000;

/// Largest permitted value.
pub const MAX_VAL_SIZE: usize = 3000;

/// Bytes a page needs to hold one record with a maximum key and value.
///
/// Every page size must be at least this large.
pub const MAX_SINGLE_RECORD_PAGE: usize =
    HEADER_SIZE + REF_SIZE + OFFSET_SIZE + RECORD_HEADER_SIZE + MAX_KEY_SIZE + MAX_VAL_SIZE;

/// Node type discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum NodeType {
    Internal = 1,
    Leaf = 2,
}

impl TryFrom<u16> for NodeType {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Internal),
            2 => Ok(Self::Leaf),
            _ => Err(value),
        }
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Internal => write!(f, "internal"),
            Self::Leaf => write!(f, "leaf"),
        }
    }
}

/// What a record carries besides its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload<'a> {
    /// Application value (leaf pages).
    Value(&'a [u8]),
    /// Child page reference (internal pages).
    Child(PageRef),
}

/// Offset of the first byte of the record area for `nkeys` entries.
#[must_use]
pub const fn records_start(nkeys: usize) -> usize {
    HEADER_SIZE + nkeys * REF_SIZE + nkeys.saturating_sub(1) * OFFSET_SIZE
}

/// Encoded size of a single record.
#[must_use]
pub const fn record_size(key_len: usize, value_len: usize) -> usize {
    RECORD_HEADER_SIZE + key_len + value_len
}

/// Encoded size of a page with `nkeys` entries whose records take `record_bytes`.
#[must_use]
pub const fn encoded_size(nkeys: usize, record_bytes: usize) -> usize {
    records_start(nkeys) + record_bytes
}

fn read_u16(data: &[u8], pos: usize) -> u16 {
    u16::from_le_bytes([data[pos], data[pos + 1]])
}

fn read_ref(data: &[u8], pos: usize) -> PageRef {
    let mut bytes = [0u8; REF_SIZE];
    bytes.copy_from_slice(&data[pos..pos + REF_SIZE]);
    PageRef::from_le_bytes(bytes)
}

const fn offset_pos(nkeys: usize, index: usize) -> usize {
    HEADER_SIZE + nkeys * REF_SIZE + (index - 1) * OFFSET_SIZE
}

/// Byte ranges of a well-formed node in which flipping any single bit makes
/// `PageView::new` fail: the node type, the reference slots of an internal
/// node (each must match its record) and the offset array.
pub(crate) fn integrity_checked_ranges(page: &PageView<'_>) -> Vec<Range<usize>> {
    let n = usize::from(page.key_count());
    let mut ranges = vec![0..2];
    if page.node_type() == NodeType::Internal && n > 0 {
        ranges.push(HEADER_SIZE..HEADER_SIZE + n * REF_SIZE);
    }
    if n > 1 {
        ranges.push(offset_pos(n, 1)..records_start(n));
    }
    ranges
}

/// A validated, read-only view of an encoded node.
///
/// The buffer may be longer than the encoded node (a padded page) or exactly
/// as long (a freshly built page that may exceed the page size).
#[derive(Debug, Clone, Copy)]
pub struct PageView<'a> {
    data: &'a [u8],
    node_type: NodeType,
    nkeys: u16,
    /// One past the last byte of the last record.
    records_end: usize,
}

impl<'a> PageView<'a> {
    /// Decode and validate a node buffer.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Corrupt` if the buffer is truncated, carries an
    /// unknown type, has an inconsistent offset table, a record running past
    /// the buffer, an oversized key or value, an internal record whose value
    /// is not its child reference, or keys out of strictly ascending order.
    pub fn new(data: &'a [u8]) -> Result<Self, CodecError> {
        if data.len() < HEADER_SIZE {
            return Err(CodecError::Corrupt(format!(
                "buffer of {} bytes is shorter than the node header",
                data.len()
            )));
        }

        let node_type = NodeType::try_from(read_u16(data, 0))
            .map_err(|v| CodecError::Corrupt(format!("unknown node type {v}")))?;
        let nkeys = read_u16(data, 2);
        let n = usize::from(nkeys);

        let start = records_start(n);
        if start > data.len() {
            return Err(CodecError::Corrupt(format!(
                "{nkeys} entries need {start} bytes of header, buffer has {}",
                data.len()
            )));
        }

        let mut expected = 0usize;
        for i in 0..n {
            let offset = if i == 0 {
                0
            } else {
                usize::from(read_u16(data, offset_pos(n, i)))
            };
            if offset != expected {
                return Err(CodecError::Corrupt(format!(
                    "record {i} starts at {offset}, expected {expected}"
                )));
            }

            let pos = start + offset;
            if pos + RECORD_HEADER_SIZE > data.len() {
                return Err(CodecError::Corrupt(format!(
                    "record {i} header runs past the buffer"
                )));
            }
            let key_len = usize::from(read_u16(data, pos));
            let value_len = usize::from(read_u16(data, pos + 2));
            if key_len > MAX_KEY_SIZE || value_len > MAX_VAL_SIZE {
                return Err(CodecError::Corrupt(format!(
                    "record {i} has klen {key_len} / vlen {value_len} beyond limits"
                )));
            }
            let end = pos + record_size(key_len, value_len);
            if end > data.len() {
                return Err(CodecError::Corrupt(format!(
                    "record {i} runs past the buffer"
                )));
            }

            if node_type == NodeType::Internal {
                if value_len != REF_SIZE {
                    return Err(CodecError::Corrupt(format!(
                        "internal record {i} has a {value_len}-byte value"
                    )));
                }
                let slot = HEADER_SIZE + i * REF_SIZE;
                if data[slot..slot + REF_SIZE] != data[end - REF_SIZE..end] {
                    return Err(CodecError::Corrupt(format!(
                        "internal record {i} disagrees with its reference slot"
                    )));
                }
            }

            expected = end - start;
        }

        let view = Self {
            data,
            node_type,
            nkeys,
            records_end: start + expected,
        };

        for i in 1..nkeys {
            if view.key_unchecked(usize::from(i - 1)) >= view.key_unchecked(usize::from(i)) {
                return Err(CodecError::Corrupt(format!(
                    "key {i} is not greater than key {}",
                    i - 1
                )));
            }
        }

        Ok(view)
    }

    /// The node type.
    #[must_use]
    pub const fn node_type(&self) -> NodeType {
        self.node_type
    }

    /// Whether this is a leaf node.
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.node_type == NodeType::Leaf
    }

    /// Number of entries in the node.
    #[must_use]
    pub const fn key_count(&self) -> u16 {
        self.nkeys
    }

    /// Encoded size in bytes (header, slots, offsets and records).
    #[must_use]
    pub const fn encoded_size(&self) -> usize {
        self.records_end
    }

    /// The encoded bytes, without any page padding.
    #[must_use]
    pub fn encoded_bytes(&self) -> &'a [u8] {
        &self.data[..self.records_end]
    }

    fn check_index(&self, index: u16) -> Result<usize, CodecError> {
        if index >= self.nkeys {
            return Err(CodecError::OutOfBounds {
                index,
                key_count: self.nkeys,
            });
        }
        Ok(usize::from(index))
    }

    fn record_pos(&self, i: usize) -> usize {
        let n = usize::from(self.nkeys);
        let offset = if i == 0 {
            0
        } else {
            usize::from(read_u16(self.data, offset_pos(n, i)))
        };
        records_start(n) + offset
    }

    fn key_unchecked(&self, i: usize) -> &'a [u8] {
        let pos = self.record_pos(i);
        let key_len = usize::from(read_u16(self.data, pos));
        let start = pos + RECORD_HEADER_SIZE;
        &self.data[start..start + key_len]
    }

    fn value_unchecked(&self, i: usize) -> &'a [u8] {
        let pos = self.record_pos(i);
        let key_len = usize::from(read_u16(self.data, pos));
        let value_len = usize::from(read_u16(self.data, pos + 2));
        let start = pos + RECORD_HEADER_SIZE + key_len;
        &self.data[start..start + value_len]
    }

    /// Key of entry `index`.
    pub fn key_at(&self, index: u16) -> Result<&'a [u8], CodecError> {
        let i = self.check_index(index)?;
        Ok(self.key_unchecked(i))
    }

    /// Value bytes of entry `index`.
    ///
    /// For internal nodes this is the little-endian child reference.
    pub fn value_at(&self, index: u16) -> Result<&'a [u8], CodecError> {
        let i = self.check_index(index)?;
        Ok(self.value_unchecked(i))
    }

    /// Child reference of entry `index`.
    pub fn child_ref(&self, index: u16) -> Result<PageRef, CodecError> {
        let i = self.check_index(index)?;
        if self.node_type != NodeType::Internal {
            return Err(CodecError::WrongNodeType {
                expected: NodeType::Internal,
                actual: self.node_type,
            });
        }
        Ok(read_ref(self.data, HEADER_SIZE + i * REF_SIZE))
    }

    /// Encoded size of record `index` (header, key and value).
    pub fn record_len(&self, index: u16) -> Result<usize, CodecError> {
        let i = self.check_index(index)?;
        let end = if i + 1 == usize::from(self.nkeys) {
            self.records_end
        } else {
            self.record_pos(i + 1)
        };
        Ok(end - self.record_pos(i))
    }

    /// Total encoded size of all records.
    #[must_use]
    pub fn record_bytes(&self) -> usize {
        self.records_end - records_start(usize::from(self.nkeys))
    }

    /// Payload of entry `index`, matching the node type.
    pub fn payload_at(&self, index: u16) -> Result<Payload<'a>, CodecError> {
        match self.node_type {
            NodeType::Leaf => self.value_at(index).map(Payload::Value),
            NodeType::Internal => self.child_ref(index).map(Payload::Child),
        }
    }

    /// Compare the key of entry `index` against `key`.
    pub fn compare_key(&self, index: u16, key: &[u8]) -> Result<Ordering, CodecError> {
        Ok(self.key_at(index)?.cmp(key))
    }
}

/// Builds a brand-new node page record by record.
///
/// The header is written up front with the final entry count, so records
/// must be appended in key order and exactly `nkeys` of them must be added
/// before `finish`.
#[derive(Debug)]
pub struct PageBuilder {
    buf: Vec<u8>,
    node_type: NodeType,
    nkeys: u16,
    appended: u16,
}

impl PageBuilder {
    /// Start a page of the given type with `nkeys` entries.
    #[must_use]
    pub fn new(node_type: NodeType, nkeys: u16) -> Self {
        let mut buf = vec![0u8; records_start(usize::from(nkeys))];
        buf[0..2].copy_from_slice(&(node_type as u16).to_le_bytes());
        buf[2..4].copy_from_slice(&nkeys.to_le_bytes());
        Self {
            buf,
            node_type,
            nkeys,
            appended: 0,
        }
    }

    /// Rebuild an existing node byte for byte.
    pub fn copy_of(page: &PageView<'_>) -> Result<Self, CodecError> {
        let mut builder = Self::new(page.node_type(), page.key_count());
        builder.append_range(page, 0..page.key_count())?;
        Ok(builder)
    }

    /// Append the next record.
    ///
    /// # Errors
    ///
    /// - `OutOfBounds` if all `nkeys` records were already appended
    /// - `WrongNodeType` if the payload does not match the node type
    /// - `KeyTooLarge` / `ValueTooLarge` past the record limits
    /// - `RecordAreaOverflow` if the record would start beyond a 16-bit offset
    pub fn append_record(&mut self, key: &[u8], payload: Payload<'_>) -> Result<(), CodecError> {
        if self.appended >= self.nkeys {
            return Err(CodecError::OutOfBounds {
                index: self.appended,
                key_count: self.nkeys,
            });
        }
        if key.len() > MAX_KEY_SIZE {
            return Err(CodecError::KeyTooLarge(key.len()));
        }

        let child_bytes;
        let value: &[u8] = match (self.node_type, payload) {
            (NodeType::Leaf, Payload::Value(value)) => value,
            (NodeType::Internal, Payload::Child(child)) => {
                child_bytes = child.to_le_bytes();
                &child_bytes
            }
            (NodeType::Internal, Payload::Value(_)) => {
                return Err(CodecError::WrongNodeType {
                    expected: NodeType::Internal,
                    actual: NodeType::Leaf,
                });
            }
            (NodeType::Leaf, Payload::Child(_)) => {
                return Err(CodecError::WrongNodeType {
                    expected: NodeType::Leaf,
                    actual: NodeType::Internal,
                });
            }
        };
        if value.len() > MAX_VAL_SIZE {
            return Err(CodecError::ValueTooLarge(value.len()));
        }

        let n = usize::from(self.nkeys);
        let i = usize::from(self.appended);
        let offset = self.buf.len() - records_start(n);

        if i > 0 {
            let relative =
                u16::try_from(offset).map_err(|_| CodecError::RecordAreaOverflow(offset))?;
            let pos = offset_pos(n, i);
            self.buf[pos..pos + OFFSET_SIZE].copy_from_slice(&relative.to_le_bytes());
        }

        if let Payload::Child(child) = payload {
            let slot = HEADER_SIZE + i * REF_SIZE;
            self.buf[slot..slot + REF_SIZE].copy_from_slice(&child.to_le_bytes());
        }

        self.buf.extend_from_slice(&(key.len() as u16).to_le_bytes());
        self.buf.extend_from_slice(&(value.len() as u16).to_le_bytes());
        self.buf.extend_from_slice(key);
        self.buf.extend_from_slice(value);

        self.appended += 1;
        Ok(())
    }

    /// Append entry `index` of `src` unchanged.
    pub fn append_from(&mut self, src: &PageView<'_>, index: u16) -> Result<(), CodecError> {
        self.append_record(src.key_at(index)?, src.payload_at(index)?)
    }

    /// Append entries `range` of `src` unchanged.
    pub fn append_range(&mut self, src: &PageView<'_>, range: Range<u16>) -> Result<(), CodecError> {
        for index in range {
            self.append_from(src, index)?;
        }
        Ok(())
    }

    /// Point an already appended internal entry at a different child.
    pub fn set_child_ref(&mut self, index: u16, child: PageRef) -> Result<(), CodecError> {
        if index >= self.appended {
            return Err(CodecError::OutOfBounds {
                index,
                key_count: self.appended,
            });
        }
        if self.node_type != NodeType::Internal {
            return Err(CodecError::WrongNodeType {
                expected: NodeType::Internal,
                actual: self.node_type,
            });
        }

        let n = usize::from(self.nkeys);
        let i = usize::from(index);
        let bytes = child.to_le_bytes();

        let slot = HEADER_SIZE + i * REF_SIZE;
        self.buf[slot..slot + REF_SIZE].copy_from_slice(&bytes);

        let record = records_start(n)
            + if i == 0 {
                0
            } else {
                usize::from(read_u16(&self.buf, offset_pos(n, i)))
            };
        let key_len = usize::from(read_u16(&self.buf, record));
        let value = record + RECORD_HEADER_SIZE + key_len;
        self.buf[value..value + REF_SIZE].copy_from_slice(&bytes);
        Ok(())
    }

    /// Encoded size of the records appended so far plus the full header.
    #[must_use]
    pub fn encoded_size(&self) -> usize {
        self.buf.len()
    }

    /// Finish the page and return its encoded bytes.
    ///
    /// # Errors
    ///
    /// Returns `Incomplete` if fewer than `nkeys` records were appended.
    pub fn finish(self) -> Result<Vec<u8>, CodecError> {
        if self.appended != self.nkeys {
            return Err(CodecError::Incomplete {
                expected: self.nkeys,
                appended: self.appended,
            });
        }
        Ok(self.buf)
    }
}

/// Errors raised while encoding or decoding a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Entry index beyond the entry count. Always an internal bug.
    OutOfBounds { index: u16, key_count: u16 },
    /// Operation not valid for this node type.
    WrongNodeType { expected: NodeType, actual: NodeType },
    /// Key longer than `MAX_KEY_SIZE`.
    KeyTooLarge(usize),
    /// Value longer than `MAX_VAL_SIZE`.
    ValueTooLarge(usize),
    /// Record area grew past what a 16-bit offset can address.
    RecordAreaOverflow(usize),
    /// More entries than a 16-bit count can hold.
    TooManyEntries(usize),
    /// A node with fewer than two entries cannot be split.
    Unsplittable { key_count: u16 },
    /// `finish` called before all entries were appended.
    Incomplete { expected: u16, appended: u16 },
    /// The buffer is not a valid node.
    Corrupt(String),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OutOfBounds { index, key_count } => {
                write!(f, "index {index} out of bounds ({key_count} entries)")
            }
            Self::WrongNodeType { expected, actual } => {
                write!(f, "expected {expected} node, found {actual}")
            }
            Self::KeyTooLarge(len) => {
                write!(f, "key too large: {len} bytes (max {MAX_KEY_SIZE})")
            }
            Self::ValueTooLarge(len) => {
                write!(f, "value too large: {len} bytes (max {MAX_VAL_SIZE})")
            }
            Self::RecordAreaOverflow(offset) => {
                write!(f, "record offset {offset} does not fit in 16 bits")
            }
            Self::TooManyEntries(count) => write!(f, "{count} entries do not fit in one node"),
            Self::Unsplittable { key_count } => {
                write!(f, "cannot split a node with {key_count} entries")
            }
            Self::Incomplete { expected, appended } => {
                write!(f, "node finished with {appended} of {expected} entries")
            }
            Self::Corrupt(reason) => write!(f, "corrupt node: {reason}"),
        }
    }
}

impl std::error::Error for CodecError {}
