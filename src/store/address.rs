//! Block addresses and block kinds.
//!
//! Every block in the store is identified by a 64-bit [`Address`] in a single,
//! monotonically increasing global address space that spans all segment files.
//! Address `0` is reserved as the nil address. Addresses at or above
//! [`Address::STAGING_BASE`] belong to the per-transaction staging segment and
//! never appear in a committed tree.

use std::fmt;

/// 64-bit block address.
///
/// The address of a block equals `segment_start_address + (file_offset - 16)`,
/// so addresses are dense within a segment and segments cover disjoint,
/// contiguous ranges.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(u64);

impl Address {
    /// The reserved nil address.
    pub const NIL: Address = Address(0);

    /// Base address of the write transaction's staging segment.
    ///
    /// Chosen to lie above any realistic store-assigned address so that
    /// "lives in the staging segment" is a single comparison.
    pub const STAGING_BASE: Address = Address(0xff00_0000_0000_0000);

    pub const fn new(raw: u64) -> Address {
        Address(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn is_nil(self) -> bool {
        self.0 == 0
    }

    /// Whether this address belongs to a staging segment.
    pub const fn in_staging(self) -> bool {
        self.0 >= Self::STAGING_BASE.0
    }

    /// The address `n` bytes past this one.
    pub(crate) const fn offset(self, n: u64) -> Address {
        Address(self.0 + n)
    }

    /// Distance in bytes from `base` to this address.
    ///
    /// Callers guarantee `base <= self`.
    pub(crate) const fn distance_from(self, base: Address) -> u64 {
        self.0 - base.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.0)
    }
}

/// Kind tag carried in every block header.
///
/// The set of block kinds is closed; unknown tags decode as
/// [`BlockType::Undefined`] and are rejected wherever a specific kind is
/// required.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockType {
    Undefined = 0,
    /// Reserved, not produced by any operation.
    Commit = 1,
    /// Raw chunk of a data stream. No children.
    DataLeaf = 2,
    /// Interior node of a data stream; children concatenate to the stream.
    DataNode = 3,
    /// Persisted B-tree node.
    BTreeNode = 4,
}

impl BlockType {
    pub fn from_u8(tag: u8) -> BlockType {
        match tag {
            1 => BlockType::Commit,
            2 => BlockType::DataLeaf,
            3 => BlockType::DataNode,
            4 => BlockType::BTreeNode,
            _ => BlockType::Undefined,
        }
    }
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BlockType::Undefined => "Undefined",
            BlockType::Commit => "Commit",
            BlockType::DataLeaf => "DataLeaf",
            BlockType::DataNode => "DataNode",
            BlockType::BTreeNode => "BTreeNode",
        };
        f.write_str(name)
    }
}
