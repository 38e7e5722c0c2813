//! # Copy-on-write B-tree
//!
//! A persistent, order-statistic B-tree keyed by arbitrary byte strings and
//! valued by block [`Address`]es. Nothing is ever modified in place: `put`
//! loads the nodes along the affected path, mutates them in memory, and
//! persists the changed spine as fresh blocks, returning the address of the
//! new root. Unmodified subtrees are shared with previous roots by address.
//!
//! ## Persisted node layout
//!
//! A node with `k` keys is a `BTreeNode` block:
//!
//! ```text
//! payload:   subtree key count (u64) | k (u32) | k × (key_len u16, key, value u64)
//! children:  leaf:     k entries   — child[i] = value address of key i
//!            internal: 2k+1 entries — child[0..=k]   = subtree addresses
//!                                     child[k+1 + i] = value address of key i
//! ```
//!
//! Value addresses live in the child table so that everything a key maps to
//! is reachable from the root through block children — commit relocation and
//! segment reclamation depend on that. The value copy inside the payload is
//! written for lookup-free scans of a node's entries but is authoritative
//! only at persist time; readers resolve values through the child table,
//! which relocation keeps up to date.
//!
//! The subtree key count in the payload makes `count` O(1) and lets a split
//! apportion key counts without loading whole subtrees.
//!
//! ## Ordering and balance
//!
//! Keys are strictly increasing in unsigned-lexicographic order. A node holds
//! at most `2M + 1` keys; an insert that overflows a node splits it at index
//! `M`, promoting the middle key. The tree only ever grows from the root, so
//! all leaves stay at the same depth. There is no delete.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use thiserror::Error;

use crate::store::{Address, BlockType, Reader, ReaderWriter, StoreError};

/// Branching order of production trees: a node holds at most `2M + 1` keys.
pub const M: usize = 15;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by B-tree operations.
#[derive(Debug, Error)]
pub enum BTreeError {
    /// The looked-up key is not present.
    #[error("key not found")]
    NotFound,

    /// Keys must fit the on-disk u16 length prefix.
    #[error("key of {0} bytes is too long")]
    KeyTooLong(usize),

    /// A block did not decode as a valid B-tree node.
    #[error("corrupted b-tree node: {0}")]
    Corruption(String),

    /// Underlying store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

// ------------------------------------------------------------------------------------------------
// Public API
// ------------------------------------------------------------------------------------------------

/// Persists an empty tree and returns its root address.
pub fn create_empty<RW: ReaderWriter + ?Sized>(rw: &mut RW) -> Result<Address, BTreeError> {
    Node::empty_leaf(M).persist(rw)
}

/// Returns the address of a tree equal to the one rooted at `root` with
/// `key` mapped to `value`.
///
/// Inserting an existing key replaces its value without changing the count.
pub fn put<RW: ReaderWriter + ?Sized>(
    rw: &mut RW,
    root: Address,
    key: &[u8],
    value: Address,
) -> Result<Address, BTreeError> {
    put_with_order(rw, root, key, value, M)
}

/// Looks up the value address stored under `key` in the tree at `root`.
pub fn get<R: Reader + ?Sized>(r: &R, root: Address, key: &[u8]) -> Result<Address, BTreeError> {
    Node::stub(root, M).get(r, key)
}

/// Number of keys in the tree at `root`, read in O(1) from the root block.
pub fn count<R: Reader + ?Sized>(r: &R, root: Address) -> Result<u64, BTreeError> {
    let block = r.get_block(root)?;
    if block.block_type() != BlockType::BTreeNode {
        return Err(BTreeError::Corruption(format!(
            "expected a BTreeNode at {root}, found {}",
            block.block_type()
        )));
    }
    let payload = block.payload();
    if payload.len() < 12 {
        return Err(BTreeError::Corruption(format!(
            "node payload of {} bytes is too short",
            payload.len()
        )));
    }
    Ok(u64::from_be_bytes(payload[..8].try_into().unwrap()))
}

/// `put` with an explicit branching order; tests shrink `m` to force splits.
pub(crate) fn put_with_order<RW: ReaderWriter + ?Sized>(
    rw: &mut RW,
    root: Address,
    key: &[u8],
    value: Address,
    m: usize,
) -> Result<Address, BTreeError> {
    let root = Node::stub(root, m);
    let kv = KeyValue {
        key: key.to_vec(),
        value,
    };
    let (mut root, _) = insert_into_btree(rw, root, kv)?;
    root.persist(rw)
}

// ------------------------------------------------------------------------------------------------
// In-memory nodes
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
struct KeyValue {
    key: Vec<u8>,
    value: Address,
}

/// An in-memory node: either a loaded (possibly dirty) node or an address
/// stub for an on-disk subtree that has not been needed yet.
///
/// A nil `address` marks a dirty node that `persist` must write; any
/// mutation clears the addresses along the path from the root, so persisting
/// a clean node is a no-op and unmodified subtrees keep their blocks.
#[derive(Debug)]
struct Node {
    /// Number of keys in this subtree, including this node's.
    count: u64,
    kvs: Vec<KeyValue>,
    /// Empty for leaves.
    children: Vec<Node>,
    address: Address,
    loaded: bool,
    m: usize,
}

struct InsertResult {
    did_insert: bool,
    split: Option<Split>,
}

struct Split {
    middle: KeyValue,
    left: Node,
    right: Node,
}

impl Node {
    fn stub(address: Address, m: usize) -> Node {
        Node {
            count: 0,
            kvs: Vec::new(),
            children: Vec::new(),
            address,
            loaded: false,
            m,
        }
    }

    fn empty_leaf(m: usize) -> Node {
        Node {
            count: 0,
            kvs: Vec::new(),
            children: Vec::new(),
            address: Address::NIL,
            loaded: true,
            m,
        }
    }

    fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    fn max_keys(&self) -> usize {
        2 * self.m + 1
    }

    /// Parses the block at `self.address` into keys, values, and child stubs.
    fn load<R: Reader + ?Sized>(&mut self, r: &R) -> Result<(), BTreeError> {
        if self.loaded {
            return Ok(());
        }

        let block = r.get_block(self.address)?;
        if block.block_type() != BlockType::BTreeNode {
            return Err(BTreeError::Corruption(format!(
                "expected a BTreeNode at {}, found {}",
                self.address,
                block.block_type()
            )));
        }
        let payload = block.payload();
        if payload.len() < 12 {
            return Err(BTreeError::Corruption(format!(
                "node payload of {} bytes is too short",
                payload.len()
            )));
        }

        let count = u64::from_be_bytes(payload[..8].try_into().unwrap());
        let k = u32::from_be_bytes(payload[8..12].try_into().unwrap()) as usize;
        let n = block.n_children();
        let is_leaf = n == k;
        if !is_leaf && n != 2 * k + 1 {
            return Err(BTreeError::Corruption(format!(
                "node with {k} keys has {n} children"
            )));
        }

        let mut kvs = Vec::with_capacity(k);
        let mut offset = 12;
        for i in 0..k {
            if payload.len() < offset + 2 {
                return Err(BTreeError::Corruption("truncated node entry".into()));
            }
            let key_len =
                u16::from_be_bytes(payload[offset..offset + 2].try_into().unwrap()) as usize;
            offset += 2;
            if payload.len() < offset + key_len + 8 {
                return Err(BTreeError::Corruption("truncated node entry".into()));
            }
            let key = payload[offset..offset + key_len].to_vec();
            offset += key_len + 8;

            let value = if is_leaf {
                block.child_address(i)
            } else {
                block.child_address(k + 1 + i)
            };
            kvs.push(KeyValue { key, value });
        }

        self.children = if is_leaf {
            Vec::new()
        } else {
            (0..=k)
                .map(|i| Node::stub(block.child_address(i), self.m))
                .collect()
        };
        self.count = count;
        self.kvs = kvs;
        self.loaded = true;
        Ok(())
    }

    /// Key count of this subtree without loading the whole node.
    fn subtree_count<R: Reader + ?Sized>(&self, r: &R) -> Result<u64, BTreeError> {
        if self.loaded {
            return Ok(self.count);
        }
        count(r, self.address)
    }

    fn get<R: Reader + ?Sized>(mut self, r: &R, key: &[u8]) -> Result<Address, BTreeError> {
        self.load(r)?;
        match self.kvs.binary_search_by(|kv| kv.key.as_slice().cmp(key)) {
            Ok(i) => Ok(self.kvs[i].value),
            Err(_) if self.is_leaf() => Err(BTreeError::NotFound),
            Err(i) => self.children.swap_remove(i).get(r, key),
        }
    }

    /// Inserts `kv` into the subtree, splitting on overflow.
    ///
    /// On a split the returned halves replace this node at the caller; the
    /// node itself is left hollow.
    fn insert<R: Reader + ?Sized>(&mut self, r: &R, kv: KeyValue) -> Result<InsertResult, BTreeError> {
        self.load(r)?;
        self.address = Address::NIL;

        let i = match self
            .kvs
            .binary_search_by(|probe| probe.key.as_slice().cmp(kv.key.as_slice()))
        {
            Ok(i) => {
                self.kvs[i].value = kv.value;
                return Ok(InsertResult {
                    did_insert: false,
                    split: None,
                });
            }
            Err(i) => i,
        };

        let did_insert = if self.is_leaf() {
            self.kvs.insert(i, kv);
            true
        } else {
            let child = self.children[i].insert(r, kv)?;
            if let Some(split) = child.split {
                self.kvs.insert(i, split.middle);
                self.children[i] = split.left;
                self.children.insert(i + 1, split.right);
            }
            child.did_insert
        };

        if did_insert {
            self.count += 1;
        }
        Ok(InsertResult {
            did_insert,
            split: self.split_if_overflowing(r)?,
        })
    }

    fn split_if_overflowing<R: Reader + ?Sized>(
        &mut self,
        r: &R,
    ) -> Result<Option<Split>, BTreeError> {
        if self.kvs.len() <= self.max_keys() {
            return Ok(None);
        }

        let m = self.m;
        let middle = self.kvs.remove(m);
        let right_kvs = self.kvs.split_off(m);
        let left_kvs = std::mem::take(&mut self.kvs);

        let (left_children, right_children) = if self.is_leaf() {
            (Vec::new(), Vec::new())
        } else {
            let right_children = self.children.split_off(m + 1);
            (std::mem::take(&mut self.children), right_children)
        };

        let mut left = Node {
            count: 0,
            kvs: left_kvs,
            children: left_children,
            address: Address::NIL,
            loaded: true,
            m,
        };
        let mut left_count = left.kvs.len() as u64;
        for child in &left.children {
            left_count += child.subtree_count(r)?;
        }
        left.count = left_count;

        let right = Node {
            count: self.count - left_count - 1,
            kvs: right_kvs,
            children: right_children,
            address: Address::NIL,
            loaded: true,
            m,
        };

        Ok(Some(Split {
            middle,
            left,
            right,
        }))
    }

    /// Writes this node and any dirty descendants, post-order, and returns
    /// the node's address. Clean subtrees are left untouched.
    fn persist<RW: ReaderWriter + ?Sized>(&mut self, rw: &mut RW) -> Result<Address, BTreeError> {
        if !self.address.is_nil() {
            return Ok(self.address);
        }

        let mut subtree_addresses = Vec::with_capacity(self.children.len());
        for child in &mut self.children {
            subtree_addresses.push(child.persist(rw)?);
        }

        let k = self.kvs.len();
        let mut payload_len = 12;
        for kv in &self.kvs {
            if kv.key.len() > u16::MAX as usize {
                return Err(BTreeError::KeyTooLong(kv.key.len()));
            }
            payload_len += 2 + kv.key.len() + 8;
        }
        let n_children = if self.is_leaf() { k } else { 2 * k + 1 };

        let mut writer = rw.append_block(BlockType::BTreeNode, n_children, payload_len)?;
        {
            let payload = writer.payload_mut();
            payload[..8].copy_from_slice(&self.count.to_be_bytes());
            payload[8..12].copy_from_slice(&(k as u32).to_be_bytes());
            let mut offset = 12;
            for kv in &self.kvs {
                payload[offset..offset + 2]
                    .copy_from_slice(&(kv.key.len() as u16).to_be_bytes());
                offset += 2;
                payload[offset..offset + kv.key.len()].copy_from_slice(&kv.key);
                offset += kv.key.len();
                payload[offset..offset + 8].copy_from_slice(&kv.value.raw().to_be_bytes());
                offset += 8;
            }
        }

        let value_base = if self.is_leaf() {
            0
        } else {
            for (i, subtree) in subtree_addresses.into_iter().enumerate() {
                rw.set_child(&writer, i, subtree)?;
            }
            k + 1
        };
        for (i, kv) in self.kvs.iter().enumerate() {
            rw.set_child(&writer, value_base + i, kv.value)?;
        }

        self.address = writer.address();
        Ok(self.address)
    }
}

/// Top-level insert: grows a new root when the old one splits.
fn insert_into_btree<R: Reader + ?Sized>(
    r: &R,
    mut node: Node,
    kv: KeyValue,
) -> Result<(Node, bool), BTreeError> {
    let m = node.m;
    let result = node.insert(r, kv)?;
    match result.split {
        None => Ok((node, result.did_insert)),
        Some(split) => {
            let count = split.left.count + 1 + split.right.count;
            let root = Node {
                count,
                kvs: vec![split.middle],
                children: vec![split.left, split.right],
                address: Address::NIL,
                loaded: true,
                m,
            };
            Ok((root, result.did_insert))
        }
    }
}
