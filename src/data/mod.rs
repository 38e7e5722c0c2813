//! # Chunked data streams
//!
//! Arbitrary byte strings are stored as a fan-out tree of blocks: the bytes
//! are cut into `DataLeaf` blocks of at most `leaf_size` bytes, and every
//! `fanout` adjacent subtrees are gathered under a `DataNode` whose payload
//! records the total byte size underneath it. The in-order concatenation of
//! the leaves is the stored byte string. A stream that fits a single leaf is
//! just that leaf — no interior node is created.
//!
//! [`DataWriter`] builds the tree incrementally while bytes stream in,
//! keeping one pending level per tree depth; [`DataReader`] walks the tree
//! back-to-front with a cursor path and implements [`std::io::Read`].

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::io;

use thiserror::Error;

use crate::store::{Address, BlockType, Reader, ReaderWriter, StoreError};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by data stream operations.
#[derive(Debug, Error)]
pub enum DataError {
    /// A block in the stream tree is not what the structure promises.
    #[error("malformed data stream: {0}")]
    Malformed(String),

    /// Writer parameters out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Underlying store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

// ------------------------------------------------------------------------------------------------
// Writer
// ------------------------------------------------------------------------------------------------

/// Streaming writer producing the fan-out tree of a byte string.
pub struct DataWriter<'a, RW: ?Sized> {
    rw: &'a mut RW,
    leaf_size: usize,
    fanout: usize,
    /// Bytes not yet flushed into a leaf.
    pending: Vec<u8>,
    /// Per-depth pending subtrees as `(address, byte size)`; level 0 holds
    /// leaves.
    levels: Vec<Vec<(Address, u64)>>,
}

impl<'a, RW: ReaderWriter + ?Sized> DataWriter<'a, RW> {
    /// Creates a writer cutting leaves of `leaf_size` bytes under nodes of
    /// `fanout` children.
    pub fn new(rw: &'a mut RW, leaf_size: usize, fanout: usize) -> Result<Self, DataError> {
        if leaf_size == 0 {
            return Err(DataError::InvalidArgument("leaf size must be positive".into()));
        }
        if !(2..=255).contains(&fanout) {
            return Err(DataError::InvalidArgument(format!(
                "fanout {fanout} outside of [2, 255]"
            )));
        }
        Ok(DataWriter {
            rw,
            leaf_size,
            fanout,
            pending: Vec::new(),
            levels: Vec::new(),
        })
    }

    /// Buffers `bytes`, flushing complete leaves as they fill up.
    pub fn write(&mut self, bytes: &[u8]) -> Result<usize, DataError> {
        self.pending.extend_from_slice(bytes);
        while self.pending.len() >= self.leaf_size {
            let rest = self.pending.split_off(self.leaf_size);
            let leaf = std::mem::replace(&mut self.pending, rest);
            self.flush_leaf(&leaf)?;
        }
        Ok(bytes.len())
    }

    /// Flushes everything pending and returns the stream's root address.
    pub fn finish(mut self) -> Result<Address, DataError> {
        if !self.pending.is_empty() {
            let leaf = std::mem::take(&mut self.pending);
            self.flush_leaf(&leaf)?;
        }

        // Nothing was ever written: the stream is one empty leaf.
        if self.levels.is_empty() {
            let writer = self.rw.append_block(BlockType::DataLeaf, 0, 0)?;
            return Ok(writer.address());
        }

        // Drain pending levels bottom-up. A level holding a single subtree
        // with nothing above it is the root itself — in particular a stream
        // that fits one leaf stays a bare DataLeaf.
        let mut level = 0;
        loop {
            let entries = std::mem::take(&mut self.levels[level]);
            let is_top = level + 1 == self.levels.len();
            if entries.is_empty() {
                level += 1;
                continue;
            }
            if is_top && entries.len() == 1 {
                return Ok(entries[0].0);
            }
            let node = self.flush_node(&entries)?;
            if is_top {
                self.levels.push(Vec::new());
            }
            self.levels[level + 1].push(node);
            level += 1;
        }
    }

    fn flush_leaf(&mut self, bytes: &[u8]) -> Result<(), DataError> {
        let mut writer = self.rw.append_block(BlockType::DataLeaf, 0, bytes.len())?;
        writer.payload_mut().copy_from_slice(bytes);
        self.push_subtree(0, (writer.address(), bytes.len() as u64))
    }

    /// Records a finished subtree at `level`, collapsing the level into a
    /// `DataNode` once it reaches the fanout.
    fn push_subtree(&mut self, level: usize, entry: (Address, u64)) -> Result<(), DataError> {
        if self.levels.len() <= level {
            self.levels.push(Vec::new());
        }
        self.levels[level].push(entry);
        if self.levels[level].len() == self.fanout {
            let entries = std::mem::take(&mut self.levels[level]);
            let node = self.flush_node(&entries)?;
            self.push_subtree(level + 1, node)?;
        }
        Ok(())
    }

    fn flush_node(&mut self, entries: &[(Address, u64)]) -> Result<(Address, u64), DataError> {
        let total: u64 = entries.iter().map(|(_, size)| size).sum();
        let mut writer = self.rw.append_block(BlockType::DataNode, entries.len(), 8)?;
        writer.payload_mut().copy_from_slice(&total.to_be_bytes());
        for (i, (address, _)) in entries.iter().enumerate() {
            self.rw.set_child(&writer, i, *address)?;
        }
        Ok((writer.address(), total))
    }
}

/// Stores `bytes` as one data stream and returns its root address.
pub fn store_data<RW: ReaderWriter + ?Sized>(
    rw: &mut RW,
    bytes: &[u8],
    leaf_size: usize,
    fanout: usize,
) -> Result<Address, DataError> {
    let mut writer = DataWriter::new(rw, leaf_size, fanout)?;
    writer.write(bytes)?;
    writer.finish()
}

// ------------------------------------------------------------------------------------------------
// Reader
// ------------------------------------------------------------------------------------------------

/// Sequential reader over a stored data stream.
///
/// Keeps a cursor path of child indices from the root down to the current
/// leaf's parent; advancing past the end of a node resets its index and
/// increments the parent's, like a multi-digit counter.
pub struct DataReader<'a, R: ?Sized> {
    r: &'a R,
    root: Address,
    path: Vec<usize>,
    current: &'a [u8],
}

impl<'a, R: ?Sized> std::fmt::Debug for DataReader<'a, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataReader")
            .field("root", &self.root)
            .field("path", &self.path)
            .field("current", &self.current)
            .finish()
    }
}

impl<'a, R: Reader + ?Sized> DataReader<'a, R> {
    /// Positions a reader at the first leaf of the stream rooted at `root`.
    pub fn new(root: Address, r: &'a R) -> Result<Self, DataError> {
        let mut reader = DataReader {
            r,
            root,
            path: Vec::new(),
            current: &[],
        };
        reader.first_block()?;
        Ok(reader)
    }

    fn first_block(&mut self) -> Result<(), DataError> {
        let mut address = self.root;
        loop {
            let block = self.r.get_block(address)?;
            match block.block_type() {
                BlockType::DataNode => {
                    if block.n_children() == 0 {
                        return Err(DataError::Malformed(format!(
                            "data node at {address} has no children"
                        )));
                    }
                    self.path.push(0);
                    address = block.child_address(0);
                }
                BlockType::DataLeaf => {
                    self.current = block.payload();
                    return Ok(());
                }
                other => {
                    return Err(DataError::Malformed(format!(
                        "unexpected {other} block at {address} in data stream"
                    )));
                }
            }
        }
    }

    /// Advances to the next leaf; returns false at the end of the stream.
    fn next_block(&mut self) -> Result<bool, DataError> {
        let Some(last) = self.path.last_mut() else {
            // Single-leaf stream: nothing after the first block.
            return Ok(false);
        };
        *last += 1;

        let mut address = self.root;
        let mut depth = 0;
        loop {
            let block = self.r.get_block(address)?;
            match block.block_type() {
                BlockType::DataNode => {
                    if block.n_children() == 0 {
                        return Err(DataError::Malformed(format!(
                            "data node at {address} has no children"
                        )));
                    }
                    if depth >= self.path.len() {
                        return Err(DataError::Malformed(
                            "data stream deeper than its first branch".into(),
                        ));
                    }
                    let index = self.path[depth];
                    if index >= block.n_children() {
                        if depth == 0 {
                            return Ok(false);
                        }
                        // Carry into the parent level and retry from the root.
                        self.path[depth] = 0;
                        self.path[depth - 1] += 1;
                        address = self.root;
                        depth = 0;
                        continue;
                    }
                    address = block.child_address(index);
                    depth += 1;
                }
                BlockType::DataLeaf => {
                    self.current = block.payload();
                    return Ok(true);
                }
                other => {
                    return Err(DataError::Malformed(format!(
                        "unexpected {other} block at {address} in data stream"
                    )));
                }
            }
        }
    }
}

impl<R: Reader + ?Sized> io::Read for DataReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.current.is_empty() {
            match self.next_block() {
                Ok(true) => {}
                Ok(false) => return Ok(0),
                Err(err) => return Err(io::Error::new(io::ErrorKind::InvalidData, err)),
            }
        }
        let n = buf.len().min(self.current.len());
        buf[..n].copy_from_slice(&self.current[..n]);
        self.current = &self.current[n..];
        Ok(n)
    }
}
