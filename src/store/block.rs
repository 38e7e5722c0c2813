//! Block codec.
//!
//! A block is the universal addressable unit of the store. The header is
//! packed big-endian:
//!
//! ```text
//! offset  size  field
//! 0       2     block_size                   total block length in bytes
//! 2       8     used_data_size               bytes reachable from this block
//! 10      8     lowest_descendant_address    min address of self + descendants
//! 18      1     type
//! 19      1     n_children
//! 20      8*N   child_addresses              NIL when unset
//! 20+8N   ...   payload
//! ```
//!
//! [`BlockReader`] is a zero-copy view over mmapped bytes; decoding only
//! validates the size fields and bounds the slice. [`BlockWriter`] is a handle
//! to a freshly appended block that is still mutable — blocks become immutable
//! once the transaction that created them commits.

use std::fmt;

use super::address::{Address, BlockType};
use super::StoreError;

/// Fixed header length before the child table.
pub(crate) const HEADER_SIZE: usize = 20;

/// A block, including its header, never exceeds `u16::MAX` bytes.
pub(crate) const MAX_BLOCK_SIZE: u64 = u16::MAX as u64;

/// The child count is stored in a single byte.
pub(crate) const MAX_CHILDREN: usize = 255;

const USED_DATA_OFFSET: usize = 2;
const LOWEST_DESCENDANT_OFFSET: usize = 10;
const TYPE_OFFSET: usize = 18;
const N_CHILDREN_OFFSET: usize = 19;

/// Total encoded size of a block with the given shape.
pub(crate) fn block_size_for(n_children: usize, data_size: usize) -> u64 {
    (HEADER_SIZE + 8 * n_children + data_size) as u64
}

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes(bytes[offset..offset + 2].try_into().unwrap())
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    u64::from_be_bytes(bytes[offset..offset + 8].try_into().unwrap())
}

// ------------------------------------------------------------------------------------------------
// BlockReader
// ------------------------------------------------------------------------------------------------

/// Zero-copy read view of an encoded block.
#[derive(Clone, Copy)]
pub struct BlockReader<'a> {
    bytes: &'a [u8],
}

impl<'a> BlockReader<'a> {
    /// Decodes a block at the start of `bytes`.
    ///
    /// `bytes` may extend past the block; the view is truncated to the
    /// declared `block_size`.
    pub fn new(bytes: &'a [u8]) -> Result<BlockReader<'a>, StoreError> {
        if bytes.len() < HEADER_SIZE {
            return Err(StoreError::Corruption(format!(
                "block data is too short: {} bytes",
                bytes.len()
            )));
        }

        let block_size = read_u16(bytes, 0) as usize;
        if block_size > bytes.len() {
            return Err(StoreError::Corruption(format!(
                "block size {} exceeds available {} bytes",
                block_size,
                bytes.len()
            )));
        }

        let n_children = bytes[N_CHILDREN_OFFSET] as usize;
        if HEADER_SIZE + 8 * n_children > block_size {
            return Err(StoreError::Corruption(format!(
                "block size {block_size} is too small for {n_children} children"
            )));
        }

        Ok(BlockReader {
            bytes: &bytes[..block_size],
        })
    }

    pub fn block_size(&self) -> u64 {
        read_u16(self.bytes, 0) as u64
    }

    /// Bytes reachable from this block: its own size plus the
    /// `used_data_size` of every child subtree.
    pub fn used_data_size(&self) -> u64 {
        read_u64(self.bytes, USED_DATA_OFFSET)
    }

    /// Minimum address across this block and all of its descendants.
    pub fn lowest_descendant_address(&self) -> Address {
        Address::new(read_u64(self.bytes, LOWEST_DESCENDANT_OFFSET))
    }

    pub fn block_type(&self) -> BlockType {
        BlockType::from_u8(self.bytes[TYPE_OFFSET])
    }

    pub fn n_children(&self) -> usize {
        self.bytes[N_CHILDREN_OFFSET] as usize
    }

    /// Address of child `i`.
    ///
    /// # Panics
    ///
    /// Panics if `i >= n_children()`, like an out-of-bounds slice index.
    pub fn child_address(&self, i: usize) -> Address {
        assert!(
            i < self.n_children(),
            "child index {i} out of bounds for block with {} children",
            self.n_children()
        );
        Address::new(read_u64(self.bytes, HEADER_SIZE + 8 * i))
    }

    /// Iterator over the child table.
    pub fn children(&self) -> impl Iterator<Item = Address> + 'a {
        let bytes = self.bytes;
        let n = self.n_children();
        (0..n).map(move |i| Address::new(read_u64(bytes, HEADER_SIZE + 8 * i)))
    }

    /// Kind-specific payload bytes after the child table.
    pub fn payload(&self) -> &'a [u8] {
        &self.bytes[HEADER_SIZE + 8 * self.n_children()..]
    }
}

impl fmt::Debug for BlockReader<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockReader")
            .field("block_size", &self.block_size())
            .field("type", &self.block_type())
            .field("n_children", &self.n_children())
            .field("used_data_size", &self.used_data_size())
            .field(
                "lowest_descendant_address",
                &self.lowest_descendant_address(),
            )
            .finish()
    }
}

// ------------------------------------------------------------------------------------------------
// BlockWriter
// ------------------------------------------------------------------------------------------------

/// Handle to a freshly appended, still-mutable block.
///
/// The writer aliases a reserved window of the segment mmap. The window was
/// reserved exclusively for this block by `Segment::append_block` and is
/// never handed out twice, so reads and writes through the raw pointer cannot
/// alias another block. Child-table updates go through
/// `WriteTransaction::set_child` (or the commit relocation path) because they
/// need a read view to fetch child metadata.
pub struct BlockWriter {
    address: Address,
    ptr: *mut u8,
    len: usize,
}

impl BlockWriter {
    /// Encodes a fresh header into the window reserved at `address`.
    ///
    /// `used_data_size` starts at the total block size and
    /// `lowest_descendant_address` at the block's own address; both are
    /// maintained incrementally by [`set_child_via`]. The child table is
    /// zero (= nil) because append windows are never reused.
    pub(crate) fn init(
        address: Address,
        ptr: *mut u8,
        len: usize,
        block_type: BlockType,
        n_children: usize,
    ) -> BlockWriter {
        let bw = BlockWriter { address, ptr, len };
        {
            let bytes = bw.bytes_mut();
            bytes[0..2].copy_from_slice(&(len as u16).to_be_bytes());
            bytes[USED_DATA_OFFSET..USED_DATA_OFFSET + 8]
                .copy_from_slice(&(len as u64).to_be_bytes());
            bytes[LOWEST_DESCENDANT_OFFSET..LOWEST_DESCENDANT_OFFSET + 8]
                .copy_from_slice(&address.raw().to_be_bytes());
            bytes[TYPE_OFFSET] = block_type as u8;
            bytes[N_CHILDREN_OFFSET] = n_children as u8;
        }
        bw
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Read view over the block being written.
    pub fn reader(&self) -> BlockReader<'_> {
        BlockReader {
            bytes: unsafe { std::slice::from_raw_parts(self.ptr, self.len) },
        }
    }

    /// Mutable kind-specific payload slice.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let start = HEADER_SIZE + 8 * self.reader().n_children();
        &mut self.bytes_mut()[start..]
    }

    fn bytes_mut(&self) -> &mut [u8] {
        // The window is exclusively owned by this writer; see the type docs.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    fn write_u64(&self, offset: usize, value: u64) {
        self.bytes_mut()[offset..offset + 8].copy_from_slice(&value.to_be_bytes());
    }
}

/// Links child `i` of `bw` to `child`, keeping the derived header fields
/// consistent.
///
/// `meta` resolves an address to the `(used_data_size,
/// lowest_descendant_address)` of the block stored there; it must see both
/// staging and main-store blocks, which is why callers pass their own read
/// view instead of the codec reaching for one.
pub(crate) fn set_child_via<F>(
    bw: &BlockWriter,
    i: usize,
    child: Address,
    mut meta: F,
) -> Result<(), StoreError>
where
    F: FnMut(Address) -> Result<(u64, Address), StoreError>,
{
    let n_children = bw.reader().n_children();
    if i >= n_children {
        return Err(StoreError::InvalidArgument(format!(
            "child index {i} out of bounds for block with {n_children} children"
        )));
    }

    let mut used = bw.reader().used_data_size();

    let old = bw.reader().child_address(i);
    if !old.is_nil() {
        let (old_used, _) = meta(old)?;
        used -= old_used;
    }

    bw.write_u64(HEADER_SIZE + 8 * i, child.raw());

    if !child.is_nil() {
        let (child_used, _) = meta(child)?;
        used += child_used;
    }
    bw.write_u64(USED_DATA_OFFSET, used);

    let mut lowest = bw.address();
    for c in bw.reader().children() {
        if c.is_nil() {
            continue;
        }
        let (_, child_lowest) = meta(c)?;
        lowest = lowest.min(child_lowest);
    }
    bw.write_u64(LOWEST_DESCENDANT_OFFSET, lowest.raw());

    Ok(())
}
