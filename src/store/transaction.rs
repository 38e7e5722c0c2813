//! Read and write transactions.
//!
//! A read transaction is a snapshot: it captures the committed root and the
//! end offset of every segment at creation time and serves lookups from that
//! frozen view. Because commits only append, and segments are only unlinked
//! once nothing at or above the committed root's lowest descendant address
//! can reference them, a snapshot stays readable for its whole lifetime even
//! across concurrent commits — the `Arc` on each segment keeps the mapping
//! alive after the file is gone.
//!
//! A write transaction owns a private staging segment (`tx` in the store
//! directory) based at [`Address::STAGING_BASE`]. All new blocks land there;
//! lookups read through to the main store. On commit, every block reachable
//! from the new root that lives in staging is copied forward into the tail
//! segment with its child addresses remapped, and the relocated root is
//! handed to the store for publication. On rollback (explicit or by drop) the
//! staging segment is simply deleted.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use super::address::{Address, BlockType};
use super::block::{self, BlockReader, BlockWriter};
use super::context::Context;
use super::segment::Segment;
use super::{Reader, ReaderWriter, StoreError, StoreShared};

/// A segment plus the end address visible to one transaction.
#[derive(Clone)]
pub(crate) struct SegmentView {
    pub segment: Arc<Segment>,
    pub end: Address,
}

impl SegmentView {
    pub fn capture(segment: &Arc<Segment>) -> SegmentView {
        SegmentView {
            segment: Arc::clone(segment),
            end: segment.end_address(),
        }
    }

    fn get_block(&self, address: Address) -> Option<Result<BlockReader<'_>, StoreError>> {
        self.segment
            .contains(address, self.end)
            .then(|| self.segment.block_at(address, self.end))
    }
}

fn lookup(views: &[SegmentView], address: Address) -> Result<BlockReader<'_>, StoreError> {
    for view in views {
        if let Some(block) = view.get_block(address) {
            return block;
        }
    }
    Err(StoreError::NotFound(address))
}

// ------------------------------------------------------------------------------------------------
// ReadTransaction
// ------------------------------------------------------------------------------------------------

/// Immutable snapshot of the store at one committed root.
pub struct ReadTransaction {
    root: Address,
    segments: Vec<SegmentView>,
}

impl ReadTransaction {
    pub(crate) fn new(root: Address, segments: Vec<SegmentView>) -> ReadTransaction {
        ReadTransaction { root, segments }
    }

    /// The committed root observed when this snapshot was taken.
    pub fn root(&self) -> Address {
        self.root
    }
}

impl Reader for ReadTransaction {
    fn get_block(&self, address: Address) -> Result<BlockReader<'_>, StoreError> {
        lookup(&self.segments, address)
    }
}

// ------------------------------------------------------------------------------------------------
// WriteTransaction
// ------------------------------------------------------------------------------------------------

/// The store's single active write transaction.
pub struct WriteTransaction {
    shared: Arc<StoreShared>,
    staging: Arc<Segment>,
    main: Vec<SegmentView>,
    ctx: Context,
    finished: bool,
}

impl WriteTransaction {
    pub(crate) fn new(
        shared: Arc<StoreShared>,
        staging: Arc<Segment>,
        main: Vec<SegmentView>,
        ctx: Context,
    ) -> WriteTransaction {
        WriteTransaction {
            shared,
            staging,
            main,
            ctx,
            finished: false,
        }
    }

    /// Commits the tree rooted at `root` and returns the address the root was
    /// relocated to in the main store.
    ///
    /// If `root` lies below the staging base nothing new is referenced and
    /// the address is published as-is; otherwise the reachable staging blocks
    /// are copied forward first. Either way the store then runs roll-forward
    /// compaction, flushes the tail segment, and publishes the commit
    /// address. On error the previously committed state is untouched.
    pub fn commit(mut self, root: Address) -> Result<Address, StoreError> {
        self.finished = true;
        let outcome = self.shared.commit_root(&self.staging, root);
        if let Err(err) = self.staging.remove_file() {
            warn!(error = %err, "failed to remove staging segment after commit");
        }
        self.shared.release_writer();
        outcome
    }

    /// Discards everything written by this transaction.
    pub fn rollback(mut self) -> Result<(), StoreError> {
        self.finished = true;
        debug!("rolling back write transaction");
        let outcome = self.staging.remove_file();
        self.shared.release_writer();
        outcome
    }
}

impl Drop for WriteTransaction {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        debug!("write transaction dropped without commit; rolling back");
        if let Err(err) = self.staging.remove_file() {
            warn!(error = %err, "failed to remove staging segment on drop");
        }
        self.shared.release_writer();
    }
}

impl Reader for WriteTransaction {
    /// Looks up a block in the staging segment first, then the main store.
    fn get_block(&self, address: Address) -> Result<BlockReader<'_>, StoreError> {
        self.ctx.check()?;
        if address.in_staging() {
            return self.staging.block_at(address, self.staging.end_address());
        }
        lookup(&self.main, address)
    }
}

impl ReaderWriter for WriteTransaction {
    fn append_block(
        &mut self,
        block_type: BlockType,
        n_children: usize,
        data_size: usize,
    ) -> Result<BlockWriter, StoreError> {
        self.ctx.check()?;
        if n_children > block::MAX_CHILDREN {
            return Err(StoreError::InvalidArgument(format!(
                "block can't have more than {} children",
                block::MAX_CHILDREN
            )));
        }
        let block_size = block::block_size_for(n_children, data_size);
        if block_size > block::MAX_BLOCK_SIZE {
            return Err(StoreError::InvalidArgument(format!(
                "block of {block_size} bytes is too large"
            )));
        }

        let (address, ptr) = self.staging.append_block(block_size)?;
        Ok(BlockWriter::init(
            address,
            ptr,
            block_size as usize,
            block_type,
            n_children,
        ))
    }

    fn set_child(
        &mut self,
        writer: &BlockWriter,
        i: usize,
        child: Address,
    ) -> Result<(), StoreError> {
        block::set_child_via(writer, i, child, |address| {
            let block = self.get_block(address)?;
            Ok((block.used_data_size(), block.lowest_descendant_address()))
        })
    }
}

// ------------------------------------------------------------------------------------------------
// Relocation
// ------------------------------------------------------------------------------------------------

/// Read view used during commit: the live main segments plus, while copying
/// forward, the staging segment.
pub(crate) struct CommitView<'a> {
    pub segments: &'a [Arc<Segment>],
    pub staging: Option<&'a Segment>,
}

impl CommitView<'_> {
    pub fn get_block(&self, address: Address) -> Result<BlockReader<'_>, StoreError> {
        if address.in_staging() {
            if let Some(staging) = self.staging {
                return staging.block_at(address, staging.end_address());
            }
            return Err(StoreError::NotFound(address));
        }
        for segment in self.segments {
            let end = segment.end_address();
            if segment.contains(address, end) {
                return segment.block_at(address, end);
            }
        }
        Err(StoreError::NotFound(address))
    }

    fn meta(&self, address: Address) -> Result<(u64, Address), StoreError> {
        let block = self.get_block(address)?;
        Ok((block.used_data_size(), block.lowest_descendant_address()))
    }
}

/// Post-order relocation of the subtree at `address` into `tail`.
///
/// Blocks for which `needs_copy` returns false keep their address; everything
/// else is re-appended with the same type and payload and a child table
/// remapped through the recursion, so the codec recomputes `used_data_size`
/// and `lowest_descendant_address` for the copies. The memo keeps shared
/// subtrees from being copied more than once.
pub(crate) fn relocate<F>(
    view: &CommitView<'_>,
    tail: &Segment,
    address: Address,
    memo: &mut HashMap<Address, Address>,
    needs_copy: &F,
) -> Result<Address, StoreError>
where
    F: Fn(Address, &BlockReader<'_>) -> bool,
{
    if address.is_nil() {
        return Ok(address);
    }
    if let Some(&relocated) = memo.get(&address) {
        return Ok(relocated);
    }

    let (block_type, n_children, payload, children) = {
        let block = view.get_block(address)?;
        if !needs_copy(address, &block) {
            memo.insert(address, address);
            return Ok(address);
        }
        (
            block.block_type(),
            block.n_children(),
            block.payload().to_vec(),
            block.children().collect::<Vec<_>>(),
        )
    };

    let mut relocated_children = Vec::with_capacity(children.len());
    for child in children {
        relocated_children.push(relocate(view, tail, child, memo, needs_copy)?);
    }

    let block_size = block::block_size_for(n_children, payload.len());
    let (new_address, ptr) = tail.append_block(block_size)?;
    let mut writer = BlockWriter::init(new_address, ptr, block_size as usize, block_type, n_children);
    writer.payload_mut().copy_from_slice(&payload);
    for (i, child) in relocated_children.into_iter().enumerate() {
        if child.is_nil() {
            continue;
        }
        block::set_child_via(&writer, i, child, |a| view.meta(a))?;
    }

    memo.insert(address, new_address);
    Ok(new_address)
}
