//! # Segment/Block Store
//!
//! This module implements the on-disk storage layer: an **append-only**,
//! **mmap-backed** block store with a single-writer / multi-reader
//! transaction model and **roll-forward compaction**.
//!
//! ## Design Overview
//!
//! The store is a directory of segment files plus one commit-address file:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                         Store                             │
//! │                                                           │
//! │  segment-0000000000000001  segment-0000000000042135  ...  │
//! │  ┌──────────────────────┐  ┌──────────────────────┐       │
//! │  │ header │ blk │ blk │…│  │ header │ blk │ blk │…│  tail │
//! │  └──────────────────────┘  └──────────────────────┘       │
//! │            ordered, disjoint address ranges               │
//! │                                                           │
//! │  commitAddress   8-byte mmap → current root block         │
//! │  tx              staging segment of the active write tx   │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! Blocks are immutable once committed and form a DAG rooted at the commit
//! address. New blocks are created only inside the active write transaction's
//! staging segment; commit copies the reachable staging blocks into the tail
//! segment (copy-forward), relocates old reachable blocks past a garbage
//! threshold (roll-forward), flushes, and finally rewrites the commit
//! address. Fully drained head segments are unlinked.
//!
//! ## Concurrency Model
//!
//! A single mutex guards the segment list and commit publication; a condition
//! variable serialises writers. Readers never block: a read transaction
//! snapshots the committed root and each segment's end offset at creation and
//! reads the immutable bytes below those offsets. Segment `Arc`s keep
//! mappings alive after the files are unlinked, so snapshots survive
//! concurrent compaction.
//!
//! ## Guarantees
//!
//! - **Atomic commits:** the commit address is written last, after the tail
//!   segment is flushed; a failed commit leaves the published state intact.
//! - **Snapshot stability:** every address reachable from a snapshot's root
//!   keeps returning the same bytes for the snapshot's lifetime.
//! - **Bounded garbage:** roll-forward copies at most a configurable multiple
//!   of the freshly written bytes per commit, and segments are reclaimed as
//!   soon as the root's lowest descendant address passes them.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


// ------------------------------------------------------------------------------------------------
// Submodules
// ------------------------------------------------------------------------------------------------

mod address;
mod block;
mod commit;
mod context;
mod segment;
mod transaction;

pub use address::{Address, BlockType};
pub use block::{BlockReader, BlockWriter};
pub use context::{Canceller, Context};
pub use transaction::{ReadTransaction, WriteTransaction};

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};

use commit::CommitFile;
use segment::Segment;
use transaction::{relocate, CommitView, SegmentView};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying file or mmap failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// No block exists at the given address.
    #[error("no block at address {0}")]
    NotFound(Address),

    /// An on-disk structure is inconsistent.
    #[error("corruption: {0}")]
    Corruption(String),

    /// The caller's context was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// A caller-supplied argument is out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A segment reached the maximum segment size.
    #[error("segment is full")]
    SegmentFull,

    /// The store has been closed.
    #[error("store is closed")]
    Closed,

    /// Internal invariant violation (poisoned lock, commit without a write
    /// transaction, …).
    #[error("transaction invariant violated: {0}")]
    TxInvariant(String),
}

// ------------------------------------------------------------------------------------------------
// Read / write capabilities
// ------------------------------------------------------------------------------------------------

/// Capability to look blocks up by address.
pub trait Reader {
    fn get_block(&self, address: Address) -> Result<BlockReader<'_>, StoreError>;
}

/// Capability to append blocks and link children, on top of [`Reader`].
///
/// `set_child` lives here rather than on [`BlockWriter`] because updating a
/// child link needs a read view to fetch the child's `used_data_size` and
/// `lowest_descendant_address`, which may live in staging or in the main
/// store.
pub trait ReaderWriter: Reader {
    fn append_block(
        &mut self,
        block_type: BlockType,
        n_children: usize,
        data_size: usize,
    ) -> Result<BlockWriter, StoreError>;

    fn set_child(&mut self, writer: &BlockWriter, i: usize, child: Address)
        -> Result<(), StoreError>;
}

// ------------------------------------------------------------------------------------------------
// Options
// ------------------------------------------------------------------------------------------------

/// Tunables for a [`Store`] instance.
#[derive(Clone, Debug)]
pub struct StoreOptions {
    /// Reserved mmap size per segment; a segment can never grow past this.
    pub max_segment_size: u64,

    /// Increment by which segment files are grown on disk.
    pub segment_growth: u64,

    /// Roll-forward compaction may copy up to this multiple of the bytes a
    /// commit wrote, bounding garbage accumulation.
    pub max_write_amplification: u64,

    /// A new tail segment is started once the current tail holds more than
    /// `1 / tail_rotation_fraction` of the live database bytes.
    pub tail_rotation_fraction: u64,
}

impl Default for StoreOptions {
    fn default() -> StoreOptions {
        StoreOptions {
            max_segment_size: 1 << 40,
            segment_growth: 16 * 1024 * 1024,
            max_write_amplification: 6,
            tail_rotation_fraction: 4,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Store
// ------------------------------------------------------------------------------------------------

const COMMIT_ADDRESS_FILE: &str = "commitAddress";
const STAGING_FILE: &str = "tx";

/// Handle to an open store.
///
/// Cheaply cloneable; all clones share the same underlying state.
#[derive(Clone)]
pub struct Store {
    shared: Arc<StoreShared>,
}

pub(crate) struct StoreShared {
    dir: PathBuf,
    opts: StoreOptions,
    state: Mutex<StoreState>,
    writer_released: Condvar,
}

struct StoreState {
    /// Ordered by start address; disjoint, contiguous ranges.
    segments: Vec<Arc<Segment>>,
    /// `None` once the store is closed.
    commit: Option<CommitFile>,
    writer_active: bool,
}

impl Store {
    /// Opens the store in `dir` with default options, creating it if needed.
    pub fn open(dir: impl AsRef<Path>) -> Result<Store, StoreError> {
        Store::open_with_options(dir, StoreOptions::default())
    }

    /// Opens the store in `dir`, creating the directory, an initial segment,
    /// and an empty committed root if none exist yet.
    ///
    /// Only files named `segment-<digits>` are considered; anything else in
    /// the directory — including a staging file left behind by a crashed
    /// transaction — is ignored.
    pub fn open_with_options(
        dir: impl AsRef<Path>,
        opts: StoreOptions,
    ) -> Result<Store, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut found: Vec<(u64, PathBuf)> = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(start) = segment_start_from_name(name) {
                found.push((start, entry.path()));
            }
        }
        found.sort_by_key(|(start, _)| *start);

        let mut segments = Vec::with_capacity(found.len().max(1));
        let mut previous_end = Address::NIL;
        for (start, path) in found {
            let segment = Segment::open(&path, opts.max_segment_size, opts.segment_growth)?;
            if segment.start_address().raw() != start {
                return Err(StoreError::Corruption(format!(
                    "segment file {} declares start address {}",
                    path.display(),
                    segment.start_address()
                )));
            }
            if segment.start_address() < previous_end {
                return Err(StoreError::Corruption(format!(
                    "segment file {} overlaps its predecessor",
                    path.display()
                )));
            }
            previous_end = segment.end_address();
            segments.push(Arc::new(segment));
        }

        if segments.is_empty() {
            let start = Address::new(1);
            let segment = Segment::create(
                dir.join(segment_file_name(start)),
                opts.max_segment_size,
                opts.segment_growth,
                start,
            )?;
            segments.push(Arc::new(segment));
        }

        let mut commit = CommitFile::open(dir.join(COMMIT_ADDRESS_FILE))?;
        if commit.address().is_nil() {
            let tail = segments
                .last()
                .ok_or_else(|| StoreError::TxInvariant("store has no segments".into()))?;
            let root = append_empty_btree_root(tail)?;
            commit.set_address(root)?;
            info!(root = %root, "initialised empty store");
        }

        info!(
            dir = %dir.display(),
            segments = segments.len(),
            root = %commit.address(),
            "opened store"
        );

        Ok(Store {
            shared: Arc::new(StoreShared {
                dir,
                opts,
                state: Mutex::new(StoreState {
                    segments,
                    commit: Some(commit),
                    writer_active: false,
                }),
                writer_released: Condvar::new(),
            }),
        })
    }

    /// Closes the commit-address file and every segment.
    ///
    /// Idempotent. Snapshots created earlier stay readable until dropped.
    pub fn close(&self) -> Result<(), StoreError> {
        let mut state = self.shared.lock_state()?;
        state.commit = None;
        state.segments.clear();
        Ok(())
    }

    /// Returns a snapshot of the current committed state.
    pub fn new_read_transaction(&self) -> Result<ReadTransaction, StoreError> {
        let state = self.shared.lock_state()?;
        let Some(commit) = state.commit.as_ref() else {
            return Err(StoreError::Closed);
        };
        let segments = state.segments.iter().map(SegmentView::capture).collect();
        Ok(ReadTransaction::new(commit.address(), segments))
    }

    /// Starts the store's single write transaction, blocking until any
    /// in-progress writer commits or rolls back.
    ///
    /// Returns the transaction together with the current committed root.
    /// Cancelling `ctx` while waiting returns [`StoreError::Cancelled`]
    /// without reserving the writer slot.
    pub fn new_write_transaction(
        &self,
        ctx: &Context,
    ) -> Result<(WriteTransaction, Address), StoreError> {
        let mut state = self.shared.lock_state()?;
        loop {
            if state.commit.is_none() {
                return Err(StoreError::Closed);
            }
            ctx.check()?;
            if !state.writer_active {
                break;
            }
            let (guard, _) = self
                .shared
                .writer_released
                .wait_timeout(state, Duration::from_millis(10))
                .map_err(|_| StoreError::TxInvariant("store lock poisoned".into()))?;
            state = guard;
        }
        let root = match state.commit.as_ref() {
            Some(commit) => commit.address(),
            None => return Err(StoreError::Closed),
        };
        state.writer_active = true;
        let main: Vec<SegmentView> = state.segments.iter().map(SegmentView::capture).collect();
        drop(state);

        let staging = Segment::create(
            self.shared.dir.join(STAGING_FILE),
            self.shared.opts.max_segment_size,
            self.shared.opts.segment_growth,
            Address::STAGING_BASE,
        );
        let staging = match staging {
            Ok(staging) => Arc::new(staging),
            Err(err) => {
                self.shared.release_writer();
                return Err(err);
            }
        };

        debug!(root = %root, "started write transaction");
        Ok((
            WriteTransaction::new(Arc::clone(&self.shared), staging, main, ctx.clone()),
            root,
        ))
    }
}

impl StoreShared {
    fn lock_state(&self) -> Result<MutexGuard<'_, StoreState>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::TxInvariant("store lock poisoned".into()))
    }

    /// Clears the writer-in-progress flag and wakes waiting writers.
    ///
    /// Recovers a poisoned lock: leaving the flag set would deadlock every
    /// future writer.
    pub(crate) fn release_writer(&self) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.writer_active = false;
        drop(state);
        self.writer_released.notify_all();
    }

    /// Publishes `root` as the new committed state.
    ///
    /// Runs under the store lock: copy-forward of staged blocks, roll-forward
    /// compaction, tail flush, commit-address rewrite, tail rotation, and
    /// head-segment reclamation, in that order.
    pub(crate) fn commit_root(
        &self,
        staging: &Segment,
        root: Address,
    ) -> Result<Address, StoreError> {
        let mut state = self.lock_state()?;
        let state = &mut *state;
        let Some(commit) = state.commit.as_mut() else {
            return Err(StoreError::Closed);
        };
        if !state.writer_active {
            return Err(StoreError::TxInvariant(
                "commit without an active write transaction".into(),
            ));
        }
        let tail = Arc::clone(
            state
                .segments
                .last()
                .ok_or_else(|| StoreError::TxInvariant("store has no segments".into()))?,
        );

        let (rolled, root_used, root_lowest) = {
            // Copy every staged block reachable from the new root into the
            // tail segment, remapping child addresses.
            let relocated = if root.in_staging() {
                let view = CommitView {
                    segments: &state.segments,
                    staging: Some(staging),
                };
                relocate(&view, &tail, root, &mut HashMap::new(), &|address, _| {
                    address.in_staging()
                })?
            } else {
                root
            };

            let view = CommitView {
                segments: &state.segments,
                staging: None,
            };

            let old_root = commit.address();
            let data_written = relocated.raw().saturating_sub(old_root.raw());
            let lowest = view.get_block(relocated)?.lowest_descendant_address();
            let target = Address::new(lowest.raw().saturating_add(
                self.opts.max_write_amplification.saturating_mul(data_written),
            ));

            // Roll forward: move every reachable block whose subtree dips
            // below the garbage threshold into the tail, so head segments
            // drain and can be reclaimed.
            let rolled = relocate(&view, &tail, relocated, &mut HashMap::new(), &|_, block| {
                block.lowest_descendant_address() < target
            })?;

            tail.sync()?;
            commit.set_address(rolled)?;

            let root_block = view.get_block(rolled)?;
            debug!(
                root = %rolled,
                data_written,
                compaction_target = %target,
                "committed transaction"
            );
            (
                rolled,
                root_block.used_data_size(),
                root_block.lowest_descendant_address(),
            )
        };

        // Once the tail holds a substantial share of the live bytes, start a
        // fresh one so reclamation granularity tracks the database size.
        if tail.data_len() * self.opts.tail_rotation_fraction >= root_used {
            let start = tail.end_address();
            let segment = Segment::create(
                self.dir.join(segment_file_name(start)),
                self.opts.max_segment_size,
                self.opts.segment_growth,
                start,
            )?;
            info!(start = %start, "rotated tail segment");
            state.segments.push(Arc::new(segment));
        }

        // Drop head segments that hold nothing reachable anymore. Readers
        // with live snapshots keep the unlinked mappings alive via their Arcs.
        while state.segments.len() > 1 {
            let first = &state.segments[0];
            if first.end_address() > root_lowest {
                break;
            }
            first.remove_file()?;
            let removed = state.segments.remove(0);
            info!(start = %removed.start_address(), "reclaimed drained segment");
        }

        Ok(rolled)
    }
}

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

fn segment_file_name(start: Address) -> String {
    format!("segment-{:016}", start.raw())
}

/// Parses `segment-<digits>` file names; returns the start address.
fn segment_start_from_name(name: &str) -> Option<u64> {
    let digits = name.strip_prefix("segment-")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse::<u64>().ok()
}

/// Appends the canonical empty B-tree root (zero keys, zero children) used as
/// the initial committed state.
fn append_empty_btree_root(segment: &Segment) -> Result<Address, StoreError> {
    let data_size = 12; // count u64 + key count u32, both zero
    let block_size = block::block_size_for(0, data_size);
    let (address, ptr) = segment.append_block(block_size)?;
    let mut writer = BlockWriter::init(address, ptr, block_size as usize, BlockType::BTreeNode, 0);
    writer.payload_mut().fill(0);
    segment.sync()?;
    Ok(address)
}
