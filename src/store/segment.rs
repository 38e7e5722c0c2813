//! mmap-backed append-only segment files.
//!
//! A segment holds a contiguous slice of the global address space. On disk it
//! is a 16-byte header (`start_address` BE, `next_block_offset` BE) followed
//! by back-to-back blocks. The file is mapped writable up to the configured
//! maximum segment size; the on-disk length is extended with `set_len` in
//! fixed growth increments as blocks are appended, so the mapping itself is
//! never moved or recreated.
//!
//! # Safety
//!
//! The segment reads and writes through a [`MmapRaw`], which is memory-safe
//! under the store's access discipline:
//!
//! - There is a single writer at a time (the store's writer slot), and it only
//!   *appends*: bytes below `next_block_offset` are never rewritten.
//! - Readers only dereference bytes below the `next_block_offset` they
//!   observed when their snapshot was taken, so they never race an append.
//! - `next_block_offset` crosses threads through an `AtomicU64` (release on
//!   append, acquire on read); the copy inside the mmapped header exists only
//!   for reopening the file and is not read while the segment is live.
//! - Accessed pages always lie below the on-disk file length, so the mapping
//!   cannot fault.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use memmap2::{Advice, MmapOptions, MmapRaw};
use tracing::debug;

use super::address::Address;
use super::block::BlockReader;
use super::StoreError;

/// Offset of the first block in a segment file.
pub(crate) const SEGMENT_HEADER_SIZE: u64 = 16;

/// mmap-backed append region owning one segment file.
pub(crate) struct Segment {
    file: File,
    path: PathBuf,
    map: MmapRaw,
    start_address: Address,
    /// Authoritative copy of the header's `next_block_offset`.
    next_offset: AtomicU64,
    /// Current on-disk file length.
    file_len: AtomicU64,
    /// File growth increment.
    growth: u64,
}

impl Segment {
    /// Creates a new segment file with the given start address.
    ///
    /// Any existing file at `path` is truncated; this deliberately recycles a
    /// staging file left behind by a crashed transaction.
    pub fn create(
        path: impl AsRef<Path>,
        max_size: u64,
        growth: u64,
        start_address: Address,
    ) -> Result<Segment, StoreError> {
        if start_address.is_nil() {
            return Err(StoreError::InvalidArgument(
                "segment start address must not be nil".into(),
            ));
        }

        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(growth)?;

        let map = MmapOptions::new().len(max_size as usize).map_raw(&file)?;
        map.advise(Advice::Random)?;

        let segment = Segment {
            file,
            path,
            map,
            start_address,
            next_offset: AtomicU64::new(SEGMENT_HEADER_SIZE),
            file_len: AtomicU64::new(growth),
            growth,
        };
        segment.write_header_u64(0, start_address.raw());
        segment.write_header_u64(8, SEGMENT_HEADER_SIZE);

        debug!(path = %segment.path.display(), start_address = %start_address, "created segment");
        Ok(segment)
    }

    /// Maps an existing segment file.
    pub fn open(path: impl AsRef<Path>, max_size: u64, growth: u64) -> Result<Segment, StoreError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let file_len = file.metadata()?.len();

        if file_len < SEGMENT_HEADER_SIZE {
            return Err(StoreError::Corruption(format!(
                "segment file {} has only {file_len} bytes",
                path.display()
            )));
        }

        let map = MmapOptions::new().len(max_size as usize).map_raw(&file)?;
        map.advise(Advice::Random)?;

        let segment = Segment {
            file,
            path,
            map,
            start_address: Address::NIL,
            next_offset: AtomicU64::new(0),
            file_len: AtomicU64::new(file_len),
            growth,
        };

        let start_address = Address::new(segment.read_header_u64(0));
        let next_offset = segment.read_header_u64(8);
        if start_address.is_nil() {
            return Err(StoreError::Corruption(format!(
                "segment file {} has a nil start address",
                segment.path.display()
            )));
        }
        if next_offset < SEGMENT_HEADER_SIZE || next_offset > file_len {
            return Err(StoreError::Corruption(format!(
                "segment file {} has next block offset {next_offset} outside of [16, {file_len}]",
                segment.path.display()
            )));
        }

        let segment = Segment {
            start_address,
            next_offset: AtomicU64::new(next_offset),
            ..segment
        };
        debug!(
            path = %segment.path.display(),
            start_address = %segment.start_address,
            data_len = segment.data_len(),
            "opened segment"
        );
        Ok(segment)
    }

    pub fn start_address(&self) -> Address {
        self.start_address
    }

    /// One past the highest assigned address in this segment.
    pub fn end_address(&self) -> Address {
        self.start_address.offset(self.data_len())
    }

    /// Bytes of block data appended so far.
    pub fn data_len(&self) -> u64 {
        self.next_offset.load(Ordering::Acquire) - SEGMENT_HEADER_SIZE
    }

    /// Whether `address` lies below `end`, inside this segment's range.
    pub fn contains(&self, address: Address, end: Address) -> bool {
        address >= self.start_address && address < end
    }

    /// Reserves `size` bytes for a new block and returns its address and the
    /// raw window.
    ///
    /// Grows the file by the smallest multiple of the growth increment that
    /// fits the block. Only the single active writer may call this.
    pub fn append_block(&self, size: u64) -> Result<(Address, *mut u8), StoreError> {
        let offset = self.next_offset.load(Ordering::Acquire);
        let new_offset = offset + size;

        if new_offset > self.map.len() as u64 {
            return Err(StoreError::SegmentFull);
        }

        let file_len = self.file_len.load(Ordering::Acquire);
        if new_offset > file_len {
            let new_len = (new_offset.div_ceil(self.growth) * self.growth).min(self.map.len() as u64);
            self.file.set_len(new_len)?;
            self.file_len.store(new_len, Ordering::Release);
        }

        let address = self.start_address.offset(offset - SEGMENT_HEADER_SIZE);
        // SAFETY: the window [offset, new_offset) is below the file length and
        // reserved exclusively for the returned block.
        let ptr = unsafe { self.map.as_mut_ptr().add(offset as usize) };

        self.write_header_u64(8, new_offset);
        self.next_offset.store(new_offset, Ordering::Release);

        Ok((address, ptr))
    }

    /// Decodes the block at `address`, bounded by the visibility horizon
    /// `end` (a snapshot of [`Segment::end_address`]).
    pub fn block_at(&self, address: Address, end: Address) -> Result<BlockReader<'_>, StoreError> {
        if !self.contains(address, end) {
            return Err(StoreError::NotFound(address));
        }
        let offset = SEGMENT_HEADER_SIZE + address.distance_from(self.start_address);
        let available = end.distance_from(address);
        // SAFETY: the range lies below the observed next_block_offset, whose
        // bytes are immutable; see the module docs.
        let bytes = unsafe {
            std::slice::from_raw_parts(self.map.as_ptr().add(offset as usize), available as usize)
        };
        BlockReader::new(bytes)
    }

    /// Flushes appended bytes and the file length to stable storage.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.map.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Unlinks the segment file. The mapping stays valid until the segment is
    /// dropped, so readers holding a snapshot are unaffected.
    pub fn remove_file(&self) -> Result<(), StoreError> {
        debug!(path = %self.path.display(), "removing segment file");
        std::fs::remove_file(&self.path)?;
        Ok(())
    }

    fn read_header_u64(&self, offset: usize) -> u64 {
        // SAFETY: the 16-byte header is always below the file length.
        let bytes =
            unsafe { std::slice::from_raw_parts(self.map.as_ptr().add(offset), 8) };
        u64::from_be_bytes(bytes.try_into().unwrap())
    }

    fn write_header_u64(&self, offset: usize, value: u64) {
        // SAFETY: header writes happen on create and under the writer slot.
        let bytes =
            unsafe { std::slice::from_raw_parts_mut(self.map.as_mut_ptr().add(offset), 8) };
        bytes.copy_from_slice(&value.to_be_bytes());
    }
}
