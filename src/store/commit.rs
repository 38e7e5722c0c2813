//! The commit-address file.
//!
//! `commitAddress` is an 8-byte mmapped file holding the address of the
//! current committed root block, big-endian. It is the single source of truth
//! for the database state: a commit becomes visible exactly when this file is
//! rewritten, and it is rewritten only after the tail segment has been
//! flushed, so a torn commit leaves the previous state intact.

use std::fs::OpenOptions;
use std::path::Path;

use memmap2::{Advice, MmapMut, MmapOptions};
use tracing::debug;

use super::address::Address;
use super::StoreError;

pub(crate) struct CommitFile {
    map: MmapMut,
}

impl CommitFile {
    /// Opens (or creates) the commit-address file.
    ///
    /// A fresh file is initialised to the nil address; anything but 0 or 8
    /// bytes is corruption.
    pub fn open(path: impl AsRef<Path>) -> Result<CommitFile, StoreError> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        match file.metadata()?.len() {
            0 => file.set_len(8)?,
            8 => {}
            n => {
                return Err(StoreError::Corruption(format!(
                    "commit address file {} has {n} bytes - expected 0 or 8",
                    path.display()
                )));
            }
        }

        let map = unsafe { MmapOptions::new().len(8).map_mut(&file)? };
        map.advise(Advice::Random)?;

        Ok(CommitFile { map })
    }

    /// The current committed root address.
    pub fn address(&self) -> Address {
        Address::new(u64::from_be_bytes(self.map[..8].try_into().unwrap()))
    }

    /// Publishes a new root address and flushes it to stable storage.
    pub fn set_address(&mut self, address: Address) -> Result<(), StoreError> {
        self.map[..8].copy_from_slice(&address.raw().to_be_bytes());
        self.map.flush()?;
        debug!(root = %address, "published commit address");
        Ok(())
    }
}
