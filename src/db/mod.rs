//! # Database façade
//!
//! Binds transactions to path-addressed map and value operations. The
//! database is a tree of maps: every map is a B-tree whose values are either
//! nested map roots (`create_map`) or data streams (`put`), and the committed
//! root block is always the root map.
//!
//! A write transaction runs as a closure over a [`WriteTx`]; when the closure
//! succeeds the transaction commits its final root, and when it fails
//! everything it staged is rolled back:
//!
//! ```rust,no_run
//! use stratadb::{Context, Db};
//!
//! let db = Db::open("/tmp/my_db")?;
//!
//! db.write_transaction(&Context::background(), |tx| {
//!     tx.create_map("users")?;
//!     tx.put("users/alice", b"hello")?;
//!     Ok(())
//! })?;
//!
//! let rtx = db.read_transaction()?;
//! assert_eq!(rtx.get("users/alice")?, b"hello".to_vec());
//! assert_eq!(rtx.count("users")?, 1);
//!
//! db.close()?;
//! # Ok::<(), stratadb::DbError>(())
//! ```
//!
//! Path updates are copy-on-write all the way up: changing
//! `users/alice` rewrites the `users` map entry for `alice` and then the root
//! map entry for `users`, producing a new root address that the commit
//! publishes.

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::io::Read as _;
use std::path::Path;

use thiserror::Error;
use tracing::warn;

use crate::btree::{self, BTreeError};
use crate::data::{self, DataError, DataReader};
use crate::dbpath::{self, PathError};
use crate::store::{
    Address, Context, ReadTransaction, Reader, Store, StoreError, StoreOptions, WriteTransaction,
};

/// Leaf size used for stored values.
pub const DATA_LEAF_SIZE: usize = 60 * 1024;

/// Fan-out of stored values' stream trees.
pub const DATA_FANOUT: usize = 128;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by database operations.
#[derive(Debug, Error)]
pub enum DbError {
    /// A path segment or key does not exist.
    #[error("not found")]
    NotFound,

    /// The path is malformed or empty where a key is required.
    #[error(transparent)]
    Path(#[from] PathError),

    /// Underlying store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Underlying B-tree failure other than a missed lookup.
    #[error("b-tree error: {0}")]
    BTree(BTreeError),

    /// Underlying data stream failure.
    #[error(transparent)]
    Data(#[from] DataError),
}

/// Lookup misses become [`DbError::NotFound`]; everything else is wrapped.
fn btree_err(err: BTreeError) -> DbError {
    match err {
        BTreeError::NotFound => DbError::NotFound,
        other => DbError::BTree(other),
    }
}

// ------------------------------------------------------------------------------------------------
// Db
// ------------------------------------------------------------------------------------------------

/// Handle to an open database.
///
/// Cheaply cloneable and shareable across threads; one writer at a time,
/// any number of concurrent readers.
#[derive(Clone)]
pub struct Db {
    store: Store,
}

impl Db {
    /// Opens (or creates) a database rooted at the given directory.
    pub fn open(dir: impl AsRef<Path>) -> Result<Db, DbError> {
        Ok(Db {
            store: Store::open(dir)?,
        })
    }

    /// [`Db::open`] with explicit store tunables.
    pub fn open_with_options(dir: impl AsRef<Path>, opts: StoreOptions) -> Result<Db, DbError> {
        Ok(Db {
            store: Store::open_with_options(dir, opts)?,
        })
    }

    pub fn close(&self) -> Result<(), DbError> {
        Ok(self.store.close()?)
    }

    /// Runs `f` inside the database's single write transaction.
    ///
    /// If `f` returns `Ok` the transaction commits the root it built; if `f`
    /// fails the transaction rolls back and nothing becomes visible.
    pub fn write_transaction<T, F>(&self, ctx: &Context, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&mut WriteTx) -> Result<T, DbError>,
    {
        let (swt, root) = self.store.new_write_transaction(ctx)?;
        let mut tx = WriteTx { root, swt };
        match f(&mut tx) {
            Ok(value) => {
                tx.swt.commit(tx.root)?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.swt.rollback() {
                    warn!(error = %rollback_err, "rollback failed");
                }
                Err(err)
            }
        }
    }

    /// Returns a read-only snapshot of the last committed state.
    pub fn read_transaction(&self) -> Result<ReadTx, DbError> {
        Ok(ReadTx {
            rtx: self.store.new_read_transaction()?,
        })
    }
}

// ------------------------------------------------------------------------------------------------
// Transactions
// ------------------------------------------------------------------------------------------------

/// Path-addressed operations bound to the active write transaction.
///
/// Reads observe the transaction's own uncommitted writes.
pub struct WriteTx {
    root: Address,
    swt: WriteTransaction,
}

impl WriteTx {
    /// Creates an empty nested map at `path`.
    pub fn create_map(&mut self, path: &str) -> Result<(), DbError> {
        let segments = dbpath::split(path)?;
        self.root = modify_path(
            &mut self.swt,
            self.root,
            &segments,
            &mut |swt, parent, key| {
                let empty = btree::create_empty(swt).map_err(btree_err)?;
                btree::put(swt, parent, key.as_bytes(), empty).map_err(btree_err)
            },
        )?;
        Ok(())
    }

    /// Stores `data` as the value at `path`.
    pub fn put(&mut self, path: &str, data: &[u8]) -> Result<(), DbError> {
        let segments = dbpath::split(path)?;
        let address = data::store_data(&mut self.swt, data, DATA_LEAF_SIZE, DATA_FANOUT)?;
        self.root = modify_path(
            &mut self.swt,
            self.root,
            &segments,
            &mut |swt, parent, key| {
                btree::put(swt, parent, key.as_bytes(), address).map_err(btree_err)
            },
        )?;
        Ok(())
    }

    /// Reads the value stored at `path`.
    pub fn get(&self, path: &str) -> Result<Vec<u8>, DbError> {
        get_at(&self.swt, self.root, path)
    }

    /// Whether `path` resolves to an entry.
    pub fn exists(&self, path: &str) -> Result<bool, DbError> {
        exists_at(&self.swt, self.root, path)
    }

    /// Number of entries in the map at `path`; the empty path counts the
    /// root map.
    pub fn count(&self, path: &str) -> Result<u64, DbError> {
        count_at(&self.swt, self.root, path)
    }
}

/// Path-addressed reads over a committed snapshot.
pub struct ReadTx {
    rtx: ReadTransaction,
}

impl ReadTx {
    pub fn get(&self, path: &str) -> Result<Vec<u8>, DbError> {
        get_at(&self.rtx, self.rtx.root(), path)
    }

    pub fn exists(&self, path: &str) -> Result<bool, DbError> {
        exists_at(&self.rtx, self.rtx.root(), path)
    }

    pub fn count(&self, path: &str) -> Result<u64, DbError> {
        count_at(&self.rtx, self.rtx.root(), path)
    }
}

// ------------------------------------------------------------------------------------------------
// Path traversal
// ------------------------------------------------------------------------------------------------

/// Applies `f` to the map at the end of `path`, rewriting the spine of maps
/// above it, and returns the new root address.
///
/// `f` receives the parent map's address and the final key and returns the
/// parent's replacement address.
fn modify_path(
    swt: &mut WriteTransaction,
    parent: Address,
    path: &[&str],
    f: &mut dyn FnMut(&mut WriteTransaction, Address, &str) -> Result<Address, DbError>,
) -> Result<Address, DbError> {
    let Some((first, rest)) = path.split_first() else {
        return Err(PathError::EmptyPath.into());
    };
    if rest.is_empty() {
        return f(swt, parent, first);
    }
    let child = btree::get(swt, parent, first.as_bytes()).map_err(btree_err)?;
    let new_child = modify_path(swt, child, rest, f)?;
    btree::put(swt, parent, first.as_bytes(), new_child).map_err(btree_err)
}

fn path_address<R: Reader>(r: &R, root: Address, path: &str) -> Result<Address, DbError> {
    let mut address = root;
    for segment in dbpath::split(path)? {
        address = btree::get(r, address, segment.as_bytes()).map_err(btree_err)?;
    }
    Ok(address)
}

fn get_at<R: Reader>(r: &R, root: Address, path: &str) -> Result<Vec<u8>, DbError> {
    let address = path_address(r, root, path)?;
    let mut reader = DataReader::new(address, r)?;
    let mut bytes = Vec::new();
    reader
        .read_to_end(&mut bytes)
        .map_err(|err| DbError::Store(StoreError::Io(err)))?;
    Ok(bytes)
}

fn exists_at<R: Reader>(r: &R, root: Address, path: &str) -> Result<bool, DbError> {
    match path_address(r, root, path) {
        Ok(_) => Ok(true),
        Err(DbError::NotFound) => Ok(false),
        Err(err) => Err(err),
    }
}

fn count_at<R: Reader>(r: &R, root: Address, path: &str) -> Result<u64, DbError> {
    let address = path_address(r, root, path)?;
    btree::count(r, address).map_err(btree_err)
}
