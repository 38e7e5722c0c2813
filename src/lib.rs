//! # StrataDB
//!
//! An embeddable, single-writer / multi-reader key-value database whose
//! on-disk representation is an **append-only sequence of blocks** grouped
//! into bounded **segments**, with a **copy-on-write B-tree** layered over
//! **chunked data streams**. The state of the database at any instant is one
//! 64-bit **commit address** pointing at the current root block.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                          Db                             │
//! │   create_map / put / get / exists / count over paths    │
//! │  ┌───────────────┐            ┌──────────────────────┐  │
//! │  │    B-tree     │            │     Data streams     │  │
//! │  │ copy-on-write │─ values ──►│ leaf + fan-out tree  │  │
//! │  └───────┬───────┘            └──────────┬───────────┘  │
//! │          │        blocks by address      │              │
//! │  ┌───────▼──────────────────────────────▼────────────┐  │
//! │  │                     Store                         │  │
//! │  │  mmapped append-only segments · staging segment   │  │
//! │  │  copy-forward commit · roll-forward compaction    │  │
//! │  │  commitAddress file = the published root          │  │
//! │  └───────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`store`]  | Segments, block codec, transactions, commit & compaction |
//! | [`btree`]  | Persistent order-statistic B-tree over block addresses |
//! | [`data`]   | Chunked byte streams with streaming reads |
//! | [`dbpath`] | Path parsing (`"a/b/c"` → segments) |
//! | [`db`]     | Database façade binding paths to transactions |
//!
//! ## Key Properties
//!
//! - **Snapshot reads** — readers pin the committed root they observed and
//!   are never blocked by (or block) the writer.
//! - **Atomic commits** — new blocks are staged in a private segment and
//!   copied into the store before the commit address flips; a failed or
//!   rolled-back transaction leaves no trace.
//! - **Self-compacting** — every commit relocates old reachable blocks past
//!   a garbage threshold (bounded write amplification), so drained segment
//!   files are continuously reclaimed.
//! - **Bit-stable format** — all on-disk integers are big-endian; segment
//!   file names are zero-padded so name order equals address order.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use stratadb::{Context, Db};
//!
//! let db = Db::open("/tmp/my_db")?;
//!
//! db.write_transaction(&Context::background(), |tx| {
//!     tx.create_map("config")?;
//!     tx.put("config/motd", b"be kind")?;
//!     Ok(())
//! })?;
//!
//! let rtx = db.read_transaction()?;
//! assert!(rtx.exists("config/motd")?);
//! assert_eq!(rtx.get("config/motd")?, b"be kind".to_vec());
//!
//! db.close()?;
//! # Ok::<(), stratadb::DbError>(())
//! ```

pub mod btree;
pub mod data;
pub mod db;
pub mod dbpath;
pub mod store;

pub use db::{Db, DbError, ReadTx, WriteTx};
pub use store::{Address, Canceller, Context, Store, StoreError, StoreOptions};
