//! An embedded, ordered, persistent key → value store: a log-structured merge tree in the
//! LevelDB lineage, with bit-compatible on-disk formats.
//!
//! Writes land in a write-ahead log and an in-memory sorted table; full memtables are frozen
//! and flushed to immutable sorted table files, which a background thread merges down a
//! seven-level tree. Reads consult the memtables and the current version of the file tree,
//! newest tier first. Snapshots pin a point in the write order; iterators see a consistent
//! view of the whole database.
//!
//! ```no_run
//! use strata_db::{Options, ReadOptions, StrataDb, WriteOptions};
//!
//! # fn main() -> strata_db::Result<()> {
//! let mut options = Options::default();
//! options.create_if_missing = true;
//! let db = StrataDb::open("/tmp/example-db", options)?;
//!
//! db.put(&WriteOptions::default(), b"key", b"value")?;
//! assert_eq!(db.get(&ReadOptions::default(), b"key")?, Some(b"value".to_vec()));
//! db.delete(&WriteOptions::default(), b"key")?;
//! # Ok(())
//! # }
//! ```

mod batch;
mod comparator;
mod config;
mod db;
mod error;
mod filenames;
mod filter;
mod format;
mod iter;
mod memtable;
mod options;
mod snapshot;
mod table_cache;
mod version;
mod write_log;


pub use strata_sstable::{
    BlockCache, BloomFilterPolicy, BytewiseComparator, CompressionType, FilterPolicy,
    TableComparator as Comparator,
};

pub use self::batch::WriteBatch;
pub use self::db::{StrataDb, destroy_db, repair_db};
pub use self::error::{Error, ErrorKind, Result};
pub use self::iter::DbIterator;
pub use self::options::{Options, ReadOptions, WriteOptions};
pub use self::snapshot::Snapshot;
