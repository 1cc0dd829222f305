//! Sorted String Tables: immutable, sorted, prefix-compressed block files with an embedded
//! index and an optional filter block.
//!
//! The on-disk format is bit-compatible with LevelDB's table format: the same footer magic,
//! the same restart-point block layout, the same masked CRC-32C trailer over the on-disk block
//! contents plus the one-byte compression tag.

mod cache;
mod comparator;
mod compress;
mod error;
mod file;
mod filter;
mod filter_block;
mod format;

pub mod block;
pub mod table;


pub use self::cache::{BlockCache, CacheKey};
pub use self::comparator::{BytewiseComparator, TableComparator};
pub use self::compress::CompressionType;
pub use self::error::{TableError, TableResult};
pub use self::file::{RandomAccess, WritableTableFile};
pub use self::filter::{BloomFilterPolicy, FilterPolicy};
pub use self::table::{
    ReadTableOptions, Table, TableBuilder, TableIter, TableReadOptions, WriteTableOptions,
};
