use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::sync::Arc;

use strata_sstable::{BlockCache, BytewiseComparator, CompressionType, FilterPolicy, TableComparator};

use crate::snapshot::Snapshot;


/// Options controlling a database's on-disk layout and runtime behavior.
///
/// Order-affecting options (`comparator`) and format-affecting options (`filter_policy`,
/// `compression`) must stay consistent across openings of the same database.
#[derive(Clone)]
pub struct Options {
    /// Defines the order of keys. Defaults to lexicographic byte order.
    pub comparator:             Arc<dyn TableComparator + Send + Sync>,
    /// Create the database directory and initial manifest if none exists.
    pub create_if_missing:      bool,
    /// Fail `open` if the database already exists.
    pub error_if_exists:        bool,
    /// Treat every detected corruption as an error instead of carrying on; verifies block
    /// checksums on the open path.
    pub paranoid_checks:        bool,
    /// The memtable is flipped to immutable and flushed once it holds about this many bytes.
    pub write_buffer_size:      usize,
    /// Table-cache capacity is `max_open_files - 10` open table files.
    pub max_open_files:         usize,
    /// An optional shared cache for decompressed data blocks.
    pub block_cache:            Option<BlockCache>,
    /// Target uncompressed size of a table data block.
    pub block_size:             usize,
    pub block_restart_interval: usize,
    /// Compaction output files are cut at about this size.
    pub max_file_size:          u64,
    pub compression:            CompressionType,
    /// An optional filter (typically bloom) consulted before data-block reads on point lookups.
    pub filter_policy:          Option<Arc<dyn FilterPolicy + Send + Sync>>,
    /// On recovery, resume appending to the final log file when it ended cleanly instead of
    /// starting a new one.
    pub reuse_logs:             bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            comparator:             Arc::new(BytewiseComparator),
            create_if_missing:      false,
            error_if_exists:        false,
            paranoid_checks:        false,
            write_buffer_size:      4 << 20,
            max_open_files:         1000,
            block_cache:            None,
            block_size:             4 << 10,
            block_restart_interval: 16,
            max_file_size:          2 << 20,
            compression:            default_compression(),
            filter_policy:          None,
            reuse_logs:             false,
        }
    }
}

impl Debug for Options {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("Options")
            .field("comparator", &self.comparator.name())
            .field("create_if_missing", &self.create_if_missing)
            .field("error_if_exists", &self.error_if_exists)
            .field("paranoid_checks", &self.paranoid_checks)
            .field("write_buffer_size", &self.write_buffer_size)
            .field("max_open_files", &self.max_open_files)
            .field("has_block_cache", &self.block_cache.is_some())
            .field("block_size", &self.block_size)
            .field("block_restart_interval", &self.block_restart_interval)
            .field("max_file_size", &self.max_file_size)
            .field("compression", &self.compression)
            .field("filter_policy", &self.filter_policy.as_ref().map(|policy| policy.name()))
            .field("reuse_logs", &self.reuse_logs)
            .finish()
    }
}

#[must_use]
fn default_compression() -> CompressionType {
    if cfg!(feature = "snappy-compression") {
        CompressionType::Snappy
    } else {
        CompressionType::None
    }
}

/// Options for one read operation.
#[derive(Debug, Clone)]
pub struct ReadOptions {
    /// Verify the checksum of every block read on this operation's behalf.
    pub verify_checksums: bool,
    /// Insert blocks read on this operation's behalf into the block cache. On by default;
    /// turn off for bulk scans that should not evict the working set.
    pub fill_cache:       bool,
    /// Read at this snapshot instead of the current state.
    pub snapshot:         Option<Snapshot>,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            verify_checksums: false,
            fill_cache:       true,
            snapshot:         None,
        }
    }
}

/// Options for one write operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// Sync the write-ahead log to persistent storage before acknowledging the write. Without
    /// it, a machine crash may lose the most recent writes (a process crash does not).
    pub sync: bool,
}
