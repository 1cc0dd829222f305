//! Memoises open table files, keyed by file number. Evicting (or dropping) an entry closes the
//! underlying file once the last reader releases it.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

use quick_cache::sync::Cache;

use strata_sstable::{
    BlockCache, ReadTableOptions, Table, TableIter, TableReadOptions,
};

use crate::comparator::InternalKeyComparator;
use crate::error::Result;
use crate::filenames::DbFileName;
use crate::filter::InternalFilterPolicy;
use crate::options::Options;


pub(crate) type DbTable = Table<InternalKeyComparator, InternalFilterPolicy>;
pub(crate) type DbTableIter = TableIter<InternalKeyComparator, InternalFilterPolicy>;

/// The table cache reserves this many of `max_open_files` for other file handles.
const RESERVED_OPEN_FILES: usize = 10;


#[derive(Clone)]
pub(crate) struct TableCache {
    inner: Arc<TableCacheInner>,
}

struct TableCacheInner {
    db_path:       PathBuf,
    cache:         Cache<u64, Arc<DbTable>>,
    icmp:          InternalKeyComparator,
    filter_policy: Option<InternalFilterPolicy>,
    block_cache:   Option<BlockCache>,
    verify_opens:  bool,
}

impl TableCache {
    #[must_use]
    pub(crate) fn new(db_path: PathBuf, opts: &Options, icmp: InternalKeyComparator) -> Self {
        let capacity = opts.max_open_files.saturating_sub(RESERVED_OPEN_FILES).max(1);
        Self {
            inner: Arc::new(TableCacheInner {
                db_path,
                cache: Cache::new(capacity),
                icmp,
                filter_policy: opts
                    .filter_policy
                    .clone()
                    .map(InternalFilterPolicy::new),
                block_cache: opts.block_cache.clone(),
                verify_opens: opts.paranoid_checks,
            }),
        }
    }

    /// The open table for `file_number`, opening (and memoising) it on a miss.
    pub(crate) fn get_table(&self, file_number: u64, file_size: u64) -> Result<Arc<DbTable>> {
        let inner = &*self.inner;
        if let Some(table) = inner.cache.get(&file_number) {
            return Ok(table);
        }

        let table_path = DbFileName::Table(file_number).path_in(&inner.db_path);
        let file = match File::open(&table_path) {
            Ok(file) => file,
            Err(_not_found) => {
                // Databases written long ago may still carry the legacy extension.
                let legacy_path = DbFileName::TableLegacy(file_number).path_in(&inner.db_path);
                File::open(&legacy_path)?
            }
        };

        let table = Arc::new(Table::open(
            ReadTableOptions {
                comparator:       inner.icmp.clone(),
                filter_policy:    inner.filter_policy.clone(),
                block_cache:      inner.block_cache.clone(),
                verify_checksums: inner.verify_opens,
            },
            Box::new(file),
            file_size,
            file_number,
        )?);

        inner.cache.insert(file_number, Arc::clone(&table));
        Ok(table)
    }

    /// Point lookup within one table. Returns the first entry at or after `internal_key` in
    /// the containing block, or `None`.
    pub(crate) fn get(
        &self,
        ropts:        TableReadOptions,
        file_number:  u64,
        file_size:    u64,
        internal_key: &[u8],
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let table = self.get_table(file_number, file_size)?;
        Ok(table.internal_get(&ropts, internal_key)?)
    }

    /// An iterator over one table file.
    pub(crate) fn iter(
        &self,
        ropts:       TableReadOptions,
        file_number: u64,
        file_size:   u64,
    ) -> Result<DbTableIter> {
        let table = self.get_table(file_number, file_size)?;
        Ok(Table::iter(table, ropts))
    }

    /// Forget the cached table for a deleted file, closing it once the last reader is done.
    pub(crate) fn evict(&self, file_number: u64) {
        self.inner.cache.remove(&file_number);
    }
}

impl std::fmt::Debug for TableCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableCache")
            .field("db_path", &self.inner.db_path)
            .finish_non_exhaustive()
    }
}
