//! Reading table files: footer and index parsing, point lookups through the optional filter,
//! and two-level iteration.

mod builder;
mod iter;


use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::sync::Arc;

use crc32c::{crc32c, crc32c_append};

use crate::block::Block;
use crate::cache::{BlockCache, CacheKey};
use crate::comparator::{BytewiseComparator, TableComparator};
use crate::compress::decompress_block;
use crate::error::{TableError, TableResult};
use crate::file::RandomAccess;
use crate::filter::FilterPolicy;
use crate::filter_block::FilterBlockReader;
use crate::format::{BLOCK_TRAILER_LEN, BlockHandle, FILTER_META_PREFIX, TableFooter, unmask_checksum};

pub use self::builder::{TableBuilder, WriteTableOptions};
pub use self::iter::TableIter;


/// Options for opening a table file.
#[derive(Debug, Clone)]
pub struct ReadTableOptions<Cmp, Policy> {
    pub comparator:       Cmp,
    /// Must be the policy the table was written with, or `None` to ignore any filter block.
    pub filter_policy:    Option<Policy>,
    pub block_cache:      Option<BlockCache>,
    /// Verify the checksums of the footer-adjacent blocks read at open time.
    pub verify_checksums: bool,
}

/// Per-read options, corresponding to the read options of the database layer.
#[derive(Debug, Clone, Copy)]
pub struct TableReadOptions {
    pub verify_checksums: bool,
    pub fill_cache:       bool,
}

impl Default for TableReadOptions {
    fn default() -> Self {
        Self {
            verify_checksums: false,
            fill_cache:       true,
        }
    }
}

/// An open, immutable table file: parsed footer, resident index block and filter block, and a
/// handle for reading data blocks on demand (through the shared block cache, if one is
/// configured).
pub struct Table<Cmp, Policy> {
    file:             Box<dyn RandomAccess>,
    /// Distinguishes this table's blocks in the shared block cache; unique per cache.
    table_id:         u64,
    comparator:       Cmp,
    block_cache:      Option<BlockCache>,
    index_block:      Block,
    filter:           Option<FilterBlockReader<Policy>>,
    /// Used as the approximate offset for keys past the final data block.
    metaindex_offset: u64,
}

impl<Cmp, Policy> Table<Cmp, Policy>
where
    Cmp:    TableComparator + Clone,
    Policy: FilterPolicy,
{
    pub fn open(
        opts:      ReadTableOptions<Cmp, Policy>,
        file:      Box<dyn RandomAccess>,
        file_size: u64,
        table_id:  u64,
    ) -> TableResult<Self> {
        let mut opts = opts;

        let footer_len = TableFooter::ENCODED_LENGTH as u64;
        if file_size < footer_len {
            return Err(TableError::corruption("file too short to be a table"));
        }

        let mut footer_bytes = vec![0; TableFooter::ENCODED_LENGTH];
        read_exact_at(&*file, file_size - footer_len, &mut footer_bytes)?;
        let footer = TableFooter::decode_from(&footer_bytes)?;

        let index_contents =
            read_block(&*file, footer.index, opts.verify_checksums)?;
        let index_block = Block::new(Arc::new(index_contents))?;

        let filter = if let Some(policy) = opts.filter_policy.take() {
            Self::read_filter(&*file, &footer, opts.verify_checksums, policy)?
        } else {
            None
        };

        Ok(Self {
            file,
            table_id,
            comparator: opts.comparator,
            block_cache: opts.block_cache,
            index_block,
            filter,
            metaindex_offset: footer.metaindex.offset,
        })
    }

    /// Load the filter block named by the metaindex, if the table has one for `policy`.
    fn read_filter(
        file:             &dyn RandomAccess,
        footer:           &TableFooter,
        verify_checksums: bool,
        policy:           Policy,
    ) -> TableResult<Option<FilterBlockReader<Policy>>> {
        let metaindex_contents =
            read_block(file, footer.metaindex, verify_checksums)?;
        let metaindex = Block::new(Arc::new(metaindex_contents))?;

        // The metaindex block is always ordered bytewise, regardless of the table comparator.
        let mut metaindex_iter = metaindex.iter(BytewiseComparator);
        let filter_key = format!("{FILTER_META_PREFIX}{}", policy.name());
        metaindex_iter.seek(filter_key.as_bytes());

        if !metaindex_iter.valid() || metaindex_iter.key() != filter_key.as_bytes() {
            metaindex_iter.status()?;
            return Ok(None);
        }

        let (filter_handle, _) = BlockHandle::decode_from(metaindex_iter.value())?;
        let filter_contents = read_block(file, filter_handle, verify_checksums)?;
        Ok(Some(FilterBlockReader::new(policy, filter_contents)))
    }

    /// Find the first entry with key greater than or equal to `key` within the single candidate
    /// data block, consulting the filter first. Returns the entry's full key and value.
    ///
    /// The caller is responsible for deciding whether the returned key actually matches.
    pub fn internal_get(
        &self,
        ropts: &TableReadOptions,
        key:   &[u8],
    ) -> TableResult<Option<(Vec<u8>, Vec<u8>)>> {
        let mut index_iter = self.index_block.iter(self.comparator.clone());
        index_iter.seek(key);
        if !index_iter.valid() {
            index_iter.status()?;
            return Ok(None);
        }

        let (handle, _) = BlockHandle::decode_from(index_iter.value())?;

        if let Some(filter) = &self.filter {
            if !filter.key_may_match(handle.offset, key) {
                // A negative filter answer is authoritative; skip the block read.
                return Ok(None);
            }
        }

        let block = self.load_data_block(handle, ropts)?;
        let mut block_iter = block.iter(self.comparator.clone());
        block_iter.seek(key);

        if block_iter.valid() {
            Ok(Some((block_iter.key().to_vec(), block_iter.value().to_vec())))
        } else {
            block_iter.status()?;
            Ok(None)
        }
    }

    /// An approximate file offset at which `key` would first appear.
    #[must_use]
    pub fn approximate_offset_of(&self, key: &[u8]) -> u64 {
        let mut index_iter = self.index_block.iter(self.comparator.clone());
        index_iter.seek(key);

        if index_iter.valid() {
            if let Ok((handle, _)) = BlockHandle::decode_from(index_iter.value()) {
                return handle.offset;
            }
        }
        // Past the final data block (or unparsable); the metaindex offset approximates the
        // end of the data region.
        self.metaindex_offset
    }

    /// An iterator over the whole table. `table` is kept alive by the iterator.
    #[must_use]
    pub fn iter(table: Arc<Self>, ropts: TableReadOptions) -> TableIter<Cmp, Policy> {
        TableIter::new(table, ropts)
    }

    pub(crate) fn load_data_block(
        &self,
        handle: BlockHandle,
        ropts:  &TableReadOptions,
    ) -> TableResult<Block> {
        if let Some(block_cache) = &self.block_cache {
            let cache_key = CacheKey {
                table_id:     self.table_id,
                block_offset: handle.offset,
            };

            if let Some(contents) = block_cache.get(&cache_key) {
                return Block::new(contents);
            }

            let contents = Arc::new(read_block(&*self.file, handle, ropts.verify_checksums)?);
            if ropts.fill_cache {
                block_cache.insert(cache_key, &contents);
            }
            Block::new(contents)
        } else {
            let contents = read_block(&*self.file, handle, ropts.verify_checksums)?;
            Block::new(Arc::new(contents))
        }
    }

    pub(crate) fn index_iter(&self) -> crate::block::BlockIter<Cmp> {
        self.index_block.iter(self.comparator.clone())
    }
}

impl<Cmp, Policy> Debug for Table<Cmp, Policy> {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("Table")
            .field("table_id", &self.table_id)
            .field("has_filter", &self.filter.is_some())
            .finish_non_exhaustive()
    }
}

fn read_exact_at(file: &dyn RandomAccess, offset: u64, output: &mut [u8]) -> TableResult<()> {
    let read_len = file.read_at(offset, output)?;
    if read_len != output.len() {
        return Err(TableError::corruption("truncated read from table file"));
    }
    Ok(())
}

/// Read one block (contents plus trailer), optionally verify its checksum, and decompress it.
pub(crate) fn read_block(
    file:             &dyn RandomAccess,
    handle:           BlockHandle,
    verify_checksums: bool,
) -> TableResult<Vec<u8>> {
    let block_len = usize::try_from(handle.block_size)
        .map_err(|_| TableError::corruption("block size exceeds address space"))?;
    let mut buffer = vec![0; block_len + BLOCK_TRAILER_LEN];
    read_exact_at(file, handle.offset, &mut buffer)?;

    let tag = buffer[block_len];

    if verify_checksums {
        let stored_bytes: [u8; 4] = buffer[block_len + 1..].try_into().expect("4 bytes");
        let stored = unmask_checksum(u32::from_le_bytes(stored_bytes));
        let actual = crc32c_append(crc32c(&buffer[..block_len]), &[tag]);
        if stored != actual {
            return Err(TableError::corruption("block checksum mismatch"));
        }
    }

    decompress_block(tag, &buffer[..block_len])
}


#[cfg(test)]
mod tests {
    use crate::compress::CompressionType;
    use crate::filter::BloomFilterPolicy;
    use super::*;


    fn write_opts(
        filter: bool,
    ) -> WriteTableOptions<BytewiseComparator, BloomFilterPolicy> {
        WriteTableOptions {
            comparator:             BytewiseComparator,
            compression:            CompressionType::None,
            block_size:             256,
            block_restart_interval: 4,
            filter_policy:          filter.then(BloomFilterPolicy::default),
        }
    }

    fn read_opts(
        filter: bool,
        block_cache: Option<BlockCache>,
    ) -> ReadTableOptions<BytewiseComparator, BloomFilterPolicy> {
        ReadTableOptions {
            comparator:       BytewiseComparator,
            filter_policy:    filter.then(BloomFilterPolicy::default),
            block_cache,
            verify_checksums: true,
        }
    }

    fn sample_entries(count: u32) -> Vec<(Vec<u8>, Vec<u8>)> {
        (0..count)
            .map(|index| {
                let key = format!("key{index:06}").into_bytes();
                let value = format!("value{index}").into_bytes();
                (key, value)
            })
            .collect()
    }

    fn build_table(
        entries: &[(Vec<u8>, Vec<u8>)],
        filter:  bool,
    ) -> (Vec<u8>, u64) {
        let mut file = Vec::new();
        let mut builder = TableBuilder::new(write_opts(filter), &mut file);
        for (key, value) in entries {
            builder.add_entry(key, value).unwrap();
        }
        let file_size = builder.finish(false).unwrap();
        assert_eq!(file_size as usize, file.len());
        (file, file_size)
    }

    fn open_table(
        file:      Vec<u8>,
        file_size: u64,
        filter:    bool,
        cache:     Option<BlockCache>,
    ) -> Arc<Table<BytewiseComparator, BloomFilterPolicy>> {
        Arc::new(
            Table::open(read_opts(filter, cache), Box::new(file), file_size, 1).unwrap(),
        )
    }

    #[test]
    fn full_scan_round_trips() {
        for filter in [false, true] {
            let entries = sample_entries(500);
            let (file, file_size) = build_table(&entries, filter);
            let table = open_table(file, file_size, filter, None);

            let mut iter = Table::iter(table, TableReadOptions::default());
            iter.seek_to_first();
            let mut scanned = Vec::new();
            while iter.valid() {
                scanned.push((iter.key().to_vec(), iter.value().to_vec()));
                iter.next();
            }
            iter.status().unwrap();
            assert_eq!(scanned, entries);
        }
    }

    #[test]
    fn point_lookups_find_every_entry() {
        for filter in [false, true] {
            let entries = sample_entries(500);
            let (file, file_size) = build_table(&entries, filter);
            let table = open_table(file, file_size, filter, None);

            let ropts = TableReadOptions::default();
            for (key, value) in &entries {
                let (found_key, found_value) =
                    table.internal_get(&ropts, key).unwrap().expect("key present");
                assert_eq!(&found_key, key);
                assert_eq!(&found_value, value);
            }

            // A key past the end finds nothing.
            assert!(table.internal_get(&ropts, b"zzz").unwrap().is_none());
        }
    }

    #[test]
    fn lookup_returns_successor_for_absent_keys() {
        let entries = sample_entries(100);
        let (file, file_size) = build_table(&entries, false);
        let table = open_table(file, file_size, false, None);

        let (found_key, _) = table
            .internal_get(&TableReadOptions::default(), b"key000010a")
            .unwrap()
            .expect("in range");
        assert_eq!(found_key, b"key000011");
    }

    #[test]
    fn reverse_scan_round_trips() {
        let entries = sample_entries(300);
        let (file, file_size) = build_table(&entries, false);
        let table = open_table(file, file_size, false, None);

        let mut iter = Table::iter(table, TableReadOptions::default());
        iter.seek_to_last();
        let mut scanned = Vec::new();
        while iter.valid() {
            scanned.push((iter.key().to_vec(), iter.value().to_vec()));
            iter.prev();
        }
        scanned.reverse();
        assert_eq!(scanned, entries);
    }

    #[test]
    fn seek_positions_at_lower_bound() {
        let entries = sample_entries(300);
        let (file, file_size) = build_table(&entries, true);
        let table = open_table(file, file_size, true, None);

        let mut iter = Table::iter(table, TableReadOptions::default());
        iter.seek(b"key000123");
        assert!(iter.valid());
        assert_eq!(iter.key(), b"key000123");

        iter.seek(b"key000123a");
        assert_eq!(iter.key(), b"key000124");

        iter.seek(b"zzz");
        assert!(!iter.valid());
    }

    #[test]
    fn block_cache_is_reused_across_reads() {
        let entries = sample_entries(500);
        let (file, file_size) = build_table(&entries, false);
        let cache = BlockCache::new(64);
        let table = open_table(file, file_size, false, Some(cache));

        let ropts = TableReadOptions::default();
        for (key, value) in entries.iter().chain(entries.iter()) {
            let (_, found_value) = table.internal_get(&ropts, key).unwrap().unwrap();
            assert_eq!(&found_value, value);
        }
    }

    #[test]
    fn approximate_offsets_are_monotone() {
        let entries = sample_entries(1_000);
        let (file, file_size) = build_table(&entries, false);
        let table = open_table(file, file_size, false, None);

        let first = table.approximate_offset_of(b"key000000");
        let middle = table.approximate_offset_of(b"key000500");
        let last = table.approximate_offset_of(b"zzz");
        assert!(first <= middle && middle <= last);
        assert!(last <= file_size);
        assert!(middle > 0);
    }

    #[test]
    fn corrupt_footer_fails_to_open() {
        let entries = sample_entries(10);
        let (mut file, file_size) = build_table(&entries, false);
        let len = file.len();
        file[len - 1] ^= 0xff;

        let result = Table::<BytewiseComparator, BloomFilterPolicy>::open(
            read_opts(false, None),
            Box::new(file),
            file_size,
            1,
        );
        assert!(result.is_err());
    }

    #[cfg(feature = "snappy-compression")]
    #[test]
    fn snappy_tables_round_trip() {
        let entries = sample_entries(500);
        let mut file = Vec::new();
        let mut opts = write_opts(false);
        opts.compression = CompressionType::Snappy;
        let mut builder = TableBuilder::new(opts, &mut file);
        for (key, value) in &entries {
            builder.add_entry(key, value).unwrap();
        }
        let file_size = builder.finish(false).unwrap();
        let table = open_table(file, file_size, false, None);

        let mut iter = Table::iter(table, TableReadOptions::default());
        iter.seek_to_first();
        let mut count = 0;
        while iter.valid() {
            count += 1;
            iter.next();
        }
        assert_eq!(count, entries.len());
    }
}
