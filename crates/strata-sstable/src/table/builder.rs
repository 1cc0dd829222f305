use crc32c::{crc32c, crc32c_append};

use crate::block::BlockBuilder;
use crate::comparator::TableComparator;
use crate::compress::{CompressionType, compress_block};
use crate::error::TableResult;
use crate::file::WritableTableFile;
use crate::filter::FilterPolicy;
use crate::filter_block::FilterBlockBuilder;
use crate::format::{BLOCK_TRAILER_LEN, BlockHandle, FILTER_META_PREFIX, TableFooter, mask_checksum};


/// Options for building one table file.
#[derive(Debug, Clone)]
pub struct WriteTableOptions<Cmp, Policy> {
    pub comparator:             Cmp,
    pub compression:            CompressionType,
    /// Target uncompressed size at which a data block is cut.
    pub block_size:             usize,
    pub block_restart_interval: usize,
    pub filter_policy:          Option<Policy>,
}

/// Builds a [`Table`] file from entries added in strictly increasing key order (under the
/// configured comparator). The builder does not validate the ordering; violating it produces an
/// invalid table.
///
/// [`Table`]: crate::table::Table
#[derive(Debug)]
pub struct TableBuilder<Cmp, Policy, File> {
    comparator:     Cmp,
    compression:    CompressionType,
    block_size:     usize,

    table_file:     File,
    offset_in_file: u64,
    num_entries:    usize,

    data_block:     BlockBuilder,
    index_block:    BlockBuilder,
    filter_block:   Option<FilterBlockBuilder<Policy>>,

    /// Should almost always be empty, except while in direct use.
    short_scratch:  Vec<u8>,
    compressed_buf: Vec<u8>,
}

impl<Cmp, Policy, File> TableBuilder<Cmp, Policy, File>
where
    Cmp:    TableComparator,
    Policy: FilterPolicy,
    File:   WritableTableFile,
{
    #[must_use]
    pub fn new(opts: WriteTableOptions<Cmp, Policy>, table_file: File) -> Self {
        let mut filter_block = opts.filter_policy.map(FilterBlockBuilder::new);
        if let Some(filter_block) = &mut filter_block {
            filter_block.start_block(0);
        }

        Self {
            comparator:     opts.comparator,
            compression:    opts.compression,
            block_size:     opts.block_size,
            table_file,
            offset_in_file: 0,
            num_entries:    0,
            data_block:     BlockBuilder::new(opts.block_restart_interval),
            index_block:    BlockBuilder::new(opts.block_restart_interval),
            filter_block,
            short_scratch:  Vec::new(),
            compressed_buf: Vec::new(),
        }
    }

    #[must_use]
    pub fn num_entries(&self) -> usize {
        self.num_entries
    }

    /// A rough estimate of the final file length if [`Self::finish`] were called now, ignoring
    /// compression of the still-unwritten blocks.
    #[must_use]
    pub fn estimated_file_size(&self) -> u64 {
        let additional = self.data_block.finished_length()
            + self.index_block.finished_length()
            + self.filter_block.as_ref().map(FilterBlockBuilder::finished_length).unwrap_or(0)
            + TableFooter::ENCODED_LENGTH;
        self.offset_in_file + additional as u64
    }

    /// `key` must compare strictly greater than every previously added key.
    pub fn add_entry(&mut self, key: &[u8], value: &[u8]) -> TableResult<()> {
        let reached_block_size = self.data_block.finished_length() > self.block_size
            && self.data_block.num_entries() > 0;
        if reached_block_size {
            // `key` is the first key of the next block, so it bounds the separator from above.
            self.write_data_block(Some(key))?;
        }

        if let Some(filter_block) = &mut self.filter_block {
            filter_block.add_key(key);
        }

        self.data_block.add_entry(key, value);
        self.num_entries += 1;

        Ok(())
    }

    /// Write any pending data, the filter and metaindex blocks, the index block and the footer.
    /// Optionally syncs file data to persistent storage. Returns the total file length.
    pub fn finish(mut self, sync_file_data: bool) -> TableResult<u64> {
        if self.data_block.num_entries() > 0 {
            self.write_data_block(None)?;
        }

        // The data block builder is reset and will not be used for data again; reuse it for the
        // metaindex block, which holds at most the one filter entry. The metaindex block is
        // always ordered bytewise, but with zero or one entries the comparator is irrelevant.
        if let Some(filter_block) = &mut self.filter_block {
            self.short_scratch.clear();
            self.short_scratch.extend(FILTER_META_PREFIX.as_bytes());
            self.short_scratch.extend(filter_block.policy().name().as_bytes());
            let filter_key = std::mem::take(&mut self.short_scratch);

            let filter_contents = filter_block.finish();
            let filter_handle = Self::write_raw_block(
                &mut self.table_file,
                &mut self.offset_in_file,
                filter_contents,
                CompressionType::None.tag(),
            )?;

            let mut encoded_handle = Vec::new();
            filter_handle.encode_to(&mut encoded_handle);
            self.data_block.add_entry(&filter_key, &encoded_handle);

            self.short_scratch = filter_key;
            self.short_scratch.clear();
        }

        let metaindex_contents = self.data_block.finish_block_contents();
        let metaindex = Self::write_block(
            &mut self.table_file,
            &mut self.offset_in_file,
            &mut self.compressed_buf,
            metaindex_contents,
            self.compression,
        )?;

        let index_contents = self.index_block.finish_block_contents();
        let index = Self::write_block(
            &mut self.table_file,
            &mut self.offset_in_file,
            &mut self.compressed_buf,
            index_contents,
            self.compression,
        )?;

        self.short_scratch.clear();
        TableFooter { metaindex, index }.encode_to(&mut self.short_scratch);
        self.table_file.write_all(&self.short_scratch)?;
        self.offset_in_file += TableFooter::ENCODED_LENGTH as u64;

        self.table_file.flush()?;
        if sync_file_data {
            self.table_file.sync_data()?;
        }

        Ok(self.offset_in_file)
    }

    /// If `Some`, `next_key` must be strictly greater than any key in the current block and
    /// less than or equal to any key in the next block. If `None`, this is the final data block.
    ///
    /// Must not be called while `self.data_block` is empty.
    fn write_data_block(&mut self, next_key: Option<&[u8]>) -> TableResult<()> {
        if let Some(next_key) = next_key {
            self.comparator.find_short_separator(
                self.data_block.last_key(),
                next_key,
                &mut self.short_scratch,
            );
        } else {
            self.comparator
                .find_short_successor(self.data_block.last_key(), &mut self.short_scratch);
        }

        let block_contents = self.data_block.finish_block_contents();
        let block_handle = Self::write_block(
            &mut self.table_file,
            &mut self.offset_in_file,
            &mut self.compressed_buf,
            block_contents,
            self.compression,
        )?;
        self.data_block.reset();

        let mut encoded_handle = Vec::new();
        block_handle.encode_to(&mut encoded_handle);
        // The separator is strictly greater than every key in the finished block, and thus
        // strictly greater than every earlier index entry.
        self.index_block.add_entry(&self.short_scratch, &encoded_handle);
        self.short_scratch.clear();

        if let Some(filter_block) = &mut self.filter_block {
            filter_block.start_block(self.offset_in_file);
        }

        Ok(())
    }

    fn write_block(
        table_file:     &mut File,
        offset_in_file: &mut u64,
        compressed_buf: &mut Vec<u8>,
        block_contents: &[u8],
        compression:    CompressionType,
    ) -> TableResult<BlockHandle> {
        let tag = compress_block(compression, block_contents, compressed_buf)?;
        let handle = Self::write_raw_block(table_file, offset_in_file, compressed_buf, tag)?;
        compressed_buf.clear();
        Ok(handle)
    }

    /// Write already-encoded block contents followed by the `[tag][masked crc]` trailer.
    fn write_raw_block(
        table_file:     &mut File,
        offset_in_file: &mut u64,
        contents:       &[u8],
        tag:            u8,
    ) -> TableResult<BlockHandle> {
        // The checksum covers the on-disk bytes plus the tag; on-disk compatibility depends on
        // this exact domain.
        let digest = crc32c_append(crc32c(contents), &[tag]);
        let masked = mask_checksum(digest);

        table_file.write_all(contents)?;
        table_file.write_all(&[tag])?;
        table_file.write_all(&masked.to_le_bytes())?;

        let handle = BlockHandle {
            offset:     *offset_in_file,
            block_size: contents.len() as u64,
        };
        *offset_in_file += (contents.len() + BLOCK_TRAILER_LEN) as u64;

        Ok(handle)
    }
}
