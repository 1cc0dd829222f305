use std::io::Result as IoResult;

use strata_sstable::WritableTableFile;

use crate::config::LOG_BLOCK_SIZE;
use crate::format::mask_checksum;
use super::{LogRecordType, RECORD_HEADER_LEN};


/// A writer for the block-structured log format, fragmenting each logical record into physical
/// records that never straddle a block boundary.
#[derive(Debug)]
pub(crate) struct LogWriter<File> {
    log_file:        File,
    /// CRC of each record type's tag byte, precomputed so a record checksum is one append.
    type_checksums:  [u32; LogRecordType::ALL_TYPES.len()],
    /// Space remaining in the current block, in `1..=LOG_BLOCK_SIZE`.
    remaining_space: usize,
}

impl<File: WritableTableFile> LogWriter<File> {
    #[must_use]
    pub(crate) fn new_empty(log_file: File) -> Self {
        Self::new_with_offset(log_file, 0)
    }

    /// A writer resuming at byte `offset` of an existing log file, so block accounting stays
    /// aligned with what is already on disk.
    #[must_use]
    pub(crate) fn new_with_offset(log_file: File, offset: u64) -> Self {
        let offset_into_block = (offset % LOG_BLOCK_SIZE as u64) as usize;
        let type_checksums = LogRecordType::ALL_TYPES
            .map(|record_type| crc32c::crc32c(&[record_type as u8]));

        Self {
            log_file,
            type_checksums,
            remaining_space: LOG_BLOCK_SIZE - offset_into_block,
        }
    }

    /// Append one logical record. A failure here must be treated as fatal for further writes to
    /// this log: partial record data may already be on disk, and appending more records after
    /// it could corrupt them too.
    pub(crate) fn add_record(&mut self, record: &[u8]) -> IoResult<()> {
        let result = self.inner_add_record(record);
        let flush_result = self.log_file.flush();
        result.and(flush_result)
    }

    /// Ask the OS to sync the log file's data to persistent storage.
    pub(crate) fn sync(&mut self) -> IoResult<()> {
        self.log_file.sync_data()
    }

    fn inner_add_record(&mut self, mut record: &[u8]) -> IoResult<()> {
        let mut first_physical = true;
        let max_trailer = [0_u8; RECORD_HEADER_LEN - 1];

        // Empty records are permitted; they emit a single zero-length Full record.
        while !record.is_empty() || first_physical {
            if let Some(trailer) = max_trailer.get(..self.remaining_space) {
                // Fewer than `RECORD_HEADER_LEN` bytes remain in this block: zero-fill them
                // and move on to the next block.
                self.log_file.write_all(trailer)?;
                self.remaining_space = LOG_BLOCK_SIZE;
            }

            let fragment_len = record.len().min(self.remaining_space - RECORD_HEADER_LEN);
            let last_physical = fragment_len == record.len();

            let record_type = match (first_physical, last_physical) {
                (true,  true)  => LogRecordType::Full,
                (true,  false) => LogRecordType::First,
                (false, false) => LogRecordType::Middle,
                (false, true)  => LogRecordType::Last,
            };

            let (fragment, remaining) = record.split_at(fragment_len);

            let checksum = crc32c::crc32c_append(
                self.type_checksums[record_type as usize],
                fragment,
            );
            let masked_checksum = mask_checksum(checksum);
            let fragment_len_u16 =
                u16::try_from(fragment_len).expect("fragments are far smaller than a block");

            self.log_file.write_all(&masked_checksum.to_le_bytes())?;
            self.log_file.write_all(&fragment_len_u16.to_le_bytes())?;
            self.log_file.write_all(&[record_type as u8])?;
            self.log_file.write_all(fragment)?;

            record = remaining;
            first_physical = false;
            self.remaining_space -= RECORD_HEADER_LEN + fragment_len;
        }

        Ok(())
    }
}
