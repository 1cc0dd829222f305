use std::io::Read;
use std::ops::Range;

use crate::config::LOG_BLOCK_SIZE;
use crate::format::unmask_checksum;
use super::{LogRecordType, RECORD_HEADER_LEN};


/// Receives reports of data dropped while reading a log: how many bytes were skipped and why.
pub(crate) trait CorruptionReporter {
    fn corruption(&mut self, bytes: usize, reason: &str);
}

impl CorruptionReporter for () {
    fn corruption(&mut self, _bytes: usize, _reason: &str) {}
}

enum PhysicalRecord {
    Record(LogRecordType, Range<usize>),
    Eof,
    /// A physical record was skipped: corruption, padding, or a record from before the
    /// initial offset. Reports (if warranted) have already been made.
    Bad,
}

/// A forward-only reader of the block-structured log format.
///
/// Corrupt regions are reported to the caller's [`CorruptionReporter`] and skipped, with
/// reading resuming at the next block boundary. A record that is cut short by end-of-file is
/// treated as a crash mid-write, not as corruption.
#[derive(Debug)]
pub(crate) struct LogReader<File> {
    file:             File,
    verify_checksums: bool,
    /// The current block's bytes; shorter than [`LOG_BLOCK_SIZE`] only at end-of-file.
    block:            Vec<u8>,
    /// Read position within `block`.
    block_pos:        usize,
    eof:              bool,
    /// File offset just past the bytes currently in `block`.
    end_of_buffer_offset: u64,
    /// Records beginning before this file offset are silently skipped.
    initial_offset:   u64,
    /// After seeking to `initial_offset`, skip fragments until the next record start.
    resyncing:        bool,
    skipped_to_start: bool,
}

impl<File: Read> LogReader<File> {
    #[must_use]
    pub(crate) fn new(file: File, verify_checksums: bool, initial_offset: u64) -> Self {
        Self {
            file,
            verify_checksums,
            block:                Vec::new(),
            block_pos:            0,
            eof:                  false,
            end_of_buffer_offset: 0,
            initial_offset,
            resyncing:            initial_offset > 0,
            skipped_to_start:     false,
        }
    }

    /// Read the next logical record into `record`. Returns `false` at end-of-file.
    pub(crate) fn read_record(
        &mut self,
        record:   &mut Vec<u8>,
        reporter: &mut dyn CorruptionReporter,
    ) -> bool {
        if !self.skipped_to_start {
            self.skipped_to_start = true;
            if !self.skip_to_initial_block(reporter) {
                return false;
            }
        }

        record.clear();
        let mut in_fragmented_record = false;

        loop {
            match self.read_physical_record(reporter) {
                PhysicalRecord::Record(record_type, payload) => {
                    if self.resyncing {
                        match record_type {
                            LogRecordType::Middle => continue,
                            LogRecordType::Last => {
                                self.resyncing = false;
                                continue;
                            }
                            _ => self.resyncing = false,
                        }
                    }

                    let fragment = &self.block[payload];
                    match record_type {
                        LogRecordType::Full => {
                            if in_fragmented_record && !record.is_empty() {
                                reporter
                                    .corruption(record.len(), "partial record without end(1)");
                            }
                            record.clear();
                            record.extend(fragment);
                            return true;
                        }
                        LogRecordType::First => {
                            if in_fragmented_record && !record.is_empty() {
                                reporter
                                    .corruption(record.len(), "partial record without end(2)");
                            }
                            record.clear();
                            record.extend(fragment);
                            in_fragmented_record = true;
                        }
                        LogRecordType::Middle => {
                            if in_fragmented_record {
                                record.extend(fragment);
                            } else {
                                reporter.corruption(
                                    fragment.len(),
                                    "missing start of fragmented record(1)",
                                );
                            }
                        }
                        LogRecordType::Last => {
                            if in_fragmented_record {
                                record.extend(fragment);
                                return true;
                            }
                            reporter.corruption(
                                fragment.len(),
                                "missing start of fragmented record(2)",
                            );
                        }
                        LogRecordType::Zero => {
                            // `read_physical_record` never returns padding.
                            debug_assert!(false, "padding surfaced as a record");
                        }
                    }
                }
                PhysicalRecord::Eof => {
                    if in_fragmented_record {
                        // The writer died mid-record; the partial data is unusable but this
                        // is an expected crash shape, not corruption.
                        record.clear();
                    }
                    return false;
                }
                PhysicalRecord::Bad => {
                    if in_fragmented_record {
                        reporter.corruption(record.len(), "error in middle of record");
                        in_fragmented_record = false;
                        record.clear();
                    }
                }
            }
        }
    }

    /// Discard whole blocks up to the one containing `initial_offset`. Returns `false` on an
    /// unreadable file.
    fn skip_to_initial_block(&mut self, reporter: &mut dyn CorruptionReporter) -> bool {
        let offset_in_block = (self.initial_offset % LOG_BLOCK_SIZE as u64) as usize;
        let mut block_start = self.initial_offset - offset_in_block as u64;

        // An offset inside a block's zero-padded tail belongs to the next block.
        if offset_in_block > LOG_BLOCK_SIZE - (RECORD_HEADER_LEN - 1) {
            block_start += LOG_BLOCK_SIZE as u64;
        }

        let mut to_skip = block_start;
        let mut scratch = [0_u8; 4096];
        while to_skip > 0 {
            let chunk_len = (scratch.len() as u64).min(to_skip) as usize;
            match self.file.read(&mut scratch[..chunk_len]) {
                Ok(0) => return false,
                Ok(read_len) => to_skip -= read_len as u64,
                Err(error) => {
                    reporter.corruption(to_skip as usize, &error.to_string());
                    return false;
                }
            }
        }
        self.end_of_buffer_offset = block_start;
        true
    }

    fn read_physical_record(
        &mut self,
        reporter: &mut dyn CorruptionReporter,
    ) -> PhysicalRecord {
        loop {
            if self.block.len() - self.block_pos < RECORD_HEADER_LEN {
                if self.eof {
                    // A header cut short by end-of-file: the writer died mid-write.
                    return PhysicalRecord::Eof;
                }
                // The remainder (if any) is block padding; refill with the next block.
                if !self.refill_block(reporter) {
                    return PhysicalRecord::Eof;
                }
                continue;
            }

            let header = &self.block[self.block_pos..self.block_pos + RECORD_HEADER_LEN];
            let stored_checksum =
                u32::from_le_bytes(header[..4].try_into().expect("4 bytes"));
            let length =
                u16::from_le_bytes(header[4..6].try_into().expect("2 bytes")) as usize;
            let tag = header[6];

            if RECORD_HEADER_LEN + length > self.block.len() - self.block_pos {
                let drop_size = self.block.len() - self.block_pos;
                self.block_pos = self.block.len();
                if !self.eof {
                    reporter.corruption(drop_size, "bad record length");
                    return PhysicalRecord::Bad;
                }
                // The writer died while writing this record's payload.
                return PhysicalRecord::Eof;
            }

            if tag == LogRecordType::Zero as u8 && length == 0 {
                // Zero-filled padding (or a preallocated region); skip the rest of the block
                // without reporting.
                self.block_pos = self.block.len();
                return PhysicalRecord::Bad;
            }

            let Some(record_type) = LogRecordType::from_u8(tag) else {
                let drop_size = self.block.len() - self.block_pos;
                self.block_pos = self.block.len();
                reporter.corruption(drop_size, "unknown record type");
                return PhysicalRecord::Bad;
            };

            if self.verify_checksums {
                let checked_region = &self.block
                    [self.block_pos + 6..self.block_pos + RECORD_HEADER_LEN + length];
                let actual = crc32c::crc32c(checked_region);
                if unmask_checksum(stored_checksum) != actual {
                    // The length field itself may be corrupt, so nothing after this point in
                    // the block can be trusted.
                    let drop_size = self.block.len() - self.block_pos;
                    self.block_pos = self.block.len();
                    reporter.corruption(drop_size, "checksum mismatch");
                    return PhysicalRecord::Bad;
                }
            }

            let payload_start = self.block_pos + RECORD_HEADER_LEN;
            let payload = payload_start..payload_start + length;
            self.block_pos += RECORD_HEADER_LEN + length;

            // Physical records beginning before the initial offset are skipped silently.
            let record_start = self.end_of_buffer_offset
                - self.block.len() as u64
                + (payload_start - RECORD_HEADER_LEN) as u64;
            if record_start < self.initial_offset {
                return PhysicalRecord::Bad;
            }

            return PhysicalRecord::Record(record_type, payload);
        }
    }

    /// Read the next block. Returns `false` if no bytes remain.
    fn refill_block(&mut self, reporter: &mut dyn CorruptionReporter) -> bool {
        self.block.clear();
        self.block.resize(LOG_BLOCK_SIZE, 0);
        self.block_pos = 0;

        let mut filled = 0;
        while filled < LOG_BLOCK_SIZE {
            match self.file.read(&mut self.block[filled..]) {
                Ok(0) => break,
                Ok(read_len) => filled += read_len,
                Err(error) => {
                    reporter.corruption(LOG_BLOCK_SIZE, &error.to_string());
                    self.block.clear();
                    self.eof = true;
                    return false;
                }
            }
        }

        self.block.truncate(filled);
        self.end_of_buffer_offset += filled as u64;
        if filled < LOG_BLOCK_SIZE {
            self.eof = true;
        }
        filled > 0
    }
}
