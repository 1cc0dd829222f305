//! The record format shared by write-ahead logs and MANIFEST files: a stream of 32 KiB blocks,
//! each holding `[masked crc32c: 4][length: 2][type: 1][payload]` physical records. A logical
//! record is one `Full` record or a `First … Middle* … Last` chain; block remainders shorter
//! than a header are zero-padded.

mod reader;
mod writer;


pub(crate) use self::reader::{CorruptionReporter, LogReader};
pub(crate) use self::writer::LogWriter;


/// The header of each physical record: checksum, length, type.
pub(crate) const RECORD_HEADER_LEN: usize = 4 + 2 + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LogRecordType {
    /// Reserved for zero-filled padding regions.
    Zero   = 0,
    Full   = 1,
    First  = 2,
    Middle = 3,
    Last   = 4,
}

impl LogRecordType {
    pub(crate) const ALL_TYPES: [Self; 5] = [
        Self::Zero, Self::Full, Self::First, Self::Middle, Self::Last,
    ];

    #[must_use]
    pub(crate) fn from_u8(tag: u8) -> Option<Self> {
        Self::ALL_TYPES.into_iter().find(|&record_type| record_type as u8 == tag)
    }
}


#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use crate::config::LOG_BLOCK_SIZE;
    use super::*;


    #[derive(Default)]
    struct CountingReporter {
        dropped_bytes: usize,
        reports:       usize,
    }

    impl CorruptionReporter for CountingReporter {
        fn corruption(&mut self, bytes: usize, _reason: &str) {
            self.dropped_bytes += bytes;
            self.reports += 1;
        }
    }

    fn write_records(records: &[Vec<u8>]) -> Vec<u8> {
        let mut file = Vec::new();
        let mut writer = LogWriter::new_empty(&mut file);
        for record in records {
            writer.add_record(record).unwrap();
        }
        file
    }

    fn read_all(contents: Vec<u8>) -> (Vec<Vec<u8>>, CountingReporter) {
        let mut reporter = CountingReporter::default();
        let mut records = Vec::new();
        {
            let mut reader = LogReader::new(Cursor::new(contents), true, 0);
            let mut record = Vec::new();
            while reader.read_record(&mut record, &mut reporter) {
                records.push(record.clone());
            }
        }
        (records, reporter)
    }

    #[test]
    fn small_records_round_trip() {
        let records = vec![b"foo".to_vec(), b"bar".to_vec(), Vec::new(), b"baz".to_vec()];
        let (read, reporter) = read_all(write_records(&records));
        assert_eq!(read, records);
        assert_eq!(reporter.reports, 0);
    }

    #[test]
    fn records_fragment_across_blocks() {
        // One record smaller than a block, one spanning several blocks, one tiny.
        let records = vec![
            vec![b'a'; LOG_BLOCK_SIZE / 2],
            vec![b'b'; LOG_BLOCK_SIZE * 3],
            b"tail".to_vec(),
        ];
        let contents = write_records(&records);
        assert!(contents.len() > LOG_BLOCK_SIZE * 3);

        let (read, reporter) = read_all(contents);
        assert_eq!(read.len(), 3);
        assert_eq!(read, records);
        assert_eq!(reporter.reports, 0);
    }

    #[test]
    fn block_trailers_are_zero_padded() {
        // A record sized so exactly six bytes remain in the first block.
        let payload_len = LOG_BLOCK_SIZE - RECORD_HEADER_LEN - 6;
        let records = vec![vec![b'x'; payload_len], b"next".to_vec()];
        let contents = write_records(&records);

        assert_eq!(&contents[LOG_BLOCK_SIZE - 6..LOG_BLOCK_SIZE], &[0; 6]);

        let (read, reporter) = read_all(contents);
        assert_eq!(read, records);
        assert_eq!(reporter.reports, 0);
    }

    #[test]
    fn corrupt_record_is_skipped_and_reported() {
        let records = vec![b"first".to_vec(), b"second".to_vec(), b"third".to_vec()];
        let mut contents = write_records(&records);
        // Flip a payload byte of the second record.
        let second_payload_at = 2 * RECORD_HEADER_LEN + records[0].len() + 1;
        contents[second_payload_at] ^= 0xff;

        let (read, reporter) = read_all(contents);
        // The corrupt length field cannot be trusted, so the rest of the block (including the
        // third record) is dropped and reading resumes at the next block boundary.
        assert_eq!(read, vec![b"first".to_vec()]);
        assert!(reporter.reports > 0);
        assert!(reporter.dropped_bytes >= records[1].len());
    }

    #[test]
    fn truncated_tail_is_eof_not_corruption() {
        let records = vec![b"first".to_vec(), b"second-record".to_vec()];
        let mut contents = write_records(&records);
        contents.truncate(contents.len() - 5);

        let (read, reporter) = read_all(contents);
        assert_eq!(read, vec![b"first".to_vec()]);
        // A record cut short by a crash is an expected end, not corruption.
        assert_eq!(reporter.reports, 0);
    }

    #[test]
    fn initial_offset_skips_to_the_containing_block(){
        let records = vec![
            vec![b'a'; LOG_BLOCK_SIZE / 2],
            vec![b'b'; LOG_BLOCK_SIZE / 2],
            b"last".to_vec(),
        ];
        let contents = write_records(&records);

        let mut reporter = CountingReporter::default();
        let mut reader = LogReader::new(
            Cursor::new(contents),
            true,
            (LOG_BLOCK_SIZE / 2) as u64,
        );
        let mut record = Vec::new();
        let mut read = Vec::new();
        while reader.read_record(&mut record, &mut reporter) {
            read.push(record.clone());
        }

        // The first record starts before the initial offset and must not be returned.
        assert_eq!(read, vec![records[1].clone(), records[2].clone()]);
    }

    #[test]
    fn writer_resumes_mid_block() {
        let mut file = Vec::new();
        {
            let mut writer = LogWriter::new_empty(&mut file);
            writer.add_record(b"first").unwrap();
        }
        let resume_at = file.len() as u64;
        {
            let mut writer = LogWriter::new_with_offset(&mut file, resume_at);
            writer.add_record(b"second").unwrap();
        }

        let (read, reporter) = read_all(file);
        assert_eq!(read, vec![b"first".to_vec(), b"second".to_vec()]);
        assert_eq!(reporter.reports, 0);
    }
}
