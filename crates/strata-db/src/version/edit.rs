//! Version edits: the deltas between versions, serialized as tagged fields into the MANIFEST.

use std::collections::BTreeSet;

use integer_encoding::{VarInt as _, VarIntWriter as _};

use crate::config::NUM_LEVELS;
use crate::error::{Error, Result};
use crate::format::{InternalKey, SequenceNumber};


mod tag {
    pub(super) const COMPARATOR:       u32 = 1;
    pub(super) const LOG_NUMBER:       u32 = 2;
    pub(super) const NEXT_FILE_NUMBER: u32 = 3;
    pub(super) const LAST_SEQUENCE:    u32 = 4;
    pub(super) const COMPACT_POINTER:  u32 = 5;
    pub(super) const DELETED_FILE:     u32 = 6;
    pub(super) const NEW_FILE:         u32 = 7;
    // 8 was used by a long-gone format revision and is deliberately skipped.
    pub(super) const PREV_LOG_NUMBER:  u32 = 9;
}

/// A file added to some level by an edit.
#[derive(Debug, Clone)]
pub(crate) struct NewFile {
    pub(crate) level:    usize,
    pub(crate) number:   u64,
    pub(crate) size:     u64,
    pub(crate) smallest: InternalKey,
    pub(crate) largest:  InternalKey,
}

/// A delta between two versions: files added and deleted per level, plus bookkeeping numbers.
#[derive(Debug, Default)]
pub(crate) struct VersionEdit {
    pub(crate) comparator_name:  Option<String>,
    pub(crate) log_number:       Option<u64>,
    pub(crate) prev_log_number:  Option<u64>,
    pub(crate) next_file_number: Option<u64>,
    pub(crate) last_sequence:    Option<SequenceNumber>,
    pub(crate) compact_pointers: Vec<(usize, InternalKey)>,
    pub(crate) deleted_files:    BTreeSet<(usize, u64)>,
    pub(crate) new_files:        Vec<NewFile>,
}

impl VersionEdit {
    #[must_use]
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_file(
        &mut self,
        level:    usize,
        number:   u64,
        size:     u64,
        smallest: InternalKey,
        largest:  InternalKey,
    ) {
        self.new_files.push(NewFile { level, number, size, smallest, largest });
    }

    pub(crate) fn delete_file(&mut self, level: usize, number: u64) {
        self.deleted_files.insert((level, number));
    }

    pub(crate) fn encode(&self, output: &mut Vec<u8>) {
        if let Some(comparator_name) = &self.comparator_name {
            write_varint_u32(output, tag::COMPARATOR);
            write_length_prefixed(output, comparator_name.as_bytes());
        }
        if let Some(log_number) = self.log_number {
            write_varint_u32(output, tag::LOG_NUMBER);
            write_varint_u64(output, log_number);
        }
        if let Some(prev_log_number) = self.prev_log_number {
            write_varint_u32(output, tag::PREV_LOG_NUMBER);
            write_varint_u64(output, prev_log_number);
        }
        if let Some(next_file_number) = self.next_file_number {
            write_varint_u32(output, tag::NEXT_FILE_NUMBER);
            write_varint_u64(output, next_file_number);
        }
        if let Some(last_sequence) = self.last_sequence {
            write_varint_u32(output, tag::LAST_SEQUENCE);
            write_varint_u64(output, last_sequence.inner());
        }
        for (level, key) in &self.compact_pointers {
            write_varint_u32(output, tag::COMPACT_POINTER);
            write_varint_u32(output, *level as u32);
            write_length_prefixed(output, key.encoded());
        }
        for (level, number) in &self.deleted_files {
            write_varint_u32(output, tag::DELETED_FILE);
            write_varint_u32(output, *level as u32);
            write_varint_u64(output, *number);
        }
        for new_file in &self.new_files {
            write_varint_u32(output, tag::NEW_FILE);
            write_varint_u32(output, new_file.level as u32);
            write_varint_u64(output, new_file.number);
            write_varint_u64(output, new_file.size);
            write_length_prefixed(output, new_file.smallest.encoded());
            write_length_prefixed(output, new_file.largest.encoded());
        }
    }

    pub(crate) fn decode_from(mut input: &[u8]) -> Result<Self> {
        let mut edit = Self::new();

        while !input.is_empty() {
            let field_tag = read_varint_u32(&mut input)?;
            match field_tag {
                tag::COMPARATOR => {
                    let name = read_length_prefixed(&mut input)?;
                    let name = String::from_utf8(name.to_vec())
                        .map_err(|_| Error::corruption("comparator name is not UTF-8"))?;
                    edit.comparator_name = Some(name);
                }
                tag::LOG_NUMBER => edit.log_number = Some(read_varint_u64(&mut input)?),
                tag::NEXT_FILE_NUMBER => {
                    edit.next_file_number = Some(read_varint_u64(&mut input)?);
                }
                tag::LAST_SEQUENCE => {
                    edit.last_sequence =
                        Some(SequenceNumber::new_unchecked(read_varint_u64(&mut input)?));
                }
                tag::COMPACT_POINTER => {
                    let level = read_level(&mut input)?;
                    let key = InternalKey::decode(read_length_prefixed(&mut input)?)?;
                    edit.compact_pointers.push((level, key));
                }
                tag::DELETED_FILE => {
                    let level = read_level(&mut input)?;
                    let number = read_varint_u64(&mut input)?;
                    edit.deleted_files.insert((level, number));
                }
                tag::NEW_FILE => {
                    let level = read_level(&mut input)?;
                    let number = read_varint_u64(&mut input)?;
                    let size = read_varint_u64(&mut input)?;
                    let smallest = InternalKey::decode(read_length_prefixed(&mut input)?)?;
                    let largest = InternalKey::decode(read_length_prefixed(&mut input)?)?;
                    edit.new_files.push(NewFile { level, number, size, smallest, largest });
                }
                tag::PREV_LOG_NUMBER => {
                    edit.prev_log_number = Some(read_varint_u64(&mut input)?);
                }
                unknown => {
                    return Err(Error::corruption(format!(
                        "unknown version edit tag {unknown}",
                    )));
                }
            }
        }

        Ok(edit)
    }
}

fn write_varint_u32(output: &mut Vec<u8>, value: u32) {
    output.write_varint(value).expect("writing to a Vec does not fail");
}

fn write_varint_u64(output: &mut Vec<u8>, value: u64) {
    output.write_varint(value).expect("writing to a Vec does not fail");
}

fn write_length_prefixed(output: &mut Vec<u8>, data: &[u8]) {
    write_varint_u32(output, u32::try_from(data.len()).expect("field fits in 4 GiB"));
    output.extend(data);
}

fn read_varint_u32(input: &mut &[u8]) -> Result<u32> {
    let (value, read_len) =
        u32::decode_var(input).ok_or_else(|| Error::corruption("bad varint in version edit"))?;
    *input = &input[read_len..];
    Ok(value)
}

fn read_varint_u64(input: &mut &[u8]) -> Result<u64> {
    let (value, read_len) =
        u64::decode_var(input).ok_or_else(|| Error::corruption("bad varint in version edit"))?;
    *input = &input[read_len..];
    Ok(value)
}

fn read_length_prefixed<'a>(input: &mut &'a [u8]) -> Result<&'a [u8]> {
    let len = read_varint_u32(input)? as usize;
    if len > input.len() {
        return Err(Error::corruption("version edit field overruns the record"));
    }
    let (data, rest) = input.split_at(len);
    *input = rest;
    Ok(data)
}

fn read_level(input: &mut &[u8]) -> Result<usize> {
    let level = read_varint_u32(input)? as usize;
    if level >= NUM_LEVELS {
        return Err(Error::corruption(format!("version edit names level {level}")));
    }
    Ok(level)
}


#[cfg(test)]
mod tests {
    use crate::format::EntryType;
    use super::*;


    fn key(user_key: &[u8], sequence: u64) -> InternalKey {
        InternalKey::new(user_key, SequenceNumber::new_unchecked(sequence), EntryType::Value)
    }

    #[test]
    fn empty_edit_round_trips() {
        let edit = VersionEdit::new();
        let mut encoded = Vec::new();
        edit.encode(&mut encoded);
        assert!(encoded.is_empty());
        assert!(VersionEdit::decode_from(&encoded).is_ok());
    }

    #[test]
    fn full_edit_round_trips() {
        let mut edit = VersionEdit::new();
        edit.comparator_name = Some("leveldb.BytewiseComparator".to_owned());
        edit.log_number = Some(10);
        edit.prev_log_number = Some(9);
        edit.next_file_number = Some(20);
        edit.last_sequence = Some(SequenceNumber::new_unchecked(1000));
        edit.compact_pointers.push((2, key(b"pointer", 5)));
        edit.delete_file(1, 4);
        edit.delete_file(3, 7);
        edit.add_file(2, 15, 4096, key(b"aaa", 3), key(b"zzz", 1));

        let mut encoded = Vec::new();
        edit.encode(&mut encoded);
        let decoded = VersionEdit::decode_from(&encoded).unwrap();

        assert_eq!(decoded.comparator_name.as_deref(), Some("leveldb.BytewiseComparator"));
        assert_eq!(decoded.log_number, Some(10));
        assert_eq!(decoded.prev_log_number, Some(9));
        assert_eq!(decoded.next_file_number, Some(20));
        assert_eq!(decoded.last_sequence, Some(SequenceNumber::new_unchecked(1000)));
        assert_eq!(decoded.compact_pointers.len(), 1);
        assert_eq!(decoded.compact_pointers[0].0, 2);
        assert_eq!(decoded.compact_pointers[0].1.user_key(), b"pointer");
        assert_eq!(
            decoded.deleted_files.iter().copied().collect::<Vec<_>>(),
            vec![(1, 4), (3, 7)],
        );
        assert_eq!(decoded.new_files.len(), 1);
        assert_eq!(decoded.new_files[0].level, 2);
        assert_eq!(decoded.new_files[0].number, 15);
        assert_eq!(decoded.new_files[0].size, 4096);
        assert_eq!(decoded.new_files[0].smallest.user_key(), b"aaa");
        assert_eq!(decoded.new_files[0].largest.user_key(), b"zzz");
    }

    #[test]
    fn unknown_tags_are_corruption() {
        let mut encoded = Vec::new();
        write_varint_u32(&mut encoded, 8);
        assert!(VersionEdit::decode_from(&encoded).is_err());

        let mut encoded = Vec::new();
        write_varint_u32(&mut encoded, 100);
        assert!(VersionEdit::decode_from(&encoded).is_err());
    }

    #[test]
    fn out_of_range_levels_are_corruption() {
        let mut encoded = Vec::new();
        write_varint_u32(&mut encoded, tag::DELETED_FILE);
        write_varint_u32(&mut encoded, NUM_LEVELS as u32);
        write_varint_u64(&mut encoded, 1);
        assert!(VersionEdit::decode_from(&encoded).is_err());
    }

    #[test]
    fn truncated_fields_are_corruption() {
        let mut edit = VersionEdit::new();
        edit.add_file(0, 1, 100, key(b"a", 1), key(b"b", 1));
        let mut encoded = Vec::new();
        edit.encode(&mut encoded);
        encoded.truncate(encoded.len() - 4);
        assert!(VersionEdit::decode_from(&encoded).is_err());
    }
}
