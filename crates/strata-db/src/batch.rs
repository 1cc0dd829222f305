//! Atomic write batches and their serialized form, which is exactly what goes into the
//! write-ahead log: an 8-byte starting sequence number, a 4-byte entry count, then the tagged,
//! length-prefixed entries.

use integer_encoding::{VarInt as _, VarIntWriter as _};

use crate::error::{Error, Result};
use crate::format::{EntryType, SequenceNumber};


/// `[sequence: u64 le][count: u32 le]`
const BATCH_HEADER_LEN: usize = 12;


/// A collection of puts and deletions applied to the database as one atomic unit.
///
/// The entries of a batch receive consecutive sequence numbers when the batch is committed, and
/// either all of them or none of them survive a crash.
#[derive(Debug, Clone)]
pub struct WriteBatch {
    rep: Vec<u8>,
}

impl Default for WriteBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteBatch {
    #[must_use]
    pub fn new() -> Self {
        Self {
            rep: vec![0; BATCH_HEADER_LEN],
        }
    }

    /// Queue a `key → value` mapping.
    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.push(EntryType::Value as u8);
        self.append_length_prefixed(key);
        self.append_length_prefixed(value);
    }

    /// Queue a deletion of `key`.
    pub fn delete(&mut self, key: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.push(EntryType::Deletion as u8);
        self.append_length_prefixed(key);
    }

    /// Discard all queued entries.
    pub fn clear(&mut self) {
        self.rep.clear();
        self.rep.resize(BATCH_HEADER_LEN, 0);
    }

    /// The number of queued entries. Empty batches are legal.
    #[must_use]
    pub fn len(&self) -> u32 {
        self.count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// The serialized size of the batch, which is also its write-ahead-log footprint.
    #[must_use]
    pub fn approximate_size(&self) -> usize {
        self.rep.len()
    }

    fn append_length_prefixed(&mut self, data: &[u8]) {
        self.rep
            .write_varint(u32::try_from(data.len()).expect("keys and values fit in 4 GiB"))
            .expect("writing to a Vec does not fail");
        self.rep.extend(data);
    }

    pub(crate) fn count(&self) -> u32 {
        u32::from_le_bytes(self.rep[8..12].try_into().expect("4 bytes"))
    }

    pub(crate) fn set_count(&mut self, count: u32) {
        self.rep[8..12].copy_from_slice(&count.to_le_bytes());
    }

    pub(crate) fn sequence(&self) -> SequenceNumber {
        SequenceNumber::new_unchecked(u64::from_le_bytes(
            self.rep[..8].try_into().expect("8 bytes"),
        ))
    }

    pub(crate) fn set_sequence(&mut self, sequence: SequenceNumber) {
        self.rep[..8].copy_from_slice(&sequence.inner().to_le_bytes());
    }

    /// Move another batch's entries onto the end of this one, for group commit.
    pub(crate) fn append(&mut self, other: &Self) {
        self.set_count(self.count() + other.count());
        self.rep.extend(&other.rep[BATCH_HEADER_LEN..]);
    }

    pub(crate) fn contents(&self) -> &[u8] {
        &self.rep
    }

    /// Reconstitute a batch from a write-ahead-log record, validating its shape.
    pub(crate) fn from_contents(contents: Vec<u8>) -> Result<Self> {
        if contents.len() < BATCH_HEADER_LEN {
            return Err(Error::corruption("write batch record shorter than its header"));
        }
        let batch = Self { rep: contents };
        // Walk the entries once so later consumers cannot trip over a malformed body.
        batch.iterate(|_entry| Ok(()))?;
        Ok(batch)
    }

    /// Visit every entry in insertion order, validating the encoding as it goes.
    pub(crate) fn iterate<F>(&self, mut visit: F) -> Result<()>
    where
        F: FnMut(BatchEntry<'_>) -> Result<()>,
    {
        let mut input = &self.rep[BATCH_HEADER_LEN..];
        let mut seen = 0_u32;

        while !input.is_empty() {
            let tag = input[0];
            input = &input[1..];

            match EntryType::try_from_u8(tag)? {
                EntryType::Value => {
                    let key = take_length_prefixed(&mut input)?;
                    let value = take_length_prefixed(&mut input)?;
                    visit(BatchEntry::Value { key, value })?;
                }
                EntryType::Deletion => {
                    let key = take_length_prefixed(&mut input)?;
                    visit(BatchEntry::Deletion { key })?;
                }
            }
            seen += 1;
        }

        if seen == self.count() {
            Ok(())
        } else {
            Err(Error::corruption("write batch count does not match its contents"))
        }
    }
}

/// One entry of a [`WriteBatch`], borrowing the batch's buffer.
#[derive(Debug, Clone, Copy)]
pub(crate) enum BatchEntry<'a> {
    Value { key: &'a [u8], value: &'a [u8] },
    Deletion { key: &'a [u8] },
}

fn take_length_prefixed<'a>(input: &mut &'a [u8]) -> Result<&'a [u8]> {
    let (len, len_len) = u32::decode_var(input)
        .ok_or_else(|| Error::corruption("bad length prefix in write batch"))?;
    let end = len_len + len as usize;
    if end > input.len() {
        return Err(Error::corruption("write batch entry overruns the record"));
    }
    let data = &input[len_len..end];
    *input = &input[end..];
    Ok(data)
}


#[cfg(test)]
mod tests {
    use super::*;


    fn collect(batch: &WriteBatch) -> Vec<(Vec<u8>, Option<Vec<u8>>)> {
        let mut entries = Vec::new();
        batch
            .iterate(|entry| {
                match entry {
                    BatchEntry::Value { key, value } => {
                        entries.push((key.to_vec(), Some(value.to_vec())));
                    }
                    BatchEntry::Deletion { key } => entries.push((key.to_vec(), None)),
                }
                Ok(())
            })
            .unwrap();
        entries
    }

    #[test]
    fn empty_batch_is_legal() {
        let batch = WriteBatch::new();
        assert!(batch.is_empty());
        assert_eq!(collect(&batch), vec![]);

        let decoded = WriteBatch::from_contents(batch.contents().to_vec()).unwrap();
        assert_eq!(decoded.count(), 0);
    }

    #[test]
    fn batch_round_trips_through_its_encoding() {
        let mut batch = WriteBatch::new();
        batch.put(b"a", b"1");
        batch.delete(b"b");
        batch.put(b"c", b"3");
        batch.set_sequence(SequenceNumber::new_unchecked(100));

        let decoded = WriteBatch::from_contents(batch.contents().to_vec()).unwrap();
        assert_eq!(decoded.count(), 3);
        assert_eq!(decoded.sequence().inner(), 100);
        assert_eq!(
            collect(&decoded),
            vec![
                (b"a".to_vec(), Some(b"1".to_vec())),
                (b"b".to_vec(), None),
                (b"c".to_vec(), Some(b"3".to_vec())),
            ],
        );
    }

    #[test]
    fn append_merges_counts_and_entries() {
        let mut head = WriteBatch::new();
        head.put(b"a", b"1");

        let mut tail = WriteBatch::new();
        tail.delete(b"b");
        tail.put(b"c", b"3");

        head.append(&tail);
        assert_eq!(head.count(), 3);
        assert_eq!(collect(&head).len(), 3);
    }

    #[test]
    fn clear_resets_the_header() {
        let mut batch = WriteBatch::new();
        batch.put(b"a", b"1");
        batch.set_sequence(SequenceNumber::new_unchecked(55));
        batch.clear();

        assert!(batch.is_empty());
        assert_eq!(batch.sequence().inner(), 0);
        assert_eq!(batch.approximate_size(), 12);
    }

    #[test]
    fn malformed_contents_are_rejected() {
        // Truncated header.
        assert!(WriteBatch::from_contents(vec![0; 5]).is_err());

        // Count claims an entry that is not there.
        let mut contents = vec![0; 12];
        contents[8] = 1;
        assert!(WriteBatch::from_contents(contents).is_err());

        // Entry overruns the record.
        let mut batch = WriteBatch::new();
        batch.put(b"key", b"value");
        let mut contents = batch.contents().to_vec();
        contents.truncate(contents.len() - 3);
        assert!(WriteBatch::from_contents(contents).is_err());

        // Unknown tag byte.
        let mut contents = vec![0; 12];
        contents[8] = 1;
        contents.push(9);
        assert!(WriteBatch::from_contents(contents).is_err());
    }
}
