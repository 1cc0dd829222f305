//! Blocks: sequences of prefix-compressed entries, followed by a restart-point array.

mod builder;


use std::sync::Arc;

use integer_encoding::VarInt as _;

use crate::comparator::TableComparator;
use crate::error::{TableError, TableResult};

pub use self::builder::BlockBuilder;


/// A parsed, immutable block. Cheap to clone; the contents are shared.
#[derive(Debug, Clone)]
pub struct Block {
    contents:        Arc<Vec<u8>>,
    /// Offset of the restart array within `contents`.
    restarts_offset: usize,
    num_restarts:    usize,
}

impl Block {
    /// Validate the restart array trailer and wrap the contents.
    pub fn new(contents: Arc<Vec<u8>>) -> TableResult<Self> {
        let len = contents.len();
        if len < 4 {
            return Err(TableError::corruption("block too short for restart count"));
        }

        let num_restarts_bytes: [u8; 4] = contents[len - 4..].try_into().expect("4 bytes");
        let num_restarts = u32::from_le_bytes(num_restarts_bytes) as usize;

        let restarts_len = num_restarts
            .checked_mul(4)
            .and_then(|array_len| array_len.checked_add(4))
            .ok_or_else(|| TableError::corruption("restart count overflows block"))?;
        if restarts_len > len {
            return Err(TableError::corruption("restart array overflows block"));
        }

        Ok(Self {
            restarts_offset: len - restarts_len,
            num_restarts,
            contents,
        })
    }

    #[must_use]
    pub fn iter<Cmp: TableComparator>(&self, cmp: Cmp) -> BlockIter<Cmp> {
        BlockIter {
            cmp,
            contents:        Arc::clone(&self.contents),
            restarts_offset: self.restarts_offset,
            num_restarts:    self.num_restarts,
            current_offset:  0,
            next_offset:     0,
            restart_index:   0,
            key:             Vec::new(),
            value_start:     0,
            value_len:       0,
            valid:           false,
            corrupt:         false,
        }
    }
}

/// A cursor over the entries of a [`Block`].
///
/// A freshly created iterator is not positioned at any entry. On corruption (malformed varints,
/// out-of-bounds lengths) the iterator invalidates itself and remembers a [`TableError`] which
/// [`BlockIter::status`] reports.
#[derive(Debug, Clone)]
pub struct BlockIter<Cmp> {
    cmp:             Cmp,
    contents:        Arc<Vec<u8>>,
    restarts_offset: usize,
    num_restarts:    usize,
    /// Offset of the current entry, meaningful only while `valid`.
    current_offset:  usize,
    /// Offset at which the next entry would be parsed.
    next_offset:     usize,
    /// The restart group `current_offset` belongs to.
    restart_index:   usize,
    /// The current entry's key, reassembled from the shared prefix.
    key:             Vec<u8>,
    value_start:     usize,
    value_len:       usize,
    valid:           bool,
    corrupt:         bool,
}

impl<Cmp: TableComparator> BlockIter<Cmp> {
    #[inline]
    #[must_use]
    pub fn valid(&self) -> bool {
        self.valid
    }

    /// `Err` if the iterator tripped over a malformed entry at some point.
    pub fn status(&self) -> TableResult<()> {
        if self.corrupt {
            Err(TableError::corruption("malformed block entry"))
        } else {
            Ok(())
        }
    }

    /// # Panics
    /// May panic if the iterator is not [`valid`](Self::valid).
    #[inline]
    #[must_use]
    pub fn key(&self) -> &[u8] {
        debug_assert!(self.valid);
        &self.key
    }

    /// # Panics
    /// May panic if the iterator is not [`valid`](Self::valid).
    #[inline]
    #[must_use]
    pub fn value(&self) -> &[u8] {
        debug_assert!(self.valid);
        &self.contents[self.value_start..self.value_start + self.value_len]
    }

    /// Advance to the next entry. From an unpositioned iterator, this moves to the first entry.
    pub fn next(&mut self) -> bool {
        if self.corrupt {
            return false;
        }
        if !self.valid && self.next_offset != 0 {
            // Stepped past the end earlier; stay invalid.
            return false;
        }
        self.parse_next_entry()
    }

    /// Step back to the entry before the current one, re-scanning from the nearest restart.
    pub fn prev(&mut self) -> bool {
        if !self.valid || self.corrupt {
            self.valid = false;
            return false;
        }

        let original = self.current_offset;
        while self.restart_offset(self.restart_index) >= original {
            if self.restart_index == 0 {
                // The current entry was the first in the block.
                self.valid = false;
                self.next_offset = self.restarts_offset;
                return false;
            }
            self.restart_index -= 1;
        }

        self.seek_to_restart(self.restart_index);
        loop {
            if !self.parse_next_entry() {
                return false;
            }
            if self.next_offset >= original {
                return true;
            }
        }
    }

    /// Position at the first entry whose key is greater than or equal to `target`.
    pub fn seek(&mut self, target: &[u8]) {
        if self.num_restarts == 0 || self.corrupt {
            self.valid = false;
            return;
        }

        // Find the last restart whose (whole) key is strictly less than the target.
        let mut left = 0;
        let mut right = self.num_restarts - 1;
        while left < right {
            let mid = (left + right + 1) / 2;
            let Some(restart_key) = self.restart_key(mid) else {
                self.mark_corrupt();
                return;
            };
            if self.cmp.cmp(restart_key, target).is_lt() {
                left = mid;
            } else {
                right = mid - 1;
            }
        }

        self.seek_to_restart(left);
        while self.parse_next_entry() {
            if self.cmp.cmp(&self.key, target).is_ge() {
                return;
            }
        }
    }

    pub fn seek_to_first(&mut self) {
        if self.num_restarts == 0 || self.corrupt {
            self.valid = false;
            return;
        }
        self.seek_to_restart(0);
        let _positioned = self.parse_next_entry();
    }

    pub fn seek_to_last(&mut self) {
        if self.num_restarts == 0 || self.corrupt {
            self.valid = false;
            return;
        }
        self.seek_to_restart(self.num_restarts - 1);
        while self.next_offset < self.restarts_offset {
            if !self.parse_next_entry() {
                return;
            }
        }
    }

    /// Un-position the iterator, as if it were newly created.
    pub fn reset(&mut self) {
        self.valid = false;
        self.next_offset = 0;
        self.restart_index = 0;
        self.key.clear();
    }

    fn restart_offset(&self, index: usize) -> usize {
        debug_assert!(index < self.num_restarts);
        let at = self.restarts_offset + 4 * index;
        let bytes: [u8; 4] = self.contents[at..at + 4].try_into().expect("4 bytes");
        u32::from_le_bytes(bytes) as usize
    }

    /// The whole key stored at a restart point, or `None` if the entry there is malformed.
    fn restart_key(&self, index: usize) -> Option<&[u8]> {
        let offset = self.restart_offset(index);
        let entry = self.contents.get(offset..self.restarts_offset)?;

        let (shared, shared_len) = u32::decode_var(entry)?;
        let (non_shared, non_shared_len) = u32::decode_var(&entry[shared_len..])?;
        let (_value_len, value_len_len) =
            u32::decode_var(&entry[shared_len + non_shared_len..])?;

        if shared != 0 {
            // A restart entry must store its whole key.
            return None;
        }

        let key_start = shared_len + non_shared_len + value_len_len;
        entry.get(key_start..key_start + non_shared as usize)
    }

    fn seek_to_restart(&mut self, index: usize) {
        self.key.clear();
        self.valid = false;
        self.restart_index = index;
        self.next_offset = self.restart_offset(index);
    }

    /// Parse the entry at `next_offset` into the iterator state. Returns whether the iterator
    /// is valid afterward.
    fn parse_next_entry(&mut self) -> bool {
        if self.next_offset >= self.restarts_offset {
            self.valid = false;
            return false;
        }

        let entry_offset = self.next_offset;
        let entry = &self.contents[entry_offset..self.restarts_offset];

        let parsed = (|| {
            let (shared, shared_len) = u32::decode_var(entry)?;
            let (non_shared, non_shared_len) = u32::decode_var(&entry[shared_len..])?;
            let (value_len, value_len_len) =
                u32::decode_var(&entry[shared_len + non_shared_len..])?;

            let header_len = shared_len + non_shared_len + value_len_len;
            let shared = shared as usize;
            let non_shared = non_shared as usize;
            let value_len = value_len as usize;

            if shared > self.key.len() || header_len + non_shared + value_len > entry.len() {
                return None;
            }

            Some((shared, non_shared, value_len, header_len))
        })();

        let Some((shared, non_shared, value_len, header_len)) = parsed else {
            self.mark_corrupt();
            return false;
        };

        let key_start = entry_offset + header_len;
        self.key.truncate(shared);
        self.key
            .extend_from_slice(&self.contents[key_start..key_start + non_shared]);

        self.value_start = key_start + non_shared;
        self.value_len = value_len;
        self.current_offset = entry_offset;
        self.next_offset = self.value_start + value_len;
        self.valid = true;

        // Keep the restart index in step with the cursor, for `prev`.
        while self.restart_index + 1 < self.num_restarts
            && self.restart_offset(self.restart_index + 1) <= self.current_offset
        {
            self.restart_index += 1;
        }

        true
    }

    fn mark_corrupt(&mut self) {
        self.corrupt = true;
        self.valid = false;
    }
}


#[cfg(test)]
mod tests {
    use crate::comparator::BytewiseComparator;
    use super::*;


    fn sample_entries() -> Vec<(Vec<u8>, Vec<u8>)> {
        vec![
            (b"key1".to_vec(), b"value1".to_vec()),
            (b"key2".to_vec(), b"value2".to_vec()),
            (b"key3".to_vec(), b"value3".to_vec()),
            (b"prefix_key1".to_vec(), b"v1".to_vec()),
            (b"prefix_key2".to_vec(), b"v2".to_vec()),
            (b"prefix_key3".to_vec(), b"v3".to_vec()),
        ]
    }

    fn build_block(entries: &[(Vec<u8>, Vec<u8>)], restart_interval: usize) -> Block {
        let mut builder = BlockBuilder::new(restart_interval);
        for (key, value) in entries {
            builder.add_entry(key, value);
        }
        let contents = builder.finish_block_contents().to_vec();
        Block::new(Arc::new(contents)).unwrap()
    }

    #[test]
    fn empty_block_iterates_nothing() {
        let block = build_block(&[], 16);
        let mut iter = block.iter(BytewiseComparator);
        assert!(!iter.next());
        iter.seek(b"whatever");
        assert!(!iter.valid());
        iter.seek_to_last();
        assert!(!iter.valid());
    }

    #[test]
    fn forward_scan_returns_all_entries() {
        for restart_interval in [1, 2, 16] {
            let entries = sample_entries();
            let block = build_block(&entries, restart_interval);
            let mut iter = block.iter(BytewiseComparator);

            let mut scanned = Vec::new();
            while iter.next() {
                scanned.push((iter.key().to_vec(), iter.value().to_vec()));
            }
            assert_eq!(scanned, entries);
            assert!(iter.status().is_ok());
        }
    }

    #[test]
    fn seek_finds_lower_bound() {
        let entries = sample_entries();
        let block = build_block(&entries, 3);
        let mut iter = block.iter(BytewiseComparator);

        iter.seek(b"key2");
        assert!(iter.valid());
        assert_eq!(iter.key(), b"key2");

        iter.seek(b"key2a");
        assert_eq!(iter.key(), b"key3");

        iter.seek(b"");
        assert_eq!(iter.key(), b"key1");

        iter.seek(b"prefix_key3z");
        assert!(!iter.valid());
    }

    #[test]
    fn backward_scan_returns_all_entries() {
        for restart_interval in [1, 2, 16] {
            let entries = sample_entries();
            let block = build_block(&entries, restart_interval);
            let mut iter = block.iter(BytewiseComparator);

            iter.seek_to_last();
            let mut scanned = Vec::new();
            loop {
                assert!(iter.valid());
                scanned.push((iter.key().to_vec(), iter.value().to_vec()));
                if !iter.prev() {
                    break;
                }
            }
            scanned.reverse();
            assert_eq!(scanned, entries);
        }
    }

    #[test]
    fn seek_then_prev_crosses_restart_groups() {
        let entries = sample_entries();
        let block = build_block(&entries, 2);
        let mut iter = block.iter(BytewiseComparator);

        iter.seek(b"prefix_key2");
        assert_eq!(iter.key(), b"prefix_key2");
        assert!(iter.prev());
        assert_eq!(iter.key(), b"prefix_key1");
        assert!(iter.prev());
        assert_eq!(iter.key(), b"key3");
    }

    #[test]
    fn truncated_contents_are_corruption() {
        let entries = sample_entries();
        let mut builder = BlockBuilder::new(16);
        for (key, value) in &entries {
            builder.add_entry(key, value);
        }
        let contents = builder.finish_block_contents().to_vec();

        // Claim more restarts than the block can hold.
        let mut mangled = contents;
        let len = mangled.len();
        mangled[len - 4..].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(Block::new(Arc::new(mangled)).is_err());
    }
}
