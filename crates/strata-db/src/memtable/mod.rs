//! The in-memory sorted table holding the most recent writes: a skiplist of encoded entries
//! `varint(internal key len) ++ internal key ++ varint(value len) ++ value`.

use integer_encoding::{VarInt as _, VarIntWriter as _};

use strata_skiplist::{Skiplist, SkiplistIter};

use crate::comparator::{InternalKeyComparator, MemtableKeyComparator, prefixed_internal_key};
use crate::format::{
    EntryType, LookupKey, SequenceNumber, append_internal_key, parse_internal_key,
};


/// Seed for the skiplist height PRNG. The height distribution only affects performance, so a
/// fixed seed keeps behavior reproducible.
const HEIGHT_SEED: u64 = 0x_dead_beef;


/// A sorted table of the most recent writes. Cheap to clone; clones share the same table.
///
/// Reads are lock-free. Writes are serialized by the database's write path; the memtable itself
/// never mutates an entry once inserted, and a memtable that has been made immutable is simply
/// one that no writer inserts into anymore.
#[derive(Debug, Clone)]
pub(crate) struct Memtable {
    list: Skiplist<MemtableKeyComparator>,
    icmp: InternalKeyComparator,
}

impl Memtable {
    #[must_use]
    pub(crate) fn new(icmp: InternalKeyComparator) -> Self {
        Self {
            list: Skiplist::new(
                MemtableKeyComparator { internal: icmp.clone() },
                HEIGHT_SEED,
            ),
            icmp,
        }
    }

    /// Insert one entry. The `(sequence, entry_type)` pair must be unique across the lifetime
    /// of this memtable.
    pub(crate) fn add(
        &self,
        sequence:   SequenceNumber,
        entry_type: EntryType,
        user_key:   &[u8],
        value:      &[u8],
    ) {
        let internal_key_len = user_key.len() + 8;
        let entry_len = u32::required_space(internal_key_len as u32)
            + internal_key_len
            + u32::required_space(value.len() as u32)
            + value.len();

        let inserted = self.list.insert_with(entry_len, |mut buffer| {
            buffer
                .write_varint(internal_key_len as u32)
                .expect("buffer was sized for the entry");
            let mut internal_key = Vec::with_capacity(internal_key_len);
            append_internal_key(&mut internal_key, user_key, sequence, entry_type);
            buffer[..internal_key_len].copy_from_slice(&internal_key);
            let mut rest = &mut buffer[internal_key_len..];
            rest.write_varint(value.len() as u32).expect("buffer was sized for the entry");
            rest.copy_from_slice(value);
        });
        debug_assert!(inserted, "memtable entries are unique by sequence number");
    }

    /// Point lookup at the lookup key's snapshot.
    ///
    /// Returns `None` when the memtable holds nothing for the user key, `Some(None)` when the
    /// newest visible entry is a tombstone (the caller must not consult older tiers), and
    /// `Some(Some(value))` for a live value.
    #[must_use]
    pub(crate) fn get(&self, lookup_key: &LookupKey) -> Option<Option<Vec<u8>>> {
        let mut iter = self.list.iter();
        let mut seek_target = Vec::with_capacity(lookup_key.internal_key().len() + 5);
        seek_target
            .write_varint(lookup_key.internal_key().len() as u32)
            .expect("writing to a Vec does not fail");
        seek_target.extend(lookup_key.internal_key());
        iter.seek(&seek_target);

        let entry = iter.current()?;
        let (internal_key, value) = decode_memtable_entry(entry);
        let parsed = parse_internal_key(internal_key)
            .expect("memtable entries hold valid internal keys");

        // The seek landed on the first entry at or after the lookup key. Under the internal
        // ordering, that is the newest entry for this user key with a sequence at or below the
        // snapshot, or an entry for some later user key entirely.
        if self.icmp.cmp_user(parsed.user_key, lookup_key.user_key()).is_ne() {
            return None;
        }

        match parsed.entry_type {
            EntryType::Value    => Some(Some(value.to_vec())),
            EntryType::Deletion => Some(None),
        }
    }

    /// A close lower bound for the bytes this memtable has allocated; drives the flush
    /// threshold.
    #[must_use]
    pub(crate) fn approximate_memory_usage(&self) -> usize {
        self.list.allocated_bytes()
    }

    #[must_use]
    pub(crate) fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    #[must_use]
    pub(crate) fn iter(&self) -> MemtableIter {
        MemtableIter {
            iter:    self.list.iter(),
            scratch: Vec::new(),
        }
    }
}

/// Splits an encoded memtable entry into its internal key and value.
fn decode_memtable_entry(entry: &[u8]) -> (&[u8], &[u8]) {
    let (key_len, key_prefix_len) =
        u32::decode_var(entry).expect("memtable entries start with a varint length");
    let key_end = key_prefix_len + key_len as usize;
    let internal_key = &entry[key_prefix_len..key_end];

    let after_key = &entry[key_end..];
    let (value_len, value_prefix_len) =
        u32::decode_var(after_key).expect("memtable entries hold a prefixed value");
    let value = &after_key[value_prefix_len..value_prefix_len + value_len as usize];

    (internal_key, value)
}

/// A cursor over a memtable's internal entries, sharing ownership of the underlying skiplist.
#[derive(Debug, Clone)]
pub(crate) struct MemtableIter {
    iter:    SkiplistIter<MemtableKeyComparator>,
    scratch: Vec<u8>,
}

impl MemtableIter {
    #[must_use]
    pub(crate) fn valid(&self) -> bool {
        self.iter.valid()
    }

    /// The current entry's encoded internal key.
    #[must_use]
    pub(crate) fn key(&self) -> &[u8] {
        prefixed_internal_key(self.iter.current().expect("iterator is valid"))
    }

    #[must_use]
    pub(crate) fn value(&self) -> &[u8] {
        decode_memtable_entry(self.iter.current().expect("iterator is valid")).1
    }

    pub(crate) fn next(&mut self) -> bool {
        self.iter.next().is_some()
    }

    pub(crate) fn prev(&mut self) -> bool {
        self.iter.prev().is_some()
    }

    /// Position at the first entry whose internal key is at or after `target`.
    pub(crate) fn seek(&mut self, target: &[u8]) {
        self.scratch.clear();
        self.scratch
            .write_varint(target.len() as u32)
            .expect("writing to a Vec does not fail");
        self.scratch.extend(target);
        self.iter.seek(&self.scratch);
    }

    pub(crate) fn seek_to_first(&mut self) {
        self.iter.seek_to_first();
    }

    pub(crate) fn seek_to_last(&mut self) {
        self.iter.seek_to_last();
    }
}


#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use strata_sstable::BytewiseComparator;

    use super::*;


    fn memtable() -> Memtable {
        Memtable::new(InternalKeyComparator::new(Arc::new(BytewiseComparator)))
    }

    fn seq(sequence: u64) -> SequenceNumber {
        SequenceNumber::new_unchecked(sequence)
    }

    #[test]
    fn latest_visible_entry_wins() {
        let memtable = memtable();
        memtable.add(seq(1), EntryType::Value, b"key", b"first");
        memtable.add(seq(2), EntryType::Value, b"key", b"second");

        assert_eq!(
            memtable.get(&LookupKey::new(b"key", seq(2))),
            Some(Some(b"second".to_vec())),
        );
        // A snapshot between the writes sees the older value.
        assert_eq!(
            memtable.get(&LookupKey::new(b"key", seq(1))),
            Some(Some(b"first".to_vec())),
        );
        assert_eq!(memtable.get(&LookupKey::new(b"other", seq(2))), None);
    }

    #[test]
    fn tombstones_stop_the_search() {
        let memtable = memtable();
        memtable.add(seq(1), EntryType::Value, b"key", b"value");
        memtable.add(seq(2), EntryType::Deletion, b"key", b"");

        // The tombstone must be reported, not skipped, so older tiers are never consulted.
        assert_eq!(memtable.get(&LookupKey::new(b"key", seq(2))), Some(None));
        assert_eq!(
            memtable.get(&LookupKey::new(b"key", seq(1))),
            Some(Some(b"value".to_vec())),
        );
    }

    #[test]
    fn snapshot_before_first_write_sees_nothing() {
        let memtable = memtable();
        memtable.add(seq(5), EntryType::Value, b"key", b"value");
        assert_eq!(memtable.get(&LookupKey::new(b"key", seq(4))), None);
    }

    #[test]
    fn iterates_in_internal_key_order() {
        let memtable = memtable();
        memtable.add(seq(4), EntryType::Value, b"b", b"b4");
        memtable.add(seq(3), EntryType::Value, b"a", b"a3");
        memtable.add(seq(5), EntryType::Deletion, b"a", b"");

        let mut iter = memtable.iter();
        iter.seek_to_first();

        // `a` at sequence 5 (the deletion) sorts before `a` at sequence 3, before `b`.
        let mut scanned = Vec::new();
        while iter.valid() {
            let parsed = parse_internal_key(iter.key()).unwrap();
            scanned.push((
                parsed.user_key.to_vec(),
                parsed.sequence.inner(),
                parsed.entry_type,
            ));
            iter.next();
        }
        assert_eq!(
            scanned,
            vec![
                (b"a".to_vec(), 5, EntryType::Deletion),
                (b"a".to_vec(), 3, EntryType::Value),
                (b"b".to_vec(), 4, EntryType::Value),
            ],
        );
    }

    #[test]
    fn memory_usage_grows_with_inserts() {
        let memtable = memtable();
        let before = memtable.approximate_memory_usage();
        for index in 0..100_u64 {
            memtable.add(seq(index + 1), EntryType::Value, &index.to_be_bytes(), b"value");
        }
        assert!(memtable.approximate_memory_usage() > before);
    }
}
