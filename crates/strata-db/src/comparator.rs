//! The internal-key order: user keys ascending under the user comparator, then the
//! sequence/type tag descending, so one forward scan visits the newest entry for each user key
//! first.

use std::cmp::Ordering;
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::sync::Arc;

use integer_encoding::VarInt as _;

use strata_skiplist::Comparator as SkiplistComparator;
use strata_sstable::TableComparator;

use crate::format::{EntryType, SequenceNumber, extract_user_key, sequence_and_type_tag};


/// The user-supplied ordering, shared everywhere a comparator is needed.
pub(crate) type UserComparator = Arc<dyn TableComparator + Send + Sync>;

/// Orders encoded internal keys. Wraps the user comparator for the user-key part and breaks
/// ties with the tag, descending, so newer entries sort first.
#[derive(Clone)]
pub(crate) struct InternalKeyComparator {
    user: UserComparator,
}

impl InternalKeyComparator {
    #[must_use]
    pub(crate) fn new(user: UserComparator) -> Self {
        Self { user }
    }

    #[must_use]
    pub(crate) fn user_comparator(&self) -> &UserComparator {
        &self.user
    }

    #[inline]
    #[must_use]
    pub(crate) fn cmp_user(&self, lhs: &[u8], rhs: &[u8]) -> Ordering {
        self.user.cmp(lhs, rhs)
    }
}

impl TableComparator for InternalKeyComparator {
    fn name(&self) -> &'static str {
        // The persistent name LevelDB records in its manifests.
        "leveldb.InternalKeyComparator"
    }

    fn cmp(&self, lhs: &[u8], rhs: &[u8]) -> Ordering {
        debug_assert!(lhs.len() >= 8 && rhs.len() >= 8, "internal keys carry an 8-byte tag");
        if lhs.len() < 8 || rhs.len() < 8 {
            // Corrupt input; fall back to a deterministic order.
            return lhs.cmp(rhs);
        }

        let (lhs_user, lhs_tag) = lhs.split_at(lhs.len() - 8);
        let (rhs_user, rhs_tag) = rhs.split_at(rhs.len() - 8);

        self.user.cmp(lhs_user, rhs_user).then_with(|| {
            let lhs_tag = u64::from_le_bytes(lhs_tag.try_into().expect("tag is 8 bytes"));
            let rhs_tag = u64::from_le_bytes(rhs_tag.try_into().expect("tag is 8 bytes"));
            // Higher tags (newer sequence numbers) sort first.
            rhs_tag.cmp(&lhs_tag)
        })
    }

    fn find_short_separator(&self, from: &[u8], to: &[u8], output: &mut Vec<u8>) {
        let user_from = extract_user_key(from);
        let user_to = extract_user_key(to);

        let mut shortened = Vec::new();
        self.user.find_short_separator(user_from, user_to, &mut shortened);

        output.clear();
        if shortened.len() < user_from.len() && self.user.cmp(user_from, &shortened).is_lt() {
            // The user comparator shortened the key; restore internal-key shape with the
            // largest possible tag, which sorts before every real entry for that user key.
            output.extend(&shortened);
            output.extend(
                sequence_and_type_tag(SequenceNumber::MAX, EntryType::SEEK).to_le_bytes(),
            );
            debug_assert!(self.cmp(from, output).is_lt());
            debug_assert!(self.cmp(output, to).is_lt());
        } else {
            output.extend(from);
        }
    }

    fn find_short_successor(&self, key: &[u8], output: &mut Vec<u8>) {
        let user_key = extract_user_key(key);

        let mut shortened = Vec::new();
        self.user.find_short_successor(user_key, &mut shortened);

        output.clear();
        if shortened.len() < user_key.len() && self.user.cmp(user_key, &shortened).is_lt() {
            output.extend(&shortened);
            output.extend(
                sequence_and_type_tag(SequenceNumber::MAX, EntryType::SEEK).to_le_bytes(),
            );
            debug_assert!(self.cmp(key, output).is_lt());
        } else {
            output.extend(key);
        }
    }
}

impl Debug for InternalKeyComparator {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("InternalKeyComparator")
            .field("user", &self.user.name())
            .finish()
    }
}

/// Orders encoded memtable entries (`varint(len) ++ internal key ++ varint(len) ++ value`) by
/// their internal keys.
#[derive(Debug, Clone)]
pub(crate) struct MemtableKeyComparator {
    pub(crate) internal: InternalKeyComparator,
}

impl SkiplistComparator for MemtableKeyComparator {
    fn cmp(&self, lhs: &[u8], rhs: &[u8]) -> Ordering {
        let lhs_key = prefixed_internal_key(lhs);
        let rhs_key = prefixed_internal_key(rhs);
        self.internal.cmp(lhs_key, rhs_key)
    }
}

/// The internal key of a length-prefixed memtable entry.
///
/// # Panics
/// May panic on entries that were not produced by the memtable encoder.
#[must_use]
pub(crate) fn prefixed_internal_key(memtable_entry: &[u8]) -> &[u8] {
    let (key_len, prefix_len) =
        u32::decode_var(memtable_entry).expect("memtable entries start with a varint length");
    &memtable_entry[prefix_len..prefix_len + key_len as usize]
}


#[cfg(test)]
mod tests {
    use strata_sstable::BytewiseComparator;

    use crate::format::InternalKey;
    use super::*;


    fn icmp() -> InternalKeyComparator {
        InternalKeyComparator::new(Arc::new(BytewiseComparator))
    }

    fn key(user_key: &[u8], sequence: u64, entry_type: EntryType) -> InternalKey {
        InternalKey::new(user_key, SequenceNumber::new_unchecked(sequence), entry_type)
    }

    #[test]
    fn user_keys_order_ascending() {
        let cmp = icmp();
        let first = key(b"aaa", 5, EntryType::Value);
        let second = key(b"bbb", 5, EntryType::Value);
        assert!(cmp.cmp(first.encoded(), second.encoded()).is_lt());
    }

    #[test]
    fn newer_entries_sort_before_older_ones() {
        let cmp = icmp();
        let newer = key(b"same", 9, EntryType::Value);
        let older = key(b"same", 3, EntryType::Value);
        assert!(cmp.cmp(newer.encoded(), older.encoded()).is_lt());
    }

    #[test]
    fn type_breaks_sequence_ties() {
        let cmp = icmp();
        let value = key(b"same", 7, EntryType::Value);
        let deletion = key(b"same", 7, EntryType::Deletion);
        assert!(cmp.cmp(value.encoded(), deletion.encoded()).is_lt());
    }

    #[test]
    fn separator_stays_between_bounds() {
        let cmp = icmp();
        let from = key(b"abcdefgh", 100, EntryType::Value);
        let to = key(b"abzz", 50, EntryType::Value);

        let mut separator = Vec::new();
        cmp.find_short_separator(from.encoded(), to.encoded(), &mut separator);

        assert!(separator.len() < from.encoded().len());
        assert!(cmp.cmp(from.encoded(), &separator).is_lt());
        assert!(cmp.cmp(&separator, to.encoded()).is_lt());
    }

    #[test]
    fn successor_of_maximal_key_is_identity() {
        let cmp = icmp();
        let from = key(b"\xff\xff", 1, EntryType::Value);
        let mut successor = Vec::new();
        cmp.find_short_successor(from.encoded(), &mut successor);
        assert_eq!(successor, from.encoded());
    }
}
