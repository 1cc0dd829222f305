use std::cmp::Ordering;
use std::sync::Arc;


/// Determines the order of keys in a table, and provides the advisory key-shortening helpers
/// used when building index blocks.
///
/// The shortening helpers are advisory: correctness must never depend on them producing a
/// shorter key, only on their output comparing within the documented bounds.
pub trait TableComparator {
    /// The comparator's persistent name. Two databases can only be opened with comparators
    /// sharing a name, so the name must change whenever the order changes.
    #[must_use]
    fn name(&self) -> &'static str;

    #[must_use]
    fn cmp(&self, lhs: &[u8], rhs: &[u8]) -> Ordering;

    /// Write into `output` some key which is greater than or equal to `from` and strictly less
    /// than `to`. `from` must be strictly less than `to`.
    fn find_short_separator(&self, from: &[u8], to: &[u8], output: &mut Vec<u8>);

    /// Write into `output` some key which is greater than or equal to `key`.
    fn find_short_successor(&self, key: &[u8], output: &mut Vec<u8>);
}

impl<Cmp: TableComparator + ?Sized> TableComparator for Arc<Cmp> {
    #[inline]
    fn name(&self) -> &'static str {
        (**self).name()
    }

    #[inline]
    fn cmp(&self, lhs: &[u8], rhs: &[u8]) -> Ordering {
        (**self).cmp(lhs, rhs)
    }

    #[inline]
    fn find_short_separator(&self, from: &[u8], to: &[u8], output: &mut Vec<u8>) {
        (**self).find_short_separator(from, to, output);
    }

    #[inline]
    fn find_short_successor(&self, key: &[u8], output: &mut Vec<u8>) {
        (**self).find_short_successor(key, output);
    }
}

/// Orders keys lexicographically over unsigned bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct BytewiseComparator;

impl TableComparator for BytewiseComparator {
    fn name(&self) -> &'static str {
        // The persistent name LevelDB uses for its default comparator; tables written under
        // this order are interchangeable with LevelDB's.
        "leveldb.BytewiseComparator"
    }

    #[inline]
    fn cmp(&self, lhs: &[u8], rhs: &[u8]) -> Ordering {
        lhs.cmp(rhs)
    }

    fn find_short_separator(&self, from: &[u8], to: &[u8], output: &mut Vec<u8>) {
        output.clear();

        // Length of the common prefix.
        let shared = from
            .iter()
            .zip(to)
            .take_while(|(from_byte, to_byte)| from_byte == to_byte)
            .count();

        if shared >= from.len() || shared >= to.len() {
            // One key is a prefix of the other; no shortening is possible.
            output.extend(from);
            return;
        }

        let diff_byte = from[shared];
        if diff_byte < 0xff && diff_byte + 1 < to[shared] {
            output.extend(&from[..=shared]);
            output[shared] = diff_byte + 1;
            debug_assert!(self.cmp(output, to) == Ordering::Less);
        } else {
            output.extend(from);
        }
    }

    fn find_short_successor(&self, key: &[u8], output: &mut Vec<u8>) {
        output.clear();

        // Find the first byte that can be incremented, and truncate after it.
        for (index, &byte) in key.iter().enumerate() {
            if byte != 0xff {
                output.extend(&key[..=index]);
                output[index] = byte + 1;
                return;
            }
        }

        // Every byte is 0xff; `key` is its own successor.
        output.extend(key);
    }
}


#[cfg(test)]
mod tests {
    use super::*;


    #[test]
    fn separator_increments_first_differing_byte() {
        let cmp = BytewiseComparator;
        let mut output = Vec::new();

        cmp.find_short_separator(b"abcdefghij", b"abzzz", &mut output);
        assert_eq!(output, b"abd");

        // 'a' + 1 == 'b' is not strictly less than "banana"'s first byte, so no change.
        cmp.find_short_separator(b"apple", b"banana", &mut output);
        assert_eq!(output, b"apple");
    }

    #[test]
    fn separator_leaves_prefixes_alone() {
        let cmp = BytewiseComparator;
        let mut output = Vec::new();

        cmp.find_short_separator(b"abc", b"abcde", &mut output);
        assert_eq!(output, b"abc");

        // Incrementing would reach or pass `to`.
        cmp.find_short_separator(b"abc", b"abd", &mut output);
        assert_eq!(output, b"abc");

        cmp.find_short_separator(b"ab\xff1", b"ac", &mut output);
        assert_eq!(output, b"ab\xff1");
    }

    #[test]
    fn successor_truncates_at_first_incrementable_byte() {
        let cmp = BytewiseComparator;
        let mut output = Vec::new();

        cmp.find_short_successor(b"abc", &mut output);
        assert_eq!(output, b"b");

        cmp.find_short_successor(b"\xff\xffq", &mut output);
        assert_eq!(output, b"\xff\xffr");

        cmp.find_short_successor(b"\xff\xff", &mut output);
        assert_eq!(output, b"\xff\xff");
    }
}
