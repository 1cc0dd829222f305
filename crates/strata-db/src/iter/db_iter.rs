use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::sync::Arc;

use crate::comparator::InternalKeyComparator;
use crate::error::{Error, Result};
use crate::format::{
    EntryType, SequenceNumber, append_internal_key, extract_user_key, parse_internal_key,
};
use crate::memtable::Memtable;
use crate::version::Version;
use super::merge_iter::{Direction, MergingIter};


/// Resources an iterator must keep alive for as long as it exists: the memtables it reads and
/// the version whose files it walks. Holding the version keeps those files out of the
/// obsolete-file sweep even after compactions replace them.
pub(crate) struct IterPin {
    /// Held only to keep the sources alive.
    pub(crate) _mem:     Memtable,
    pub(crate) _imm:     Option<Memtable>,
    pub(crate) _version: Arc<Version>,
}

/// A cursor over the user-visible contents of the database at one sequence number.
///
/// Internally this walks internal entries in merged order and collapses them: entries newer
/// than the iterator's sequence are invisible, only the newest visible entry per user key
/// counts, and user keys whose newest visible entry is a tombstone are skipped.
pub struct DbIterator {
    icmp:      InternalKeyComparator,
    inner:     MergingIter,
    sequence:  SequenceNumber,
    direction: Direction,
    valid:     bool,
    /// Forward: the user key to skip shadowed entries of. Reverse: the current entry's user
    /// key.
    saved_key:   Vec<u8>,
    /// Reverse only: the current entry's value.
    saved_value: Vec<u8>,
    status:      Option<Error>,
    _pin:        IterPin,
}

impl DbIterator {
    #[must_use]
    pub(crate) fn new(
        icmp:     InternalKeyComparator,
        inner:    MergingIter,
        sequence: SequenceNumber,
        pin:      IterPin,
    ) -> Self {
        Self {
            icmp,
            inner,
            sequence,
            direction:   Direction::Forward,
            valid:       false,
            saved_key:   Vec::new(),
            saved_value: Vec::new(),
            status:      None,
            _pin:        pin,
        }
    }

    /// Whether the cursor is positioned at an entry.
    #[must_use]
    pub fn valid(&self) -> bool {
        self.valid
    }

    /// The current user key.
    ///
    /// # Panics
    /// May panic if the iterator is not [`valid`](Self::valid).
    #[must_use]
    pub fn key(&self) -> &[u8] {
        debug_assert!(self.valid);
        match self.direction {
            Direction::Forward => extract_user_key(self.inner.key()),
            Direction::Reverse => &self.saved_key,
        }
    }

    /// The current value.
    ///
    /// # Panics
    /// May panic if the iterator is not [`valid`](Self::valid).
    #[must_use]
    pub fn value(&self) -> &[u8] {
        debug_assert!(self.valid);
        match self.direction {
            Direction::Forward => self.inner.value(),
            Direction::Reverse => &self.saved_value,
        }
    }

    /// The first error the iterator ran into, if any. An iterator that went invalid because of
    /// an error stays invalid.
    pub fn status(&self) -> Result<()> {
        if let Some(error) = &self.status {
            return Err(error.clone());
        }
        self.inner.status()
    }

    pub fn seek_to_first(&mut self) {
        self.direction = Direction::Forward;
        self.saved_value.clear();
        self.inner.seek_to_first();
        if self.inner.valid() {
            self.find_next_user_entry(false);
        } else {
            self.valid = false;
        }
    }

    pub fn seek_to_last(&mut self) {
        self.direction = Direction::Reverse;
        self.saved_value.clear();
        self.inner.seek_to_last();
        self.find_prev_user_entry();
    }

    /// Position at the first user key at or after `target`.
    pub fn seek(&mut self, target: &[u8]) {
        self.direction = Direction::Forward;
        self.saved_value.clear();
        self.saved_key.clear();
        // The seek target is the internal key that sorts before every visible entry for
        // `target`.
        append_internal_key(&mut self.saved_key, target, self.sequence, EntryType::SEEK);

        let seek_key = std::mem::take(&mut self.saved_key);
        self.inner.seek(&seek_key);
        self.saved_key = seek_key;
        self.saved_key.clear();

        if self.inner.valid() {
            self.find_next_user_entry(false);
        } else {
            self.valid = false;
        }
    }

    /// Advance to the next user key. Returns whether the iterator is valid afterward.
    pub fn next(&mut self) -> bool {
        if !self.valid {
            return false;
        }

        if self.direction == Direction::Reverse {
            self.direction = Direction::Forward;
            // The merged cursor sits just before the entries of the current user key (or is
            // exhausted backwards); move it to the first entry at or after them.
            if self.inner.valid() {
                self.inner.next();
            } else {
                self.inner.seek_to_first();
            }
            if !self.inner.valid() {
                self.valid = false;
                self.saved_key.clear();
                return false;
            }
            // `saved_key` already holds the user key just emitted, which is what must be
            // skipped past.
        } else {
            self.saved_key.clear();
            let current_user_key = extract_user_key(self.inner.key()).to_vec();
            self.saved_key = current_user_key;
            self.inner.next();
            if !self.inner.valid() {
                self.valid = false;
                self.saved_key.clear();
                return false;
            }
        }

        self.find_next_user_entry(true);
        self.valid
    }

    /// Step back to the previous user key. Returns whether the iterator is valid afterward.
    pub fn prev(&mut self) -> bool {
        if !self.valid {
            return false;
        }

        if self.direction == Direction::Forward {
            // Walk backwards off every entry of the current user key, so the reverse-direction
            // scan below starts cleanly on the previous key's entries.
            self.saved_key.clear();
            self.saved_key.extend(extract_user_key(self.inner.key()));
            loop {
                self.inner.prev();
                if !self.inner.valid() {
                    self.valid = false;
                    self.saved_key.clear();
                    self.saved_value.clear();
                    return false;
                }
                let user_key = extract_user_key(self.inner.key());
                if self.icmp.cmp_user(user_key, &self.saved_key).is_lt() {
                    break;
                }
            }
            self.direction = Direction::Reverse;
        }

        self.find_prev_user_entry();
        self.valid
    }

    /// Forward scan to the newest visible entry of the next emittable user key. When
    /// `skipping`, entries for user keys at or before `saved_key` are shadowed and passed
    /// over.
    fn find_next_user_entry(&mut self, mut skipping: bool) {
        debug_assert!(self.direction == Direction::Forward);

        loop {
            if !self.inner.valid() {
                break;
            }

            let parsed = match parse_internal_key(self.inner.key()) {
                Ok(parsed) => parsed,
                Err(_bad_key) => {
                    self.record_corruption();
                    return;
                }
            };

            if parsed.sequence <= self.sequence {
                match parsed.entry_type {
                    EntryType::Deletion => {
                        // Everything older for this user key is shadowed by the tombstone.
                        self.saved_key.clear();
                        self.saved_key.extend(parsed.user_key);
                        skipping = true;
                    }
                    EntryType::Value => {
                        let hidden = skipping
                            && self.icmp.cmp_user(parsed.user_key, &self.saved_key).is_le();
                        if !hidden {
                            self.valid = true;
                            self.saved_key.clear();
                            return;
                        }
                    }
                }
            }
            self.inner.next();
        }

        self.saved_key.clear();
        self.valid = false;
    }

    /// Reverse scan: collect the newest visible entry of the current user key into
    /// `saved_key`/`saved_value`, stopping once the scan crosses into an earlier user key.
    fn find_prev_user_entry(&mut self) {
        debug_assert!(self.direction == Direction::Reverse);

        let mut entry_type = EntryType::Deletion;
        loop {
            if !self.inner.valid() {
                break;
            }

            let parsed = match parse_internal_key(self.inner.key()) {
                Ok(parsed) => parsed,
                Err(_bad_key) => {
                    self.record_corruption();
                    return;
                }
            };

            if parsed.sequence <= self.sequence {
                if entry_type != EntryType::Deletion
                    && self.icmp.cmp_user(parsed.user_key, &self.saved_key).is_lt()
                {
                    // The saved entry is the newest visible one for its user key.
                    break;
                }
                entry_type = parsed.entry_type;
                if entry_type == EntryType::Deletion {
                    self.saved_key.clear();
                    self.saved_value.clear();
                } else {
                    self.saved_key.clear();
                    self.saved_key.extend(parsed.user_key);
                    self.saved_value.clear();
                    self.saved_value.extend(self.inner.value());
                }
            }
            self.inner.prev();
        }

        if entry_type == EntryType::Deletion {
            // Ran off the front of the database (or everything was shadowed).
            self.valid = false;
            self.saved_key.clear();
            self.saved_value.clear();
            self.direction = Direction::Forward;
        } else {
            self.valid = true;
        }
    }

    fn record_corruption(&mut self) {
        if self.status.is_none() {
            self.status = Some(Error::corruption("malformed internal key during iteration"));
        }
        self.valid = false;
    }
}

impl Debug for DbIterator {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("DbIterator")
            .field("valid", &self.valid)
            .field("sequence", &self.sequence.inner())
            .field("direction", &self.direction)
            .finish_non_exhaustive()
    }
}
