use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::format::SequenceNumber;


/// Sequence number → number of outstanding handles pinning it.
type SnapshotRegistry = Arc<Mutex<BTreeMap<u64, usize>>>;

/// The set of sequence numbers pinned by live [`Snapshot`] handles. Compaction consults the
/// oldest pinned sequence before dropping shadowed entries or tombstones.
#[derive(Debug, Clone, Default)]
pub(crate) struct SnapshotList {
    registry: SnapshotRegistry,
}

impl SnapshotList {
    #[must_use]
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Pin `sequence` and hand out a releasing handle.
    #[must_use]
    pub(crate) fn acquire(&self, sequence: SequenceNumber) -> Snapshot {
        *self.registry.lock().entry(sequence.inner()).or_insert(0) += 1;
        Snapshot {
            sequence,
            registry: Arc::clone(&self.registry),
        }
    }

    /// The oldest pinned sequence, if any handle is alive.
    #[must_use]
    pub(crate) fn oldest(&self) -> Option<SequenceNumber> {
        self.registry
            .lock()
            .keys()
            .next()
            .copied()
            .map(SequenceNumber::new_unchecked)
    }
}

/// A pinned view of the database at one sequence number.
///
/// Reads through a snapshot observe exactly the writes with sequence numbers at or below it.
/// The pin is released when the last clone of the handle is dropped.
pub struct Snapshot {
    sequence: SequenceNumber,
    registry: SnapshotRegistry,
}

impl Snapshot {
    #[must_use]
    pub(crate) fn sequence(&self) -> SequenceNumber {
        self.sequence
    }
}

impl Clone for Snapshot {
    fn clone(&self) -> Self {
        *self
            .registry
            .lock()
            .get_mut(&self.sequence.inner())
            .expect("a live snapshot is registered") += 1;
        Self {
            sequence: self.sequence,
            registry: Arc::clone(&self.registry),
        }
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        let mut registry = self.registry.lock();
        let remaining = registry
            .get_mut(&self.sequence.inner())
            .expect("a live snapshot is registered");
        *remaining -= 1;
        if *remaining == 0 {
            registry.remove(&self.sequence.inner());
        }
    }
}

impl Debug for Snapshot {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("Snapshot")
            .field("sequence", &self.sequence.inner())
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::*;


    fn seq(sequence: u64) -> SequenceNumber {
        SequenceNumber::new_unchecked(sequence)
    }

    #[test]
    fn oldest_tracks_live_handles() {
        let list = SnapshotList::new();
        assert_eq!(list.oldest(), None);

        let newer = list.acquire(seq(20));
        let older = list.acquire(seq(10));
        assert_eq!(list.oldest(), Some(seq(10)));

        drop(older);
        assert_eq!(list.oldest(), Some(seq(20)));
        drop(newer);
        assert_eq!(list.oldest(), None);
    }

    #[test]
    fn clones_share_one_pin() {
        let list = SnapshotList::new();
        let snapshot = list.acquire(seq(5));
        let clone = snapshot.clone();

        drop(snapshot);
        assert_eq!(list.oldest(), Some(seq(5)));
        drop(clone);
        assert_eq!(list.oldest(), None);
    }

    #[test]
    fn duplicate_sequences_are_refcounted() {
        let list = SnapshotList::new();
        let first = list.acquire(seq(7));
        let second = list.acquire(seq(7));

        drop(first);
        assert_eq!(list.oldest(), Some(seq(7)));
        drop(second);
        assert_eq!(list.oldest(), None);
    }
}
