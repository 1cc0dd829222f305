use std::sync::atomic::{AtomicU32, Ordering};

use crate::format::InternalKey;


/// `remaining_seeks` never starts above this, so a few racing decrements past zero cannot wrap
/// into a plausible budget.
const MAX_SEEKS_BETWEEN_COMPACTIONS: u32 = (1 << 31) - 1;

/// One table file's place in a version: its number, size, and key range.
///
/// Shared by every version that references the file; the seek budget is the one mutable field,
/// decremented by read sampling.
#[derive(Debug)]
pub(crate) struct FileMetadata {
    /// Seeks this file may absorb before it becomes a compaction candidate. A point lookup
    /// that had to look at this file first but found its key elsewhere costs one.
    remaining_seeks: AtomicU32,
    number:          u64,
    size:            u64,
    smallest:        InternalKey,
    largest:         InternalKey,
}

impl FileMetadata {
    #[must_use]
    pub(crate) fn new(number: u64, size: u64, smallest: InternalKey, largest: InternalKey) -> Self {
        // One seek costs about the same as compacting 16 KiB, with a floor so small files are
        // not compacted over a handful of misses.
        let allowed_seeks = u32::try_from(size / 16_384)
            .unwrap_or(u32::MAX)
            .max(100)
            .min(MAX_SEEKS_BETWEEN_COMPACTIONS);

        Self {
            remaining_seeks: AtomicU32::new(allowed_seeks),
            number,
            size,
            smallest,
            largest,
        }
    }

    /// Consume one unit of the seek budget. Returns `true` when the budget has just run out
    /// and the file should be scheduled for compaction.
    #[must_use]
    pub(crate) fn record_seek(&self) -> bool {
        let remaining = self.remaining_seeks.fetch_sub(1, Ordering::Relaxed);
        if remaining > MAX_SEEKS_BETWEEN_COMPACTIONS {
            // Raced past zero; pin the counter back down.
            self.remaining_seeks.store(0, Ordering::Relaxed);
            false
        } else {
            remaining == 1
        }
    }

    #[inline]
    #[must_use]
    pub(crate) fn number(&self) -> u64 {
        self.number
    }

    #[inline]
    #[must_use]
    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    #[must_use]
    pub(crate) fn smallest(&self) -> &InternalKey {
        &self.smallest
    }

    #[inline]
    #[must_use]
    pub(crate) fn largest(&self) -> &InternalKey {
        &self.largest
    }
}


#[cfg(test)]
mod tests {
    use crate::format::{EntryType, SequenceNumber};
    use super::*;


    fn meta(size: u64) -> FileMetadata {
        let smallest = InternalKey::new(b"a", SequenceNumber::new_unchecked(2), EntryType::Value);
        let largest = InternalKey::new(b"z", SequenceNumber::new_unchecked(1), EntryType::Value);
        FileMetadata::new(7, size, smallest, largest)
    }

    #[test]
    fn small_files_get_the_minimum_budget() {
        let metadata = meta(1000);
        // 99 seeks stay within budget; the 100th exhausts it.
        for _ in 0..99 {
            assert!(!metadata.record_seek());
        }
        assert!(metadata.record_seek());
    }

    #[test]
    fn budget_scales_with_file_size() {
        let metadata = meta(16_384 * 500);
        for _ in 0..499 {
            assert!(!metadata.record_seek());
        }
        assert!(metadata.record_seek());
    }

    #[test]
    fn exhausted_budget_fires_once() {
        let metadata = meta(0);
        for _ in 0..99 {
            let _within_budget = metadata.record_seek();
        }
        assert!(metadata.record_seek());
        assert!(!metadata.record_seek());
    }
}
