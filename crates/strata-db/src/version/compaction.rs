use std::sync::Arc;

use strata_sstable::TableComparator as _;

use crate::config::{GRANDPARENT_OVERLAP_FACTOR, NUM_LEVELS};
use crate::version::edit::VersionEdit;
use super::file_metadata::FileMetadata;
use super::version::{Version, total_file_size};


/// One planned compaction: the files of level `L` and `L+1` to merge, the grandparent files
/// bounding the output, and the edit under construction.
pub(crate) struct Compaction {
    pub(crate) level:         usize,
    pub(crate) input_version: Arc<Version>,
    pub(crate) edit:          VersionEdit,
    /// `inputs[0]` is from `level`, `inputs[1]` from `level + 1`.
    pub(crate) inputs:        [Vec<Arc<FileMetadata>>; 2],
    /// Files of `level + 2` overlapping the compaction's key range.
    pub(crate) grandparents:  Vec<Arc<FileMetadata>>,

    max_output_file_size:    u64,
    max_grandparent_overlap: u64,

    // State for `should_stop_before`.
    grandparent_index: usize,
    seen_key:          bool,
    overlapped_bytes:  u64,

    // State for `is_base_level_for_key`: per-level progress through the (sorted) file lists of
    // the levels below the output level. Keys arrive in order, so the scans only move forward.
    level_ptrs: [usize; NUM_LEVELS],
}

impl Compaction {
    #[must_use]
    pub(crate) fn new(level: usize, input_version: Arc<Version>, max_file_size: u64) -> Self {
        Self {
            level,
            input_version,
            edit:                    VersionEdit::new(),
            inputs:                  [Vec::new(), Vec::new()],
            grandparents:            Vec::new(),
            max_output_file_size:    max_file_size,
            max_grandparent_overlap: GRANDPARENT_OVERLAP_FACTOR * max_file_size,
            grandparent_index:       0,
            seen_key:                false,
            overlapped_bytes:        0,
            level_ptrs:              [0; NUM_LEVELS],
        }
    }

    #[must_use]
    pub(crate) fn max_output_file_size(&self) -> u64 {
        self.max_output_file_size
    }

    /// A compaction that can be performed by moving a single file down a level, without
    /// rewriting anything: nothing to merge with, and not enough grandparent overlap to make
    /// the move regrettable.
    #[must_use]
    pub(crate) fn is_trivial_move(&self) -> bool {
        self.inputs[0].len() == 1
            && self.inputs[1].is_empty()
            && total_file_size(&self.grandparents) <= self.max_grandparent_overlap
    }

    /// Record the deletion of every input file in the edit.
    pub(crate) fn add_input_deletions(&mut self) {
        for which in 0..2 {
            for file in &self.inputs[which] {
                self.edit.delete_file(self.level + which, file.number());
            }
        }
    }

    /// Whether `user_key` cannot exist in any level below the compaction's output level. When
    /// true, a tombstone for the key (older than every snapshot) may be dropped outright.
    ///
    /// Must be called with non-decreasing user keys.
    #[must_use]
    pub(crate) fn is_base_level_for_key(&mut self, user_key: &[u8]) -> bool {
        let ucmp = self.input_version.icmp.user_comparator();

        for level in self.level + 2..NUM_LEVELS {
            let files = &self.input_version.files[level];
            while self.level_ptrs[level] < files.len() {
                let file = &files[self.level_ptrs[level]];
                if ucmp.cmp(user_key, file.largest().user_key()).is_le() {
                    if ucmp.cmp(user_key, file.smallest().user_key()).is_ge() {
                        return false;
                    }
                    break;
                }
                self.level_ptrs[level] += 1;
            }
        }
        true
    }

    /// Whether the current output file should be finished before an entry with this internal
    /// key is written, to bound the grandparent overlap of any single output file.
    ///
    /// Must be called with non-decreasing internal keys.
    #[must_use]
    pub(crate) fn should_stop_before(&mut self, internal_key: &[u8]) -> bool {
        let icmp = &self.input_version.icmp;

        while self.grandparent_index < self.grandparents.len()
            && icmp
                .cmp(
                    internal_key,
                    self.grandparents[self.grandparent_index].largest().encoded(),
                )
                .is_gt()
        {
            if self.seen_key {
                self.overlapped_bytes += self.grandparents[self.grandparent_index].size();
            }
            self.grandparent_index += 1;
        }
        self.seen_key = true;

        if self.overlapped_bytes > self.max_grandparent_overlap {
            // Enough future work accumulated behind this output; cut it here.
            self.overlapped_bytes = 0;
            true
        } else {
            false
        }
    }
}

impl std::fmt::Debug for Compaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compaction")
            .field("level", &self.level)
            .field("level_inputs", &self.inputs[0].len())
            .field("parent_inputs", &self.inputs[1].len())
            .field("grandparents", &self.grandparents.len())
            .finish_non_exhaustive()
    }
}
