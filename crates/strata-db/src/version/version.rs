//! A `Version` is one immutable view of the tree: the set of table files at every level.

use std::cmp::Ordering;
use std::fmt::{Debug, Formatter, Result as FmtResult, Write as _};
use std::sync::Arc;

use strata_sstable::{TableComparator as _, TableReadOptions};

use crate::comparator::InternalKeyComparator;
use crate::config::{
    GRANDPARENT_OVERLAP_FACTOR, MAX_MEM_COMPACT_LEVEL, NUM_LEVELS, max_bytes_for_level,
    L0_COMPACTION_TRIGGER,
};
use crate::error::Result;
use crate::format::{
    EntryType, InternalKey, LookupKey, SequenceNumber, parse_internal_key,
};
use crate::table_cache::TableCache;
use super::file_metadata::FileMetadata;


pub(crate) fn total_file_size(files: &[Arc<FileMetadata>]) -> u64 {
    files.iter().map(|file| file.size()).sum()
}

/// What a [`Version::get`] found, and which file (if any) paid for an extra seek while finding
/// it.
pub(crate) struct GetResult {
    /// `None`: the key is in none of this version's files. `Some(None)`: the newest entry is a
    /// tombstone. `Some(Some(value))`: a live value.
    pub(crate) value:     Option<Option<Vec<u8>>>,
    /// The first file read, when the lookup had to read more than one file. Charging it a seek
    /// is what eventually triggers a seek compaction.
    pub(crate) seek_file: Option<(usize, Arc<FileMetadata>)>,
}

/// An immutable snapshot of the file tree. Shared by reference count between the current state,
/// iterators, and in-flight compactions.
pub(crate) struct Version {
    /// The comparator travels with the version so overlap scans do not need the set.
    pub(crate) icmp:        InternalKeyComparator,
    pub(crate) table_cache: TableCache,
    pub(crate) files:       [Vec<Arc<FileMetadata>>; NUM_LEVELS],
    /// Score ≥ 1 means the level is due for a size compaction. Computed when the version is
    /// installed.
    pub(crate) compaction_score: f64,
    pub(crate) compaction_level: usize,
}

impl Version {
    #[must_use]
    pub(crate) fn new_empty(icmp: InternalKeyComparator, table_cache: TableCache) -> Self {
        Self {
            icmp,
            table_cache,
            files: Default::default(),
            compaction_score: -1.0,
            compaction_level: 0,
        }
    }

    #[must_use]
    pub(crate) fn num_files(&self, level: usize) -> usize {
        self.files[level].len()
    }

    /// Compute the size-compaction score: level 0 by file count, deeper levels by byte volume.
    pub(crate) fn finalize(&mut self) {
        let mut best_level = 0;
        let mut best_score = -1.0_f64;

        for level in 0..NUM_LEVELS - 1 {
            let score = if level == 0 {
                self.files[0].len() as f64 / L0_COMPACTION_TRIGGER as f64
            } else {
                total_file_size(&self.files[level]) as f64 / max_bytes_for_level(level)
            };
            if score > best_score {
                best_level = level;
                best_score = score;
            }
        }

        self.compaction_level = best_level;
        self.compaction_score = best_score;
    }

    /// Look `lookup_key` up in the version's files, newest tier first.
    pub(crate) fn get(&self, ropts: TableReadOptions, lookup_key: &LookupKey) -> Result<GetResult> {
        let internal_key = lookup_key.internal_key();
        let user_key = lookup_key.user_key();
        let ucmp = self.icmp.user_comparator();

        let mut last_file_read: Option<(usize, Arc<FileMetadata>)> = None;
        let mut seek_file: Option<(usize, Arc<FileMetadata>)> = None;

        // Level-0 files may overlap each other; every one covering the user key must be
        // checked, newest first.
        let mut level0_candidates: Vec<&Arc<FileMetadata>> = self.files[0]
            .iter()
            .filter(|file| {
                ucmp.cmp(user_key, file.smallest().user_key()).is_ge()
                    && ucmp.cmp(user_key, file.largest().user_key()).is_le()
            })
            .collect();
        level0_candidates.sort_by(|lhs, rhs| rhs.number().cmp(&lhs.number()));

        let mut search: Vec<(usize, Arc<FileMetadata>)> = level0_candidates
            .into_iter()
            .map(|file| (0, Arc::clone(file)))
            .collect();

        // Deeper levels are disjoint: at most one candidate each.
        for level in 1..NUM_LEVELS {
            let files = &self.files[level];
            if let Some(index) = find_file(&self.icmp, files, internal_key) {
                let file = &files[index];
                if ucmp.cmp(user_key, file.smallest().user_key()).is_ge() {
                    search.push((level, Arc::clone(file)));
                }
            }
        }

        for (level, file) in search {
            if seek_file.is_none() {
                if let Some(first_read) = last_file_read.take() {
                    // This lookup is now reading its second file; the first one pays a seek.
                    seek_file = Some(first_read);
                }
            }
            if last_file_read.is_none() && seek_file.is_none() {
                last_file_read = Some((level, Arc::clone(&file)));
            }

            let found =
                self.table_cache
                    .get(ropts, file.number(), file.size(), internal_key)?;
            let Some((found_key, found_value)) = found else {
                continue;
            };

            let parsed = parse_internal_key(&found_key)?;
            if ucmp.cmp(parsed.user_key, user_key).is_ne() {
                continue;
            }

            let value = match parsed.entry_type {
                EntryType::Value    => Some(Some(found_value)),
                EntryType::Deletion => Some(None),
            };
            return Ok(GetResult { value, seek_file });
        }

        Ok(GetResult { value: None, seek_file })
    }

    /// Whether any file in `level` overlaps the user-key range. `None` bounds are unbounded.
    #[must_use]
    pub(crate) fn overlap_in_level(
        &self,
        level:             usize,
        smallest_user_key: Option<&[u8]>,
        largest_user_key:  Option<&[u8]>,
    ) -> bool {
        some_file_overlaps_range(
            &self.icmp,
            level > 0,
            &self.files[level],
            smallest_user_key,
            largest_user_key,
        )
    }

    /// The level a fresh memtable flush should land at: level 0 when anything there overlaps,
    /// otherwise pushed down while the next level is clear and the grandparent overlap stays
    /// small.
    #[must_use]
    pub(crate) fn pick_level_for_memtable_output(
        &self,
        smallest_user_key: &[u8],
        largest_user_key:  &[u8],
        max_file_size:     u64,
    ) -> usize {
        let mut level = 0;
        if self.overlap_in_level(0, Some(smallest_user_key), Some(largest_user_key)) {
            return level;
        }

        let start =
            InternalKey::new(smallest_user_key, SequenceNumber::MAX, EntryType::SEEK);
        let limit =
            InternalKey::new(largest_user_key, SequenceNumber::ZERO, EntryType::Deletion);

        while level < MAX_MEM_COMPACT_LEVEL {
            if self.overlap_in_level(level + 1, Some(smallest_user_key), Some(largest_user_key)) {
                break;
            }
            if level + 2 < NUM_LEVELS {
                let grandparents =
                    self.overlapping_inputs(level + 2, Some(&start), Some(&limit));
                if total_file_size(&grandparents) > GRANDPARENT_OVERLAP_FACTOR * max_file_size {
                    break;
                }
            }
            level += 1;
        }
        level
    }

    /// All files in `level` whose key range touches `[begin, end]`. For level 0, where files
    /// overlap each other, the range grows to cover every transitively overlapping file.
    #[must_use]
    pub(crate) fn overlapping_inputs(
        &self,
        level: usize,
        begin: Option<&InternalKey>,
        end:   Option<&InternalKey>,
    ) -> Vec<Arc<FileMetadata>> {
        let ucmp = self.icmp.user_comparator();
        let mut user_begin: Option<Vec<u8>> = begin.map(|key| key.user_key().to_vec());
        let mut user_end: Option<Vec<u8>> = end.map(|key| key.user_key().to_vec());

        let mut inputs = Vec::new();
        let mut index = 0;
        while index < self.files[level].len() {
            let file = &self.files[level][index];
            index += 1;

            let file_start = file.smallest().user_key();
            let file_limit = file.largest().user_key();

            if user_begin
                .as_deref()
                .is_some_and(|begin| ucmp.cmp(file_limit, begin).is_lt())
            {
                continue;
            }
            if user_end
                .as_deref()
                .is_some_and(|end| ucmp.cmp(file_start, end).is_gt())
            {
                continue;
            }

            inputs.push(Arc::clone(file));
            if level == 0 {
                // Level-0 files overlap each other: a newly included file may widen the range
                // and pull in files already skipped, so restart the scan.
                if user_begin
                    .as_deref()
                    .is_some_and(|begin| ucmp.cmp(file_start, begin).is_lt())
                {
                    user_begin = Some(file_start.to_vec());
                    inputs.clear();
                    index = 0;
                } else if user_end
                    .as_deref()
                    .is_some_and(|end| ucmp.cmp(file_limit, end).is_gt())
                {
                    user_end = Some(file_limit.to_vec());
                    inputs.clear();
                    index = 0;
                }
            }
        }
        inputs
    }

    /// An approximate byte offset within the version's on-disk data at which `internal_key`
    /// would appear.
    pub(crate) fn approximate_offset_of(&self, internal_key: &InternalKey) -> Result<u64> {
        let mut offset = 0;

        for level in 0..NUM_LEVELS {
            for file in &self.files[level] {
                if self.icmp.cmp(file.largest().encoded(), internal_key.encoded()).is_le() {
                    // The whole file is before the key.
                    offset += file.size();
                } else if self.icmp.cmp(file.smallest().encoded(), internal_key.encoded()).is_gt()
                {
                    // The whole file is after the key. Deeper files in a sorted level are
                    // further after it still.
                    if level > 0 {
                        break;
                    }
                } else {
                    // The key falls inside the file; ask the table how far in.
                    let table = self
                        .table_cache
                        .get_table(file.number(), file.size())?;
                    offset += table.approximate_offset_of(internal_key.encoded());
                }
            }
        }
        Ok(offset)
    }

    /// Per-level file listing used by the `"leveldb.sstables"` property.
    #[must_use]
    pub(crate) fn sstables_string(&self) -> String {
        let mut rendered = String::new();
        for level in 0..NUM_LEVELS {
            let _infallible = writeln!(rendered, "--- level {level} ---");
            for file in &self.files[level] {
                let _infallible = writeln!(
                    rendered,
                    " {}:{}[{:?} .. {:?}]",
                    file.number(),
                    file.size(),
                    file.smallest(),
                    file.largest(),
                );
            }
        }
        rendered
    }
}

impl Debug for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        let file_counts: Vec<usize> =
            (0..NUM_LEVELS).map(|level| self.files[level].len()).collect();
        f.debug_struct("Version")
            .field("files_per_level", &file_counts)
            .field("compaction_score", &self.compaction_score)
            .field("compaction_level", &self.compaction_level)
            .finish()
    }
}

/// Binary search a disjoint, sorted level for the first file whose largest key is at or after
/// `internal_key`.
#[must_use]
pub(crate) fn find_file(
    icmp:         &InternalKeyComparator,
    files:        &[Arc<FileMetadata>],
    internal_key: &[u8],
) -> Option<usize> {
    let index = files.partition_point(|file| {
        icmp.cmp(file.largest().encoded(), internal_key) == Ordering::Less
    });
    (index < files.len()).then_some(index)
}

/// Whether any file overlaps the user-key range; `disjoint` enables the binary-search fast
/// path for levels whose files cannot overlap each other.
#[must_use]
pub(crate) fn some_file_overlaps_range(
    icmp:              &InternalKeyComparator,
    disjoint:          bool,
    files:             &[Arc<FileMetadata>],
    smallest_user_key: Option<&[u8]>,
    largest_user_key:  Option<&[u8]>,
) -> bool {
    let ucmp = icmp.user_comparator();

    if !disjoint {
        return files.iter().any(|file| {
            let before = smallest_user_key
                .is_some_and(|smallest| ucmp.cmp(file.largest().user_key(), smallest).is_lt());
            let after = largest_user_key
                .is_some_and(|largest| ucmp.cmp(file.smallest().user_key(), largest).is_gt());
            !(before || after)
        });
    }

    let index = if let Some(smallest) = smallest_user_key {
        let probe = InternalKey::new(smallest, SequenceNumber::MAX, EntryType::SEEK);
        match find_file(icmp, files, probe.encoded()) {
            Some(index) => index,
            None => return false,
        }
    } else {
        0
    };

    if index >= files.len() {
        return false;
    }

    // The range's end must not fall before the candidate file's start.
    !largest_user_key
        .is_some_and(|largest| ucmp.cmp(largest, files[index].smallest().user_key()).is_lt())
}
