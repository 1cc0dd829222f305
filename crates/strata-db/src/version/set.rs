//! The version set: the current [`Version`], the MANIFEST it is recovered from and logged to,
//! compaction picking, and the monotonic file-number counter.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use tracing::{debug, info};

use strata_sstable::TableComparator as _;

use crate::comparator::InternalKeyComparator;
use crate::config::{EXPANDED_COMPACTION_FACTOR, NUM_LEVELS};
use crate::error::{Error, Result};
use crate::filenames::{DbFileName, read_current_file, set_current_file};
use crate::format::{InternalKey, SequenceNumber};
use crate::options::Options;
use crate::table_cache::TableCache;
use crate::write_log::{CorruptionReporter, LogReader, LogWriter};
use super::compaction::Compaction;
use super::edit::VersionEdit;
use super::file_metadata::FileMetadata;
use super::version::{Version, total_file_size};


pub(crate) struct VersionSet {
    db_path:     PathBuf,
    opts:        Arc<Options>,
    icmp:        InternalKeyComparator,
    table_cache: TableCache,

    /// Source of every file number in the database: logs, tables, manifests, temp files.
    next_file_number:     u64,
    manifest_file_number: u64,
    last_sequence:        SequenceNumber,
    /// The current write-ahead log's number. Logs below it are replayed no more.
    log_number:      u64,
    /// The log still owned by an unflushed immutable memtable, or zero.
    prev_log_number: u64,

    current:       Arc<Version>,
    /// Every version that may still be referenced (by iterators, snapshots, or compactions);
    /// dead entries are pruned opportunistically. Needed to compute the live-file set.
    live_versions: Vec<Weak<Version>>,

    /// Where the next size compaction of each level should begin: just after the largest key
    /// compacted from that level so far, wrapping around.
    compact_pointers: [Option<InternalKey>; NUM_LEVELS],

    manifest_log:   Option<LogWriter<BufWriter<File>>>,
    manifest_bytes: u64,
}

impl VersionSet {
    #[must_use]
    pub(crate) fn new(
        db_path:     PathBuf,
        opts:        Arc<Options>,
        icmp:        InternalKeyComparator,
        table_cache: TableCache,
    ) -> Self {
        let current = Arc::new(Version::new_empty(icmp.clone(), table_cache.clone()));
        Self {
            db_path,
            opts,
            icmp,
            table_cache,
            next_file_number:     2,
            manifest_file_number: 0,
            last_sequence:        SequenceNumber::ZERO,
            log_number:           0,
            prev_log_number:      0,
            live_versions:        vec![Arc::downgrade(&current)],
            current,
            compact_pointers:     Default::default(),
            manifest_log:         None,
            manifest_bytes:       0,
        }
    }

    /// Write the manifest and `CURRENT` file of a brand-new database.
    pub(crate) fn create_new_db(db_path: &std::path::Path, comparator_name: &str) -> Result<()> {
        let mut edit = VersionEdit::new();
        edit.comparator_name = Some(comparator_name.to_owned());
        edit.log_number = Some(0);
        edit.next_file_number = Some(2);
        edit.last_sequence = Some(SequenceNumber::ZERO);

        let manifest_number = 1;
        let manifest_path = DbFileName::Manifest(manifest_number).path_in(db_path);
        let manifest_file = File::create(&manifest_path)?;
        let mut log = LogWriter::new_empty(BufWriter::new(manifest_file));

        let mut record = Vec::new();
        edit.encode(&mut record);
        let write_result = log.add_record(&record).and_then(|()| log.sync());

        match write_result {
            Ok(()) => set_current_file(db_path, manifest_number),
            Err(error) => {
                let _best_effort = fs::remove_file(&manifest_path);
                Err(error.into())
            }
        }
    }

    #[must_use]
    pub(crate) fn current(&self) -> Arc<Version> {
        Arc::clone(&self.current)
    }

    #[must_use]
    pub(crate) fn last_sequence(&self) -> SequenceNumber {
        self.last_sequence
    }

    pub(crate) fn set_last_sequence(&mut self, sequence: SequenceNumber) {
        debug_assert!(sequence >= self.last_sequence);
        self.last_sequence = sequence;
    }

    #[must_use]
    pub(crate) fn log_number(&self) -> u64 {
        self.log_number
    }

    #[must_use]
    pub(crate) fn prev_log_number(&self) -> u64 {
        self.prev_log_number
    }

    #[must_use]
    pub(crate) fn manifest_file_number(&self) -> u64 {
        self.manifest_file_number
    }

    pub(crate) fn new_file_number(&mut self) -> u64 {
        let number = self.next_file_number;
        self.next_file_number += 1;
        number
    }

    /// Bump the counter past a number observed in the wild (a recovered log, for instance).
    pub(crate) fn mark_file_number_used(&mut self, number: u64) {
        if self.next_file_number <= number {
            self.next_file_number = number + 1;
        }
    }

    /// Hand a just-allocated-but-unused file number back, so an aborted operation does not
    /// burn through the counter.
    pub(crate) fn reuse_file_number(&mut self, number: u64) {
        if self.next_file_number == number + 1 {
            self.next_file_number = number;
        }
    }

    /// The file numbers referenced by any live version.
    #[must_use]
    pub(crate) fn live_files(&mut self) -> HashSet<u64> {
        self.live_versions.retain(|version| version.strong_count() > 0);

        let mut live = HashSet::new();
        for weak_version in &self.live_versions {
            let Some(version) = weak_version.upgrade() else { continue };
            for level in 0..NUM_LEVELS {
                live.extend(version.files[level].iter().map(|file| file.number()));
            }
        }
        live
    }

    /// Apply `edit` on top of the current version, persist it to the manifest, and install the
    /// result as the new current version.
    ///
    /// An error leaves the in-memory state unchanged; the caller must treat manifest write
    /// failures as poisoning the database for writes.
    pub(crate) fn log_and_apply(&mut self, edit: &mut VersionEdit) -> Result<()> {
        match edit.log_number {
            None => edit.log_number = Some(self.log_number),
            Some(number) => {
                debug_assert!(number >= self.log_number && number < self.next_file_number);
            }
        }
        if edit.prev_log_number.is_none() {
            edit.prev_log_number = Some(self.prev_log_number);
        }

        // Roll the manifest over before freezing the file-number counter into the edit, so the
        // rolled file's own number is not resurrected by a later recovery.
        let needs_new_manifest =
            self.manifest_log.is_none() || self.manifest_bytes >= self.opts.max_file_size;
        if needs_new_manifest && self.manifest_log.is_some() {
            self.manifest_file_number = self.new_file_number();
            self.manifest_log = None;
        }

        edit.next_file_number = Some(self.next_file_number);
        edit.last_sequence = Some(self.last_sequence);

        let mut version = Version::new_empty(self.icmp.clone(), self.table_cache.clone());
        {
            let mut builder = VersionBuilder::new(self.icmp.clone(), Arc::clone(&self.current));
            builder.apply(edit, &mut self.compact_pointers);
            builder.save_to(&mut version);
        }
        version.finalize();

        let manifest_result = self.append_to_manifest(edit, needs_new_manifest);
        if let Err(error) = manifest_result {
            if needs_new_manifest {
                self.manifest_log = None;
                let manifest_path =
                    DbFileName::Manifest(self.manifest_file_number).path_in(&self.db_path);
                let _best_effort = fs::remove_file(manifest_path);
            }
            return Err(error);
        }

        self.install_version(version);
        self.log_number = edit.log_number.expect("filled in above");
        self.prev_log_number = edit.prev_log_number.expect("filled in above");
        Ok(())
    }

    fn append_to_manifest(&mut self, edit: &VersionEdit, new_manifest: bool) -> Result<()> {
        if new_manifest {
            debug_assert!(self.manifest_log.is_none());
            let manifest_path =
                DbFileName::Manifest(self.manifest_file_number).path_in(&self.db_path);
            let manifest_file = File::create(manifest_path)?;
            let mut log = LogWriter::new_empty(BufWriter::new(manifest_file));

            let snapshot = self.snapshot_edit();
            let mut record = Vec::new();
            snapshot.encode(&mut record);
            log.add_record(&record)?;
            self.manifest_bytes = record.len() as u64;
            self.manifest_log = Some(log);
        }

        let mut record = Vec::new();
        edit.encode(&mut record);
        let log = self.manifest_log.as_mut().expect("manifest log exists here");
        log.add_record(&record)?;
        log.sync()?;
        self.manifest_bytes += record.len() as u64;

        if new_manifest {
            set_current_file(&self.db_path, self.manifest_file_number)?;
            info!(manifest = self.manifest_file_number, "switched to new manifest");
        }
        Ok(())
    }

    /// An edit reproducing the entire current state, written first into every new manifest.
    fn snapshot_edit(&self) -> VersionEdit {
        let mut edit = VersionEdit::new();
        edit.comparator_name = Some(self.icmp.user_comparator().name().to_owned());

        for (level, pointer) in self.compact_pointers.iter().enumerate() {
            if let Some(pointer) = pointer {
                edit.compact_pointers.push((level, pointer.clone()));
            }
        }
        for level in 0..NUM_LEVELS {
            for file in &self.current.files[level] {
                edit.add_file(
                    level,
                    file.number(),
                    file.size(),
                    file.smallest().clone(),
                    file.largest().clone(),
                );
            }
        }
        edit
    }

    fn install_version(&mut self, version: Version) {
        let version = Arc::new(version);
        self.live_versions.retain(|live| live.strong_count() > 0);
        self.live_versions.push(Arc::downgrade(&version));
        self.current = version;
    }

    /// Rebuild the current version by replaying the manifest named by `CURRENT`.
    pub(crate) fn recover(&mut self) -> Result<()> {
        let manifest_number = read_current_file(&self.db_path)?;
        let manifest_path = DbFileName::Manifest(manifest_number).path_in(&self.db_path);
        let manifest_file = File::open(&manifest_path)?;

        struct StrictReporter {
            first_error: Option<String>,
        }
        impl CorruptionReporter for StrictReporter {
            fn corruption(&mut self, bytes: usize, reason: &str) {
                if self.first_error.is_none() {
                    self.first_error = Some(format!("{reason} ({bytes} bytes)"));
                }
            }
        }

        let mut reporter = StrictReporter { first_error: None };
        let mut reader = LogReader::new(BufReader::new(manifest_file), true, 0);
        let mut builder = VersionBuilder::new(self.icmp.clone(), Arc::clone(&self.current));

        let mut log_number = None;
        let mut prev_log_number = None;
        let mut next_file_number = None;
        let mut last_sequence = None;

        let mut record = Vec::new();
        while reader.read_record(&mut record, &mut reporter) {
            let edit = VersionEdit::decode_from(&record)?;

            if let Some(comparator_name) = &edit.comparator_name {
                let expected = self.icmp.user_comparator().name();
                if comparator_name != expected {
                    return Err(Error::invalid_argument(format!(
                        "comparator mismatch: database uses {comparator_name:?}, \
                         options supply {expected:?}",
                    )));
                }
            }

            builder.apply(&edit, &mut self.compact_pointers);

            if edit.log_number.is_some() {
                log_number = edit.log_number;
            }
            if edit.prev_log_number.is_some() {
                prev_log_number = edit.prev_log_number;
            }
            if edit.next_file_number.is_some() {
                next_file_number = edit.next_file_number;
            }
            if edit.last_sequence.is_some() {
                last_sequence = edit.last_sequence;
            }
        }

        if let Some(reason) = reporter.first_error {
            return Err(Error::corruption(format!("manifest is damaged: {reason}")));
        }

        let next_file_number = next_file_number
            .ok_or_else(|| Error::corruption("manifest has no next-file-number entry"))?;
        let log_number =
            log_number.ok_or_else(|| Error::corruption("manifest has no log-number entry"))?;
        let last_sequence = last_sequence
            .ok_or_else(|| Error::corruption("manifest has no last-sequence entry"))?;
        let prev_log_number = prev_log_number.unwrap_or(0);

        self.next_file_number = next_file_number;
        self.mark_file_number_used(log_number);
        self.mark_file_number_used(prev_log_number);

        let mut version = Version::new_empty(self.icmp.clone(), self.table_cache.clone());
        builder.save_to(&mut version);
        version.finalize();
        self.install_version(version);

        // The next manifest gets the recovered next-file number; everything after it comes
        // from the bumped counter.
        self.manifest_file_number = self.next_file_number;
        self.next_file_number += 1;
        self.last_sequence = last_sequence;
        self.log_number = log_number;
        self.prev_log_number = prev_log_number;

        debug!(
            manifest = manifest_number,
            log = log_number,
            last_sequence = last_sequence.inner(),
            "recovered versions from manifest",
        );
        Ok(())
    }

    /// Pick the next compaction to run: a size-triggered one when any level's score reached
    /// one, else a seek-triggered one if a file exhausted its seek budget.
    pub(crate) fn pick_compaction(
        &mut self,
        seek_candidate: Option<(usize, Arc<FileMetadata>)>,
    ) -> Option<Compaction> {
        let current = self.current();
        let max_file_size = self.opts.max_file_size;

        let mut compaction = if current.compaction_score >= 1.0 {
            let level = current.compaction_level;
            debug_assert!(level + 1 < NUM_LEVELS);

            // Start just after the last key compacted at this level, wrapping to the first
            // file so the whole level is cycled through over time.
            let files = &current.files[level];
            let starting_file = files
                .iter()
                .find(|file| {
                    self.compact_pointers[level].as_ref().is_none_or(|pointer| {
                        self.icmp.cmp(file.largest().encoded(), pointer.encoded()).is_gt()
                    })
                })
                .or_else(|| files.first())?;

            let mut compaction = Compaction::new(level, Arc::clone(&current), max_file_size);
            compaction.inputs[0].push(Arc::clone(starting_file));
            compaction
        } else if let Some((level, file)) = seek_candidate {
            let mut compaction = Compaction::new(level, Arc::clone(&current), max_file_size);
            compaction.inputs[0].push(file);
            compaction
        } else {
            return None;
        };

        if compaction.level == 0 {
            // Level-0 files overlap each other, so the chosen file drags every overlapping
            // sibling into the compaction.
            let (smallest, largest) = key_range(&self.icmp, &compaction.inputs[0]);
            compaction.inputs[0] =
                current.overlapping_inputs(0, Some(&smallest), Some(&largest));
            debug_assert!(!compaction.inputs[0].is_empty());
        }

        self.setup_other_inputs(&mut compaction);
        Some(compaction)
    }

    /// A manual compaction of every file in `level` overlapping `[begin, end]`.
    pub(crate) fn compact_range(
        &mut self,
        level: usize,
        begin: Option<&InternalKey>,
        end:   Option<&InternalKey>,
    ) -> Option<Compaction> {
        let current = self.current();
        let mut inputs = current.overlapping_inputs(level, begin, end);
        if inputs.is_empty() {
            return None;
        }

        // Bound one manual pass over a sorted level, so a range covering the whole level does
        // not become a single enormous compaction.
        if level > 0 {
            let limit = self.opts.max_file_size;
            let mut total = 0;
            for (index, file) in inputs.iter().enumerate() {
                total += file.size();
                if total >= limit {
                    inputs.truncate(index + 1);
                    break;
                }
            }
        }

        let mut compaction = Compaction::new(level, current, self.opts.max_file_size);
        compaction.inputs[0] = inputs;
        self.setup_other_inputs(&mut compaction);
        Some(compaction)
    }

    fn setup_other_inputs(&mut self, compaction: &mut Compaction) {
        let level = compaction.level;
        let current = Arc::clone(&compaction.input_version);

        add_boundary_inputs(&self.icmp, &current.files[level], &mut compaction.inputs[0]);
        let (smallest, largest) = key_range(&self.icmp, &compaction.inputs[0]);

        compaction.inputs[1] =
            current.overlapping_inputs(level + 1, Some(&smallest), Some(&largest));
        add_boundary_inputs(&self.icmp, &current.files[level + 1], &mut compaction.inputs[1]);

        let (mut all_start, mut all_limit) =
            key_range_2(&self.icmp, &compaction.inputs[0], &compaction.inputs[1]);

        // Try to grow the level-L input set without changing the L+1 set, as long as the total
        // stays reasonable: more merged per pass for the same rewrite cost.
        if !compaction.inputs[1].is_empty() {
            let mut expanded0 =
                current.overlapping_inputs(level, Some(&all_start), Some(&all_limit));
            add_boundary_inputs(&self.icmp, &current.files[level], &mut expanded0);

            let inputs1_size = total_file_size(&compaction.inputs[1]);
            let expanded0_size = total_file_size(&expanded0);
            let expansion_limit = EXPANDED_COMPACTION_FACTOR * self.opts.max_file_size;

            if expanded0.len() > compaction.inputs[0].len()
                && inputs1_size + expanded0_size < expansion_limit
            {
                let (new_start, new_limit) = key_range(&self.icmp, &expanded0);
                let mut expanded1 =
                    current.overlapping_inputs(level + 1, Some(&new_start), Some(&new_limit));
                add_boundary_inputs(&self.icmp, &current.files[level + 1], &mut expanded1);

                if expanded1.len() == compaction.inputs[1].len() {
                    info!(
                        level,
                        from_files = compaction.inputs[0].len(),
                        to_files = expanded0.len(),
                        "expanding compaction inputs",
                    );
                    compaction.inputs[0] = expanded0;
                    compaction.inputs[1] = expanded1;
                    (all_start, all_limit) =
                        key_range_2(&self.icmp, &compaction.inputs[0], &compaction.inputs[1]);
                }
            }
        }

        if level + 2 < NUM_LEVELS {
            compaction.grandparents =
                current.overlapping_inputs(level + 2, Some(&all_start), Some(&all_limit));
        }

        // Future size compactions of this level resume after the range compacted now. Updated
        // both in memory and in the pending edit, so a crash before the edit lands simply
        // retries the same range.
        let (_, largest) = key_range(&self.icmp, &compaction.inputs[0]);
        self.compact_pointers[level] = Some(largest.clone());
        compaction.edit.compact_pointers.push((level, largest));
    }

}

impl std::fmt::Debug for VersionSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionSet")
            .field("next_file_number", &self.next_file_number)
            .field("log_number", &self.log_number)
            .field("last_sequence", &self.last_sequence.inner())
            .field("current", &self.current)
            .finish_non_exhaustive()
    }
}

/// The smallest and largest internal keys across `files`.
fn key_range(
    icmp:  &InternalKeyComparator,
    files: &[Arc<FileMetadata>],
) -> (InternalKey, InternalKey) {
    debug_assert!(!files.is_empty());
    let mut smallest = files[0].smallest().clone();
    let mut largest = files[0].largest().clone();

    for file in &files[1..] {
        if icmp.cmp(file.smallest().encoded(), smallest.encoded()).is_lt() {
            smallest = file.smallest().clone();
        }
        if icmp.cmp(file.largest().encoded(), largest.encoded()).is_gt() {
            largest = file.largest().clone();
        }
    }
    (smallest, largest)
}

fn key_range_2(
    icmp:   &InternalKeyComparator,
    first:  &[Arc<FileMetadata>],
    second: &[Arc<FileMetadata>],
) -> (InternalKey, InternalKey) {
    let mut all: Vec<Arc<FileMetadata>> = first.to_vec();
    all.extend_from_slice(second);
    key_range(icmp, &all)
}

/// Extend `compaction_files` with every file in `level_files` whose smallest key continues the
/// user key at the current upper boundary.
///
/// Two files may hold entries for the same user key at different sequence numbers (the range
/// boundary falls between internal keys). Compacting the newer entry's file down a level while
/// the older entry stays behind would make the older entry spuriously win later reads, so the
/// boundary file must join the compaction, repeatedly, until the boundary user key changes.
pub(super) fn add_boundary_inputs(
    icmp:             &InternalKeyComparator,
    level_files:      &[Arc<FileMetadata>],
    compaction_files: &mut Vec<Arc<FileMetadata>>,
) {
    let ucmp = icmp.user_comparator();

    let Some(mut largest_key) = find_largest_key(icmp, compaction_files) else {
        return;
    };

    loop {
        // The smallest file strictly after `largest_key` that starts with its user key.
        let smallest_boundary_file = level_files
            .iter()
            .filter(|file| {
                icmp.cmp(file.smallest().encoded(), largest_key.encoded()).is_gt()
                    && ucmp
                        .cmp(file.smallest().user_key(), largest_key.user_key())
                        .is_eq()
            })
            .min_by(|lhs, rhs| {
                icmp.cmp(lhs.smallest().encoded(), rhs.smallest().encoded())
            });

        match smallest_boundary_file {
            Some(boundary_file) => {
                largest_key = boundary_file.largest().clone();
                compaction_files.push(Arc::clone(boundary_file));
            }
            None => return,
        }
    }
}

fn find_largest_key(
    icmp:  &InternalKeyComparator,
    files: &[Arc<FileMetadata>],
) -> Option<InternalKey> {
    files
        .iter()
        .map(|file| file.largest())
        .max_by(|lhs, rhs| icmp.cmp(lhs.encoded(), rhs.encoded()))
        .cloned()
}

// ================================================================
//  Building a version from a base plus edits
// ================================================================

#[derive(Default)]
struct LevelState {
    deleted: HashSet<u64>,
    added:   Vec<Arc<FileMetadata>>,
}

/// Accumulates edits on top of a base version and emits the merged result.
struct VersionBuilder {
    icmp:   InternalKeyComparator,
    base:   Arc<Version>,
    levels: [LevelState; NUM_LEVELS],
}

impl VersionBuilder {
    #[must_use]
    fn new(icmp: InternalKeyComparator, base: Arc<Version>) -> Self {
        Self {
            icmp,
            base,
            levels: Default::default(),
        }
    }

    fn apply(
        &mut self,
        edit:             &VersionEdit,
        compact_pointers: &mut [Option<InternalKey>; NUM_LEVELS],
    ) {
        for (level, pointer) in &edit.compact_pointers {
            compact_pointers[*level] = Some(pointer.clone());
        }
        for (level, number) in &edit.deleted_files {
            self.levels[*level].deleted.insert(*number);
        }
        for new_file in &edit.new_files {
            let metadata = Arc::new(FileMetadata::new(
                new_file.number,
                new_file.size,
                new_file.smallest.clone(),
                new_file.largest.clone(),
            ));
            self.levels[new_file.level].deleted.remove(&new_file.number);
            self.levels[new_file.level].added.push(metadata);
        }
    }

    fn save_to(&mut self, version: &mut Version) {
        for level in 0..NUM_LEVELS {
            let level_state = &mut self.levels[level];
            let base_files = &self.base.files[level];

            // Merge the sorted base files with the sorted additions, dropping deletions.
            level_state.added.sort_by(|lhs, rhs| {
                self.icmp
                    .cmp(lhs.smallest().encoded(), rhs.smallest().encoded())
                    .then_with(|| lhs.number().cmp(&rhs.number()))
            });

            let merged = &mut version.files[level];
            merged.reserve(base_files.len() + level_state.added.len());

            let mut base_iter = base_files.iter().peekable();
            for added_file in &level_state.added {
                while let Some(base_file) = base_iter.peek() {
                    let added_first = self
                        .icmp
                        .cmp(base_file.smallest().encoded(), added_file.smallest().encoded())
                        .is_ge();
                    if added_first {
                        break;
                    }
                    if !level_state.deleted.contains(&base_file.number()) {
                        merged.push(Arc::clone(base_file));
                    }
                    let _consumed = base_iter.next();
                }
                if !level_state.deleted.contains(&added_file.number()) {
                    merged.push(Arc::clone(added_file));
                }
            }
            for base_file in base_iter {
                if !level_state.deleted.contains(&base_file.number()) {
                    merged.push(Arc::clone(base_file));
                }
            }

            // Levels past zero must stay disjoint; a violation here is an engine bug, not
            // data corruption.
            if level > 0 {
                for pair in merged.windows(2) {
                    debug_assert!(
                        self.icmp
                            .cmp(pair[0].largest().encoded(), pair[1].smallest().encoded())
                            .is_lt(),
                        "files overlap in level {level}",
                    );
                }
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use strata_sstable::BytewiseComparator;

    use crate::format::EntryType;
    use super::*;


    fn icmp() -> InternalKeyComparator {
        InternalKeyComparator::new(Arc::new(BytewiseComparator))
    }

    fn key(user_key: &[u8], sequence: u64) -> InternalKey {
        InternalKey::new(user_key, SequenceNumber::new_unchecked(sequence), EntryType::Value)
    }

    fn file(number: u64, smallest: InternalKey, largest: InternalKey) -> Arc<FileMetadata> {
        Arc::new(FileMetadata::new(number, 1024, smallest, largest))
    }

    #[test]
    fn boundary_inputs_without_shared_user_keys_change_nothing() {
        let icmp = icmp();
        let level_files = vec![
            file(1, key(b"a", 5), key(b"c", 5)),
            file(2, key(b"d", 5), key(b"f", 5)),
        ];
        let mut inputs = vec![Arc::clone(&level_files[0])];

        add_boundary_inputs(&icmp, &level_files, &mut inputs);
        assert_eq!(inputs.len(), 1);
        assert_eq!(inputs[0].number(), 1);
    }

    #[test]
    fn boundary_file_sharing_a_user_key_is_pulled_in() {
        let icmp = icmp();
        // File 1 ends with user key "b" at sequence 7; file 2 begins with "b" at an older
        // sequence. Compacting file 1 alone would leave the older "b" able to shadow the
        // newer one.
        let level_files = vec![
            file(1, key(b"a", 9), key(b"b", 7)),
            file(2, key(b"b", 5), key(b"d", 5)),
        ];
        let mut inputs = vec![Arc::clone(&level_files[0])];

        add_boundary_inputs(&icmp, &level_files, &mut inputs);
        assert_eq!(inputs.len(), 2);
        assert_eq!(inputs[1].number(), 2);
    }

    #[test]
    fn boundary_extension_is_transitive() {
        let icmp = icmp();
        let level_files = vec![
            file(1, key(b"a", 9), key(b"b", 8)),
            file(2, key(b"b", 7), key(b"b", 6)),
            file(3, key(b"b", 5), key(b"c", 5)),
            file(4, key(b"x", 5), key(b"z", 5)),
        ];
        let mut inputs = vec![Arc::clone(&level_files[0])];

        add_boundary_inputs(&icmp, &level_files, &mut inputs);
        let numbers: Vec<u64> = inputs.iter().map(|input| input.number()).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[test]
    fn builder_merges_additions_and_deletions() {
        let icmp_value = icmp();
        let dir = tempfile::tempdir().unwrap();
        let opts = Arc::new(Options::default());
        let cache = TableCache::new(dir.path().to_path_buf(), &opts, icmp_value.clone());

        let mut base = Version::new_empty(icmp_value.clone(), cache.clone());
        base.files[1] = vec![
            file(10, key(b"a", 5), key(b"c", 5)),
            file(11, key(b"m", 5), key(b"o", 5)),
        ];
        let base = Arc::new(base);

        let mut edit = VersionEdit::new();
        edit.delete_file(1, 11);
        edit.add_file(1, 12, 2048, key(b"e", 4), key(b"g", 4));
        edit.add_file(2, 13, 2048, key(b"a", 3), key(b"z", 3));

        let mut compact_pointers: [Option<InternalKey>; NUM_LEVELS] = Default::default();
        let mut builder = VersionBuilder::new(icmp_value, base);
        builder.apply(&edit, &mut compact_pointers);

        let mut version = Version::new_empty(icmp(), cache);
        builder.save_to(&mut version);

        let level1: Vec<u64> = version.files[1].iter().map(|file| file.number()).collect();
        assert_eq!(level1, vec![10, 12]);
        let level2: Vec<u64> = version.files[2].iter().map(|file| file.number()).collect();
        assert_eq!(level2, vec![13]);
    }

    #[test]
    fn compact_pointers_travel_through_edits() {
        let mut edit = VersionEdit::new();
        edit.compact_pointers.push((3, key(b"pointer", 9)));

        let mut compact_pointers: [Option<InternalKey>; NUM_LEVELS] = Default::default();
        let icmp_value = icmp();
        let dir = tempfile::tempdir().unwrap();
        let opts = Arc::new(Options::default());
        let cache = TableCache::new(dir.path().to_path_buf(), &opts, icmp_value.clone());
        let base = Arc::new(Version::new_empty(icmp_value.clone(), cache));

        let mut builder = VersionBuilder::new(icmp_value, base);
        builder.apply(&edit, &mut compact_pointers);
        assert_eq!(
            compact_pointers[3].as_ref().map(|pointer| pointer.user_key().to_vec()),
            Some(b"pointer".to_vec()),
        );
    }
}
