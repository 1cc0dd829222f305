//! The background thread: one job at a time, flushing the immutable memtable ahead of
//! everything else, then level compactions picked by size, seek, or manual request.

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use parking_lot::MutexGuard;
use tracing::{debug, info, warn};

use strata_sstable::{TableBuilder, TableComparator as _, TableReadOptions, WriteTableOptions};

use crate::comparator::InternalKeyComparator;
use crate::error::Result;
use crate::filenames::DbFileName;
use crate::filter::InternalFilterPolicy;
use crate::format::{EntryType, InternalKey, SequenceNumber, parse_internal_key};
use crate::iter::{InternalIter, LevelIter, MergingIter};
use crate::memtable::Memtable;
use crate::options::Options;
use crate::table_cache::TableCache;
use crate::version::{Compaction, Version, VersionEdit, total_file_size};
use super::{BackgroundTask, DbInner, DbState};


type DbTableBuilder = TableBuilder<InternalKeyComparator, InternalFilterPolicy, BufWriter<File>>;

/// One output file of an in-progress compaction.
struct CompactionOutput {
    number:   u64,
    size:     u64,
    smallest: Option<InternalKey>,
    largest:  Option<InternalKey>,
}

pub(super) fn background_thread_main(inner: Arc<DbInner>, work_rx: Receiver<BackgroundTask>) {
    for task in work_rx.iter() {
        match task {
            BackgroundTask::Exit => break,
            BackgroundTask::Work => {
                let mut state = inner.state.lock();
                if !state.shutting_down && state.bg_error.is_none() {
                    if let Err(error) = inner.background_compaction(&mut state) {
                        if state.shutting_down {
                            // Interrupted by close; nothing to record.
                        } else {
                            inner.record_background_error(&mut state, &error);
                            // Back off so a persistently failing disk does not spin the
                            // thread.
                            MutexGuard::unlocked(&mut state, || {
                                std::thread::sleep(Duration::from_secs(1));
                            });
                        }
                    }
                }
                state.bg_scheduled = false;
                inner.maybe_schedule_compaction(&mut state);
                drop(state);
                inner.background_finished.notify_all();
                inner.writers_cv.notify_all();
            }
        }
    }
}

impl DbInner {
    fn background_compaction(&self, state: &mut MutexGuard<'_, DbState>) -> Result<()> {
        if state.imm.is_some() {
            return self.compact_memtable(state);
        }

        let is_manual = state.manual_compaction.is_some();
        let mut manual_end: Option<InternalKey> = None;

        let compaction = if is_manual {
            let (level, begin, end) = {
                let manual = state
                    .manual_compaction
                    .as_ref()
                    .expect("checked above");
                (manual.level, manual.begin.clone(), manual.end.clone())
            };
            let compaction =
                state.versions.compact_range(level, begin.as_ref(), end.as_ref());
            match &compaction {
                Some(compaction) => {
                    manual_end = compaction.inputs[0]
                        .iter()
                        .map(|file| file.largest())
                        .max_by(|lhs, rhs| self.icmp.cmp(lhs.encoded(), rhs.encoded()))
                        .cloned();
                }
                None => {
                    state
                        .manual_compaction
                        .as_mut()
                        .expect("checked above")
                        .done = true;
                }
            }
            compaction
        } else if state.versions.current().compaction_score >= 1.0 {
            state.versions.pick_compaction(None)
        } else {
            let seek_candidate = state.seek_compaction.take();
            state.versions.pick_compaction(seek_candidate)
        };

        if let Some(mut compaction) = compaction {
            if !is_manual && compaction.is_trivial_move() {
                // The file has nothing to merge with; promote it by metadata edit alone.
                let file = Arc::clone(&compaction.inputs[0][0]);
                let level = compaction.level;
                let mut edit = std::mem::take(&mut compaction.edit);
                edit.delete_file(level, file.number());
                edit.add_file(
                    level + 1,
                    file.number(),
                    file.size(),
                    file.smallest().clone(),
                    file.largest().clone(),
                );
                state.versions.log_and_apply(&mut edit)?;
                debug!(
                    file = file.number(),
                    from_level = level,
                    size = file.size(),
                    "trivial move to next level",
                );
            } else {
                self.do_compaction_work(state, compaction)?;
                self.remove_obsolete_files(state);
            }
        }

        if is_manual {
            let manual = state
                .manual_compaction
                .as_mut()
                .expect("manual compaction in progress");
            if !manual.done {
                // Only part of the range was compacted; resume after the last key covered.
                manual.begin = manual_end;
            }
        }
        Ok(())
    }

    /// Flush the immutable memtable into a table file and retire its log.
    pub(super) fn compact_memtable(&self, state: &mut MutexGuard<'_, DbState>) -> Result<()> {
        let imm = state.imm.clone().expect("compact_memtable requires an immutable memtable");
        let start = Instant::now();

        let base = state.versions.current();
        let mut edit = VersionEdit::new();
        let Some((level, number, size, smallest, largest)) =
            self.write_level0_table(state, &imm, Some(&base))?
        else {
            // An empty memtable still retires its log below.
            return self.finish_memtable_compaction(state, VersionEdit::new(), start, 0, 0);
        };

        edit.add_file(level, number, size, smallest, largest);
        self.finish_memtable_compaction(state, edit, start, level, size)
    }

    fn finish_memtable_compaction(
        &self,
        state: &mut MutexGuard<'_, DbState>,
        mut edit: VersionEdit,
        start: Instant,
        level: usize,
        bytes_written: u64,
    ) -> Result<()> {
        // The flushed data is durable in the new table; the log that covered it, and any
        // older one, can go.
        edit.prev_log_number = Some(0);
        edit.log_number = Some(state.log_file_number);
        state.versions.log_and_apply(&mut edit)?;

        state.imm = None;
        self.has_imm.store(false, Ordering::Release);
        self.background_finished.notify_all();
        self.remove_obsolete_files(state);

        let stats = &mut state.stats[level];
        stats.micros += start.elapsed().as_micros() as u64;
        stats.bytes_written += bytes_written;
        Ok(())
    }

    /// Build a table from a memtable's contents, with the lock released during the build.
    /// Returns `None` when the memtable was empty.
    pub(super) fn write_level0_table(
        &self,
        state: &mut MutexGuard<'_, DbState>,
        mem:   &Memtable,
        base:  Option<&Version>,
    ) -> Result<Option<(usize, u64, u64, InternalKey, InternalKey)>> {
        let number = state.versions.new_file_number();
        state.pending_outputs.insert(number);

        let build_result = MutexGuard::unlocked(state, || {
            build_table(&self.db_path, &self.opts, &self.icmp, &self.table_cache, mem, number)
        });
        state.pending_outputs.remove(&number);

        match build_result {
            Ok(Some((size, smallest, largest))) => {
                let level = match base {
                    Some(base) => base.pick_level_for_memtable_output(
                        smallest.user_key(),
                        largest.user_key(),
                        self.opts.max_file_size,
                    ),
                    None => 0,
                };
                info!(
                    file = number,
                    level,
                    size,
                    entries_bytes = mem.approximate_memory_usage(),
                    "flushed memtable to table file",
                );
                Ok(Some((level, number, size, smallest, largest)))
            }
            Ok(None) => {
                state.versions.reuse_file_number(number);
                Ok(None)
            }
            Err(error) => {
                let _best_effort =
                    fs::remove_file(DbFileName::Table(number).path_in(&self.db_path));
                Err(error)
            }
        }
    }

    fn do_compaction_work(
        &self,
        state:          &mut MutexGuard<'_, DbState>,
        mut compaction: Compaction,
    ) -> Result<()> {
        let start = Instant::now();
        // Entries at or below this sequence that are shadowed (or are tombstones with nothing
        // underneath) can be dropped without changing what any live snapshot observes.
        let smallest_snapshot = state
            .snapshots
            .oldest()
            .unwrap_or_else(|| state.versions.last_sequence());

        info!(
            level = compaction.level,
            level_files = compaction.inputs[0].len(),
            parent_files = compaction.inputs[1].len(),
            "compacting",
        );

        let (outputs, merge_result) = MutexGuard::unlocked(state, || {
            self.run_compaction_merge(&mut compaction, smallest_snapshot)
        });

        if let Err(error) = merge_result {
            for output in &outputs {
                state.pending_outputs.remove(&output.number);
                let _best_effort =
                    fs::remove_file(DbFileName::Table(output.number).path_in(&self.db_path));
            }
            return Err(error);
        }

        let bytes_read = total_file_size(&compaction.inputs[0])
            + total_file_size(&compaction.inputs[1]);
        let bytes_written = outputs.iter().map(|output| output.size).sum::<u64>();

        // Install: one edit deleting the inputs and adding every output.
        compaction.add_input_deletions();
        let output_level = compaction.level + 1;
        for output in &outputs {
            compaction.edit.add_file(
                output_level,
                output.number,
                output.size,
                output.smallest.clone().expect("finished outputs hold entries"),
                output.largest.clone().expect("finished outputs hold entries"),
            );
        }

        let mut edit = std::mem::take(&mut compaction.edit);
        let apply_result = state.versions.log_and_apply(&mut edit);
        for output in &outputs {
            state.pending_outputs.remove(&output.number);
        }
        apply_result?;

        let stats = &mut state.stats[output_level];
        stats.micros += start.elapsed().as_micros() as u64;
        stats.bytes_read += bytes_read;
        stats.bytes_written += bytes_written;

        info!(
            level = compaction.level,
            output_files = outputs.len(),
            bytes_read,
            bytes_written,
            "compaction finished",
        );
        Ok(())
    }

    /// The merge itself, run with the primary mutex released. Returns whatever outputs were
    /// produced (even on failure, so the caller can delete them) alongside the result.
    fn run_compaction_merge(
        &self,
        compaction:        &mut Compaction,
        smallest_snapshot: SequenceNumber,
    ) -> (Vec<CompactionOutput>, Result<()>) {
        let mut outputs: Vec<CompactionOutput> = Vec::new();
        let mut builder: Option<(CompactionOutput, DbTableBuilder)> = None;

        let result = (|| -> Result<()> {
            let mut input = self.make_input_iterator(compaction)?;
            input.seek_to_first();

            let mut current_user_key: Option<Vec<u8>> = None;
            let mut last_sequence_for_key = SequenceNumber::MAX;

            while input.valid() {
                // An arriving memtable flush takes priority over compaction work: writers
                // block behind it.
                if self.has_imm.load(Ordering::Acquire) {
                    let mut state = self.state.lock();
                    if state.imm.is_some() {
                        self.compact_memtable(&mut state)?;
                    }
                }

                let key = input.key().to_vec();

                if builder.is_some() && compaction.should_stop_before(&key) {
                    Self::finish_compaction_output(
                        &self.table_cache,
                        &mut builder,
                        &mut outputs,
                    )?;
                }

                let mut drop_entry = false;
                match parse_internal_key(&key) {
                    Err(_malformed) => {
                        // Keep corrupt keys so they surface to reads instead of silently
                        // vanishing.
                        current_user_key = None;
                        last_sequence_for_key = SequenceNumber::MAX;
                    }
                    Ok(parsed) => {
                        let first_occurrence = current_user_key
                            .as_deref()
                            .map_or(true, |current| {
                                self.icmp.cmp_user(parsed.user_key, current).is_ne()
                            });
                        if first_occurrence {
                            current_user_key = Some(parsed.user_key.to_vec());
                            last_sequence_for_key = SequenceNumber::MAX;
                        }

                        if last_sequence_for_key <= smallest_snapshot {
                            // Shadowed by a newer entry that itself is visible to every
                            // snapshot.
                            drop_entry = true;
                        } else if parsed.entry_type == EntryType::Deletion
                            && parsed.sequence <= smallest_snapshot
                            && compaction.is_base_level_for_key(parsed.user_key)
                        {
                            // A tombstone with no snapshot that needs it and nothing left
                            // underneath to delete.
                            drop_entry = true;
                        }
                        last_sequence_for_key = parsed.sequence;
                    }
                }

                if !drop_entry {
                    if builder.is_none() {
                        builder = Some(self.open_compaction_output()?);
                    }
                    let (output, table_builder) =
                        builder.as_mut().expect("just ensured above");

                    if output.smallest.is_none() {
                        output.smallest = Some(InternalKey::decode(&key)?);
                    }
                    output.largest = Some(InternalKey::decode(&key)?);
                    table_builder.add_entry(&key, input.value())?;

                    if table_builder.estimated_file_size() >= compaction.max_output_file_size()
                    {
                        Self::finish_compaction_output(
                            &self.table_cache,
                            &mut builder,
                            &mut outputs,
                        )?;
                    }
                }

                input.next();
            }

            input.status()?;
            if builder.is_some() {
                Self::finish_compaction_output(&self.table_cache, &mut builder, &mut outputs)?;
            }
            Ok(())
        })();

        // An unfinished builder's file is partial; report it with the outputs for deletion.
        if let Some((output, _unfinished_builder)) = builder {
            outputs.push(output);
        }

        (outputs, result)
    }

    fn make_input_iterator(&self, compaction: &Compaction) -> Result<MergingIter> {
        let ropts = TableReadOptions {
            verify_checksums: self.opts.paranoid_checks,
            // Compaction reads every input once; caching them would only evict hot blocks.
            fill_cache: false,
        };

        let mut children = Vec::new();
        if compaction.level == 0 {
            for file in &compaction.inputs[0] {
                let table_iter =
                    self.table_cache.iter(ropts, file.number(), file.size())?;
                children.push(InternalIter::Table(Box::new(table_iter)));
            }
        } else {
            children.push(InternalIter::Level(LevelIter::new(
                self.icmp.clone(),
                self.table_cache.clone(),
                ropts,
                compaction.inputs[0].clone(),
            )));
        }
        if !compaction.inputs[1].is_empty() {
            children.push(InternalIter::Level(LevelIter::new(
                self.icmp.clone(),
                self.table_cache.clone(),
                ropts,
                compaction.inputs[1].clone(),
            )));
        }

        Ok(MergingIter::new(self.icmp.clone(), children))
    }

    fn open_compaction_output(&self) -> Result<(CompactionOutput, DbTableBuilder)> {
        let number = {
            let mut state = self.state.lock();
            let number = state.versions.new_file_number();
            state.pending_outputs.insert(number);
            number
        };

        let path = DbFileName::Table(number).path_in(&self.db_path);
        let file = File::create(&path)?;
        let table_builder = TableBuilder::new(
            write_table_options(&self.opts, &self.icmp),
            BufWriter::new(file),
        );

        Ok((
            CompactionOutput {
                number,
                size: 0,
                smallest: None,
                largest: None,
            },
            table_builder,
        ))
    }

    fn finish_compaction_output(
        table_cache: &TableCache,
        builder:     &mut Option<(CompactionOutput, DbTableBuilder)>,
        outputs:     &mut Vec<CompactionOutput>,
    ) -> Result<()> {
        let (mut output, table_builder) = builder.take().expect("an output is in progress");
        let entries = table_builder.num_entries();
        output.size = table_builder.finish(true)?;

        debug_assert!(entries > 0, "outputs are only opened when an entry survives");
        // Make sure the file is actually usable before the edit that publishes it.
        table_cache.get_table(output.number, output.size)?;
        outputs.push(output);
        Ok(())
    }

    /// Delete every file in the directory that no live version, pending output, or current
    /// log/manifest accounts for.
    pub(super) fn remove_obsolete_files(&self, state: &mut MutexGuard<'_, DbState>) {
        if state.bg_error.is_some() {
            // After a background error the true set of live files is uncertain; leave
            // everything in place.
            return;
        }

        let mut live = state.versions.live_files();
        live.extend(state.pending_outputs.iter().copied());
        let log_number = state.versions.log_number();
        let prev_log_number = state.versions.prev_log_number();
        let manifest_number = state.versions.manifest_file_number();

        let entries = match fs::read_dir(&self.db_path) {
            Ok(entries) => entries,
            Err(error) => {
                warn!(%error, "could not scan database directory for obsolete files");
                return;
            }
        };

        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else { continue };
            let Some(parsed) = DbFileName::parse(file_name) else { continue };

            let keep = match parsed {
                DbFileName::Log(number) => number >= log_number || number == prev_log_number,
                DbFileName::Manifest(number) => number >= manifest_number,
                DbFileName::Table(number) | DbFileName::TableLegacy(number) => {
                    live.contains(&number)
                }
                DbFileName::Temp(number) => state.pending_outputs.contains(&number),
                DbFileName::Current
                | DbFileName::Lockfile
                | DbFileName::InfoLog
                | DbFileName::OldInfoLog => true,
            };

            if !keep {
                if let DbFileName::Table(number) | DbFileName::TableLegacy(number) = parsed {
                    self.table_cache.evict(number);
                }
                debug!(file = file_name, "removing obsolete file");
                let _best_effort = fs::remove_file(entry.path());
            }
        }
    }
}

pub(super) fn spawn_background_thread(
    inner:   Arc<DbInner>,
    work_rx: Receiver<BackgroundTask>,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("strata-db-compact".to_owned())
        .spawn(move || background_thread_main(inner, work_rx))
        .expect("spawning the compaction thread")
}

pub(super) fn write_table_options(
    opts: &Options,
    icmp: &InternalKeyComparator,
) -> WriteTableOptions<InternalKeyComparator, InternalFilterPolicy> {
    WriteTableOptions {
        comparator:             icmp.clone(),
        compression:            opts.compression,
        block_size:             opts.block_size,
        block_restart_interval: opts.block_restart_interval,
        filter_policy:          opts.filter_policy.clone().map(InternalFilterPolicy::new),
    }
}

/// Write a memtable's entire contents as one table file. Returns `None` (writing nothing) for
/// an empty memtable.
pub(super) fn build_table(
    db_path:     &Path,
    opts:        &Options,
    icmp:        &InternalKeyComparator,
    table_cache: &TableCache,
    mem:         &Memtable,
    number:      u64,
) -> Result<Option<(u64, InternalKey, InternalKey)>> {
    let mut iter = mem.iter();
    iter.seek_to_first();
    if !iter.valid() {
        return Ok(None);
    }

    let path = DbFileName::Table(number).path_in(db_path);
    let result = (|| {
        let file = File::create(&path)?;
        let mut builder = TableBuilder::new(write_table_options(opts, icmp), BufWriter::new(file));

        let smallest = InternalKey::decode(iter.key())?;
        let mut largest = smallest.clone();
        while iter.valid() {
            largest = InternalKey::decode(iter.key())?;
            builder.add_entry(iter.key(), iter.value())?;
            let _more = iter.next();
        }

        let size = builder.finish(true)?;
        // Confirm the new table opens and parses before anything references it.
        table_cache.get_table(number, size)?;
        Ok(Some((size, smallest, largest)))
    })();

    if result.is_err() {
        let _best_effort = fs::remove_file(&path);
    }
    result
}
