//! Opening a database: lock acquisition, manifest recovery, write-ahead-log replay, and the
//! hand-off to a running instance.

use std::collections::{HashSet, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use crossbeam_channel::unbounded;
use parking_lot::{Condvar, Mutex};
use tracing::{info, warn};

use strata_sstable::TableComparator as _;

use crate::batch::{BatchEntry, WriteBatch};
use crate::comparator::InternalKeyComparator;
use crate::error::{Error, ErrorKind, Result};
use crate::filenames::DbFileName;
use crate::format::{EntryType, SequenceNumber};
use crate::memtable::Memtable;
use crate::options::Options;
use crate::table_cache::TableCache;
use crate::version::{VersionEdit, VersionSet};
use crate::write_log::{CorruptionReporter, LogReader, LogWriter};
use super::background::{build_table, spawn_background_thread};
use super::{DbInner, DbState, StrataDb};


pub(super) fn open(db_path: PathBuf, options: Options) -> Result<StrataDb> {
    let opts = Arc::new(options);
    let icmp = InternalKeyComparator::new(Arc::clone(&opts.comparator));

    // The directory may or may not exist yet; `CURRENT` decides whether the database does.
    let _may_exist = fs::create_dir_all(&db_path);

    let lock_file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(DbFileName::Lockfile.path_in(&db_path))?;
    match fs4::fs_std::FileExt::try_lock_exclusive(&lock_file) {
        Ok(true) => {}
        Ok(false) => {
            return Err(Error {
                kind:    ErrorKind::Io,
                message: format!("database lock on {} is already held", db_path.display()),
            });
        }
        Err(error) => return Err(error.into()),
    }

    let table_cache = TableCache::new(db_path.clone(), &opts, icmp.clone());
    let mut versions = VersionSet::new(
        db_path.clone(),
        Arc::clone(&opts),
        icmp.clone(),
        table_cache.clone(),
    );

    let current_exists = DbFileName::Current.path_in(&db_path).exists();
    if !current_exists {
        if !opts.create_if_missing {
            return Err(Error::invalid_argument(format!(
                "database {} does not exist (create_if_missing is off)",
                db_path.display(),
            )));
        }
        VersionSet::create_new_db(&db_path, opts.comparator.name())?;
        info!(path = %db_path.display(), "created new database");
    } else if opts.error_if_exists {
        return Err(Error::invalid_argument(format!(
            "database {} already exists (error_if_exists is on)",
            db_path.display(),
        )));
    }

    versions.recover()?;

    // Replay every log the recovered version state still depends on, in write order.
    let min_log = versions.log_number();
    let prev_log = versions.prev_log_number();
    let mut log_numbers: Vec<u64> = Vec::new();
    for entry in fs::read_dir(&db_path)?.flatten() {
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else { continue };
        if let Some(DbFileName::Log(number)) = DbFileName::parse(file_name) {
            if number >= min_log || number == prev_log {
                log_numbers.push(number);
            }
        }
    }
    log_numbers.sort_unstable();

    let mut edit = VersionEdit::new();
    let mut max_sequence = SequenceNumber::ZERO;
    let mut mem: Option<Memtable> = None;
    let mut compactions = 0_usize;

    for &log_number in &log_numbers {
        compactions += replay_log(
            &db_path,
            &opts,
            &icmp,
            &table_cache,
            &mut versions,
            log_number,
            &mut edit,
            &mut mem,
            &mut max_sequence,
        )?;
        versions.mark_file_number_used(log_number);
    }

    // Either resume the final log in place, or flush what remains and start a fresh log.
    let mut reused_log = None;
    if opts.reuse_logs && compactions == 0 {
        if let Some(&last_log) = log_numbers.last() {
            let log_path = DbFileName::Log(last_log).path_in(&db_path);
            match OpenOptions::new().append(true).open(&log_path) {
                Ok(log_file) => {
                    let resume_at = log_file.metadata()?.len();
                    info!(log = last_log, offset = resume_at, "reusing write-ahead log");
                    reused_log = Some((
                        last_log,
                        LogWriter::new_with_offset(BufWriter::new(log_file), resume_at),
                    ));
                }
                Err(error) => {
                    warn!(log = last_log, %error, "could not reuse log; starting a new one");
                }
            }
        }
    }

    let (log_file_number, log_writer) = match reused_log {
        Some(reused) => reused,
        None => {
            // The recovered memtable's contents move to a level-0 table before the old logs
            // are retired.
            if let Some(recovered_mem) = mem.take() {
                let number = versions.new_file_number();
                if let Some((size, smallest, largest)) = build_table(
                    &db_path,
                    &opts,
                    &icmp,
                    &table_cache,
                    &recovered_mem,
                    number,
                )? {
                    edit.add_file(0, number, size, smallest, largest);
                } else {
                    versions.reuse_file_number(number);
                }
            }

            let number = versions.new_file_number();
            let log_file = File::create(DbFileName::Log(number).path_in(&db_path))?;
            (number, LogWriter::new_empty(BufWriter::new(log_file)))
        }
    };

    if max_sequence > versions.last_sequence() {
        versions.set_last_sequence(max_sequence);
    }

    edit.log_number = Some(log_file_number);
    edit.prev_log_number = Some(0);
    versions.log_and_apply(&mut edit)?;

    let state = DbState {
        mem: mem.unwrap_or_else(|| Memtable::new(icmp.clone())),
        imm: None,
        log: Some(log_writer),
        log_file_number,
        versions,
        writers: VecDeque::new(),
        snapshots: crate::snapshot::SnapshotList::new(),
        pending_outputs: HashSet::new(),
        bg_error: None,
        bg_scheduled: false,
        shutting_down: false,
        manual_compaction: None,
        seek_compaction: None,
        stats: Default::default(),
    };

    let (work_tx, work_rx) = unbounded();
    let inner = Arc::new(DbInner {
        db_path,
        opts,
        icmp,
        table_cache,
        state: Mutex::new(state),
        background_finished: Condvar::new(),
        writers_cv: Condvar::new(),
        has_imm: AtomicBool::new(false),
        work_tx,
        _lock_file: lock_file,
    });

    {
        let mut state = inner.state.lock();
        inner.remove_obsolete_files(&mut state);
        inner.maybe_schedule_compaction(&mut state);
    }

    let background = spawn_background_thread(Arc::clone(&inner), work_rx);
    Ok(StrataDb {
        inner,
        background: Some(background),
    })
}

struct RecoveryReporter {
    paranoid: bool,
    log_number: u64,
    first_error: Option<Error>,
}

impl CorruptionReporter for RecoveryReporter {
    fn corruption(&mut self, bytes: usize, reason: &str) {
        warn!(
            log = self.log_number,
            bytes, reason, "dropping corrupt region of write-ahead log",
        );
        if self.paranoid && self.first_error.is_none() {
            self.first_error = Some(Error::corruption(format!(
                "log {:06}: {reason} ({bytes} bytes dropped)",
                self.log_number,
            )));
        }
    }
}

/// Replay one log into the recovery memtable, flushing to level-0 tables whenever the
/// memtable fills. Returns how many flushes happened.
#[expect(clippy::too_many_arguments, reason = "recovery threads a lot of context")]
fn replay_log(
    db_path:      &Path,
    opts:         &Arc<Options>,
    icmp:         &InternalKeyComparator,
    table_cache:  &TableCache,
    versions:     &mut VersionSet,
    log_number:   u64,
    edit:         &mut VersionEdit,
    mem:          &mut Option<Memtable>,
    max_sequence: &mut SequenceNumber,
) -> Result<usize> {
    let log_path = DbFileName::Log(log_number).path_in(db_path);
    let log_file = File::open(&log_path)?;

    let mut reporter = RecoveryReporter {
        paranoid: opts.paranoid_checks,
        log_number,
        first_error: None,
    };
    let mut reader = LogReader::new(BufReader::new(log_file), true, 0);

    let mut compactions = 0;
    let mut record = Vec::new();
    while reader.read_record(&mut record, &mut reporter) {
        let batch = match WriteBatch::from_contents(record.clone()) {
            Ok(batch) => batch,
            Err(error) => {
                reporter.corruption(record.len(), &error.message);
                continue;
            }
        };

        let memtable = mem.get_or_insert_with(|| Memtable::new(icmp.clone()));
        apply_batch_to_memtable(&batch, memtable)?;

        let entry_count = u64::from(batch.count());
        if entry_count > 0 {
            let last_sequence = SequenceNumber::new_unchecked(
                batch.sequence().inner() + entry_count - 1,
            );
            if last_sequence > *max_sequence {
                *max_sequence = last_sequence;
            }
        }

        if memtable.approximate_memory_usage() > opts.write_buffer_size {
            compactions += 1;
            let number = versions.new_file_number();
            // Recovery runs single-threaded, so the flush always lands at level 0.
            if let Some((size, smallest, largest)) =
                build_table(db_path, opts, icmp, table_cache, memtable, number)?
            {
                edit.add_file(0, number, size, smallest, largest);
            } else {
                versions.reuse_file_number(number);
            }
            *mem = None;
        }
    }

    if let Some(error) = reporter.first_error {
        return Err(error);
    }
    Ok(compactions)
}

/// Insert a recovered batch at its recorded sequence numbers.
fn apply_batch_to_memtable(batch: &WriteBatch, memtable: &Memtable) -> Result<()> {
    let mut sequence = batch.sequence();

    batch.iterate(|entry| {
        match entry {
            BatchEntry::Value { key, value } => {
                memtable.add(sequence, EntryType::Value, key, value);
            }
            BatchEntry::Deletion { key } => {
                memtable.add(sequence, EntryType::Deletion, key, b"");
            }
        }
        sequence = sequence.checked_add(1)?;
        Ok(())
    })
}
