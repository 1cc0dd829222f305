//! The database orchestrator: open/recover, the write path, the read path, and the background
//! compaction thread.

mod background;
mod open;
mod repair;
mod write;

pub use self::repair::{destroy_db, repair_db};


use std::collections::{HashSet, VecDeque};
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::thread::JoinHandle;

use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex};
use tracing::error;

use strata_sstable::{TableComparator as _, TableReadOptions};

use crate::batch::WriteBatch;
use crate::comparator::InternalKeyComparator;
use crate::config::NUM_LEVELS;
use crate::error::{Error, Result};
use crate::format::{InternalKey, LookupKey, SequenceNumber, EntryType};
use crate::iter::{DbIterator, InternalIter, IterPin, LevelIter, MergingIter};
use crate::memtable::Memtable;
use crate::options::{Options, ReadOptions, WriteOptions};
use crate::snapshot::{Snapshot, SnapshotList};
use crate::table_cache::TableCache;
use crate::version::{FileMetadata, VersionSet};
use crate::write_log::LogWriter;
use self::write::QueuedWriter;


/// Messages for the background thread.
pub(crate) enum BackgroundTask {
    Work,
    Exit,
}

/// A manual compaction request, worked through range-by-range by the background thread.
pub(crate) struct ManualCompaction {
    pub(crate) level: usize,
    /// `None` is an unbounded end.
    pub(crate) begin: Option<InternalKey>,
    pub(crate) end:   Option<InternalKey>,
    pub(crate) done:  bool,
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct CompactionStats {
    pub(crate) micros:        u64,
    pub(crate) bytes_read:    u64,
    pub(crate) bytes_written: u64,
}

/// Everything guarded by the primary mutex.
pub(crate) struct DbState {
    pub(crate) mem:             Memtable,
    pub(crate) imm:             Option<Memtable>,
    pub(crate) log:             Option<LogWriter<BufWriter<File>>>,
    pub(crate) log_file_number: u64,
    pub(crate) versions:        VersionSet,
    pub(crate) writers:         VecDeque<Arc<QueuedWriter>>,
    pub(crate) snapshots:       SnapshotList,
    /// Output files of in-flight flushes and compactions, protected from the obsolete-file
    /// sweep before any version references them.
    pub(crate) pending_outputs: HashSet<u64>,
    /// A write-ahead-log, manifest, or background failure. Once set, every subsequent write
    /// returns it; reads keep working against the in-memory state.
    pub(crate) bg_error:        Option<Error>,
    pub(crate) bg_scheduled:    bool,
    pub(crate) shutting_down:   bool,
    pub(crate) manual_compaction: Option<ManualCompaction>,
    /// A file whose seek budget ran out, waiting to be compacted.
    pub(crate) seek_compaction: Option<(usize, Arc<FileMetadata>)>,
    pub(crate) stats:           [CompactionStats; NUM_LEVELS],
}

pub(crate) struct DbInner {
    pub(crate) db_path:     PathBuf,
    pub(crate) opts:        Arc<Options>,
    pub(crate) icmp:        InternalKeyComparator,
    pub(crate) table_cache: TableCache,
    pub(crate) state:       Mutex<DbState>,
    /// Signalled when a background job finishes or the immutable memtable drains.
    pub(crate) background_finished: Condvar,
    /// Signalled when the writer queue advances.
    pub(crate) writers_cv:  Condvar,
    /// Mirror of `state.imm.is_some()`, readable without the mutex so a long compaction can
    /// notice a pending flush cheaply.
    pub(crate) has_imm:     AtomicBool,
    pub(crate) work_tx:     Sender<BackgroundTask>,
    /// Holds the advisory lock on the `LOCK` file for the life of the database.
    pub(crate) _lock_file:  File,
}

impl DbInner {
    /// Schedule background work if any is due and none is in flight.
    pub(crate) fn maybe_schedule_compaction(&self, state: &mut DbState) {
        if state.bg_scheduled || state.shutting_down || state.bg_error.is_some() {
            return;
        }

        let current = state.versions.current();
        let work_due = state.imm.is_some()
            || state.manual_compaction.is_some()
            || state.seek_compaction.is_some()
            || current.compaction_score >= 1.0;
        if !work_due {
            return;
        }

        state.bg_scheduled = true;
        if self.work_tx.send(BackgroundTask::Work).is_err() {
            // The background thread is gone; only possible during shutdown.
            state.bg_scheduled = false;
        }
    }

    pub(crate) fn record_background_error(&self, state: &mut DbState, error: &Error) {
        if state.bg_error.is_none() {
            error!(%error, "background error; database is read-only until reopened");
            state.bg_error = Some(error.clone());
        }
        self.background_finished.notify_all();
        self.writers_cv.notify_all();
    }
}

/// An embedded, ordered, persistent key → value store.
///
/// One `StrataDb` owns its database directory exclusively (an advisory file lock enforces
/// this). All methods take `&self`; the handle can be shared across threads directly or via
/// `Arc`.
#[derive(Debug)]
pub struct StrataDb {
    inner:      Arc<DbInner>,
    background: Option<JoinHandle<()>>,
}

impl StrataDb {
    /// Open (and, with [`Options::create_if_missing`], possibly create) the database rooted at
    /// `path`.
    pub fn open(path: impl Into<PathBuf>, options: Options) -> Result<Self> {
        open::open(path.into(), options)
    }

    /// The value most recently written under `key`, at the read options' snapshot. `Ok(None)`
    /// when the key is absent or deleted.
    pub fn get(&self, ropts: &ReadOptions, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let inner = &*self.inner;

        let state = inner.state.lock();
        let sequence = match &ropts.snapshot {
            Some(snapshot) => snapshot.sequence(),
            None => state.versions.last_sequence(),
        };
        let mem = state.mem.clone();
        let imm = state.imm.clone();
        let version = state.versions.current();
        drop(state);

        let lookup_key = LookupKey::new(key, sequence);

        // Newest tier first; a tombstone in a newer tier hides everything older.
        if let Some(found) = mem.get(&lookup_key) {
            return Ok(found);
        }
        if let Some(imm) = &imm {
            if let Some(found) = imm.get(&lookup_key) {
                return Ok(found);
            }
        }

        let result = version.get(table_read_options(ropts), &lookup_key)?;

        if let Some((level, file)) = result.seek_file {
            if file.record_seek() {
                let mut state = inner.state.lock();
                state.seek_compaction = Some((level, file));
                inner.maybe_schedule_compaction(&mut state);
            }
        }

        Ok(result.value.flatten())
    }

    /// Whether `key` is present at the read options' snapshot.
    pub fn has(&self, ropts: &ReadOptions, key: &[u8]) -> Result<bool> {
        Ok(self.get(ropts, key)?.is_some())
    }

    /// Write one `key → value` mapping.
    pub fn put(&self, wopts: &WriteOptions, key: &[u8], value: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(wopts, batch)
    }

    /// Remove `key`. Deleting an absent key is not an error.
    pub fn delete(&self, wopts: &WriteOptions, key: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(wopts, batch)
    }

    /// Apply a batch atomically: its entries receive consecutive sequence numbers and become
    /// durable together.
    pub fn write(&self, wopts: &WriteOptions, batch: WriteBatch) -> Result<()> {
        self.inner.write(wopts, Some(batch))
    }

    /// An iterator over the database at the read options' snapshot.
    pub fn new_iterator(&self, ropts: &ReadOptions) -> Result<DbIterator> {
        let inner = &*self.inner;

        let state = inner.state.lock();
        let sequence = match &ropts.snapshot {
            Some(snapshot) => snapshot.sequence(),
            None => state.versions.last_sequence(),
        };
        let mem = state.mem.clone();
        let imm = state.imm.clone();
        let version = state.versions.current();
        drop(state);

        let table_ropts = table_read_options(ropts);
        let mut children = Vec::new();
        children.push(InternalIter::Memtable(mem.iter()));
        if let Some(imm) = &imm {
            children.push(InternalIter::Memtable(imm.iter()));
        }
        // Level-0 files overlap, so each contributes its own cursor; deeper levels are
        // disjoint and share one concatenating cursor per level.
        for file in &version.files[0] {
            let table_iter = inner.table_cache.iter(table_ropts, file.number(), file.size())?;
            children.push(InternalIter::Table(Box::new(table_iter)));
        }
        for level in 1..NUM_LEVELS {
            if !version.files[level].is_empty() {
                children.push(InternalIter::Level(LevelIter::new(
                    inner.icmp.clone(),
                    inner.table_cache.clone(),
                    table_ropts,
                    version.files[level].clone(),
                )));
            }
        }

        let merged = MergingIter::new(inner.icmp.clone(), children);
        Ok(DbIterator::new(
            inner.icmp.clone(),
            merged,
            sequence,
            IterPin {
                _mem:     mem,
                _imm:     imm,
                _version: version,
            },
        ))
    }

    /// Pin the current state; reads through the returned snapshot see exactly the writes
    /// committed before this call. Dropping the handle releases the pin.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        let state = self.inner.state.lock();
        state.snapshots.acquire(state.versions.last_sequence())
    }

    /// Database introspection. Recognises `"leveldb.num-files-at-level<N>"`,
    /// `"leveldb.stats"`, `"leveldb.sstables"`, and `"leveldb.approximate-memory-usage"`.
    #[must_use]
    pub fn property(&self, name: &str) -> Option<String> {
        let state = self.inner.state.lock();

        if let Some(level) = name.strip_prefix("leveldb.num-files-at-level") {
            let level: usize = level.parse().ok()?;
            if level >= NUM_LEVELS {
                return None;
            }
            return Some(state.versions.current().num_files(level).to_string());
        }

        match name {
            "leveldb.stats" => {
                use std::fmt::Write as _;
                let mut stats = String::from(
                    "                               Compactions\n\
                     Level  Files Size(MB) Time(sec) Read(MB) Write(MB)\n\
                     --------------------------------------------------\n",
                );
                let current = state.versions.current();
                for level in 0..NUM_LEVELS {
                    let files = &current.files[level];
                    let level_stats = state.stats[level];
                    if !files.is_empty() || level_stats.micros > 0 {
                        let _infallible = writeln!(
                            stats,
                            "{:>5} {:>6} {:>8.0} {:>9.3} {:>8.1} {:>9.1}",
                            level,
                            files.len(),
                            crate::version::total_file_size(files) as f64 / 1_048_576.0,
                            level_stats.micros as f64 / 1e6,
                            level_stats.bytes_read as f64 / 1_048_576.0,
                            level_stats.bytes_written as f64 / 1_048_576.0,
                        );
                    }
                }
                Some(stats)
            }
            "leveldb.sstables" => Some(state.versions.current().sstables_string()),
            "leveldb.approximate-memory-usage" => {
                let mut usage = state.mem.approximate_memory_usage();
                if let Some(imm) = &state.imm {
                    usage += imm.approximate_memory_usage();
                }
                Some(usage.to_string())
            }
            _ => None,
        }
    }

    /// For each `[start, limit)` range, the approximate on-disk bytes the range occupies.
    /// Memtable contents are not counted.
    pub fn approximate_sizes(&self, ranges: &[(&[u8], &[u8])]) -> Result<Vec<u64>> {
        let version = {
            let state = self.inner.state.lock();
            state.versions.current()
        };

        ranges
            .iter()
            .map(|(start, limit)| {
                let start_key =
                    InternalKey::new(start, SequenceNumber::MAX, EntryType::SEEK);
                let limit_key =
                    InternalKey::new(limit, SequenceNumber::MAX, EntryType::SEEK);
                let start_offset = version.approximate_offset_of(&start_key)?;
                let limit_offset = version.approximate_offset_of(&limit_key)?;
                Ok(limit_offset.saturating_sub(start_offset))
            })
            .collect()
    }

    /// Compact the key range `[begin, end]` all the way down: the memtable is flushed, then
    /// every level holding overlapping data is compacted into the level below. `None` bounds
    /// are unbounded. Blocks until the work completes.
    pub fn compact_range(&self, begin: Option<&[u8]>, end: Option<&[u8]>) -> Result<()> {
        let inner = &*self.inner;

        let max_level_with_files = {
            let state = inner.state.lock();
            let current = state.versions.current();
            (1..NUM_LEVELS)
                .filter(|&level| current.overlap_in_level(level, begin, end))
                .max()
                .unwrap_or(1)
        };

        // Flush the memtable so in-memory data for the range participates.
        inner.write(&WriteOptions::default(), None)?;
        {
            let mut state = inner.state.lock();
            while state.imm.is_some() && state.bg_error.is_none() {
                inner.background_finished.wait(&mut state);
            }
            if let Some(error) = &state.bg_error {
                return Err(error.clone());
            }
        }

        for level in 0..max_level_with_files {
            self.manual_compact_level(level, begin, end)?;
        }
        Ok(())
    }

    fn manual_compact_level(
        &self,
        level: usize,
        begin: Option<&[u8]>,
        end:   Option<&[u8]>,
    ) -> Result<()> {
        let inner = &*self.inner;

        let mut state = inner.state.lock();
        // One manual compaction at a time; a concurrent caller waits its turn.
        while state.manual_compaction.is_some()
            && !state.shutting_down
            && state.bg_error.is_none()
        {
            inner.background_finished.wait(&mut state);
        }
        if let Some(error) = &state.bg_error {
            return Err(error.clone());
        }

        state.manual_compaction = Some(ManualCompaction {
            level,
            begin: begin
                .map(|key| InternalKey::new(key, SequenceNumber::MAX, EntryType::SEEK)),
            end: end
                .map(|key| InternalKey::new(key, SequenceNumber::ZERO, EntryType::Deletion)),
            done: false,
        });
        inner.maybe_schedule_compaction(&mut state);

        while state
            .manual_compaction
            .as_ref()
            .is_some_and(|manual| !manual.done)
            && !state.shutting_down
            && state.bg_error.is_none()
        {
            inner.background_finished.wait(&mut state);
        }
        state.manual_compaction = None;
        // Wake any caller queued behind this manual compaction.
        inner.background_finished.notify_all();

        if let Some(error) = &state.bg_error {
            return Err(error.clone());
        }
        Ok(())
    }
}

impl Drop for StrataDb {
    fn drop(&mut self) {
        {
            let mut state = self.inner.state.lock();
            state.shutting_down = true;
        }
        self.inner.writers_cv.notify_all();
        self.inner.background_finished.notify_all();
        let _disconnected = self.inner.work_tx.send(BackgroundTask::Exit);
        if let Some(background) = self.background.take() {
            let _already_panicked = background.join();
        }
    }
}

/// `ReadOptions` → the table layer's per-read options.
fn table_read_options(ropts: &ReadOptions) -> TableReadOptions {
    TableReadOptions {
        verify_checksums: ropts.verify_checksums,
        fill_cache:       ropts.fill_cache,
    }
}

impl std::fmt::Debug for DbInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbInner")
            .field("db_path", &self.db_path)
            .field("comparator", &self.icmp.user_comparator().name())
            .finish_non_exhaustive()
    }
}
