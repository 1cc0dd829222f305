//! The write path: a FIFO writer queue whose head commits a merged batch for the whole group,
//! with the primary mutex released around the log append and memtable insertion.

use std::fs::File;
use std::io::BufWriter;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};

use crate::batch::{BatchEntry, WriteBatch};
use crate::config::{
    L0_SLOWDOWN_WRITES_TRIGGER, L0_STOP_WRITES_TRIGGER, MAX_GROUPED_BATCH_SIZE,
    SMALL_BATCH_SIZE,
};
use crate::error::{Error, Result};
use crate::filenames::DbFileName;
use crate::format::EntryType;
use crate::memtable::Memtable;
use crate::options::WriteOptions;
use crate::write_log::LogWriter;
use super::{DbInner, DbState};


/// One queued write. `batch == None` requests a memtable flip without writing anything (used
/// by manual compaction to flush in-memory data).
pub(crate) struct QueuedWriter {
    batch:  Mutex<Option<WriteBatch>>,
    sync:   bool,
    done:   AtomicBool,
    result: Mutex<Option<Result<()>>>,
}

impl DbInner {
    pub(crate) fn write(&self, wopts: &WriteOptions, batch: Option<WriteBatch>) -> Result<()> {
        let flush_only = batch.is_none();
        let me = Arc::new(QueuedWriter {
            batch:  Mutex::new(batch),
            sync:   wopts.sync,
            done:   AtomicBool::new(false),
            result: Mutex::new(None),
        });

        let mut state = self.state.lock();
        if state.shutting_down {
            return Err(Error::invalid_argument("database is shutting down"));
        }
        state.writers.push_back(Arc::clone(&me));

        // Wait until an earlier queue head commits this write as part of its group, or until
        // this writer reaches the head of the queue itself.
        while !me.done.load(Ordering::Acquire)
            && !Arc::ptr_eq(state.writers.front().expect("queue holds this writer"), &me)
        {
            self.writers_cv.wait(&mut state);
        }
        if me.done.load(Ordering::Acquire) {
            return me.result.lock().take().expect("completed writers carry a result");
        }

        let (group_len, commit_result) = self.commit_group(&mut state, flush_only, wopts.sync);

        // Hand every covered writer its result and wake the next head.
        for _ in 0..group_len {
            let writer = state.writers.pop_front().expect("group writers are queued");
            if !Arc::ptr_eq(&writer, &me) {
                *writer.result.lock() = Some(commit_result.clone());
                writer.done.store(true, Ordering::Release);
            }
        }
        self.writers_cv.notify_all();
        self.maybe_schedule_compaction(&mut state);

        commit_result
    }

    /// Run by the queue head with the state lock held. Returns the number of queued writers
    /// the attempt covered (success or not, they all share the result) and the result itself.
    fn commit_group(
        &self,
        state:      &mut MutexGuard<'_, DbState>,
        flush_only: bool,
        sync:       bool,
    ) -> (usize, Result<()>) {
        if let Err(error) = self.make_room_for_write(state, flush_only) {
            return (1, Err(error));
        }

        if flush_only {
            return (1, Ok(()));
        }

        let (mut group_batch, group_len) = build_batch_group(&**state);

        let base_sequence = match state.versions.last_sequence().checked_add(1) {
            Ok(sequence) => sequence,
            Err(error) => return (group_len, Err(error)),
        };
        group_batch.set_sequence(base_sequence);
        let entry_count = u64::from(group_batch.count());
        if entry_count > 0 {
            let last_sequence =
                match state.versions.last_sequence().checked_add(entry_count) {
                    Ok(sequence) => sequence,
                    Err(error) => return (group_len, Err(error)),
                };
            state.versions.set_last_sequence(last_sequence);
        }

        let mem = state.mem.clone();
        let mut log = state.log.take().expect("an open database has a live log");

        // The heavy lifting happens with the mutex released. Only the queue head ever gets
        // here, so the log and the memtable still see one writer at a time.
        let write_result = MutexGuard::unlocked(state, || {
            append_and_apply(&mut log, sync, &group_batch, &mem)
        });

        state.log = Some(log);

        if let Err(error) = &write_result {
            // The log may hold a partial record, and the sequence space was consumed either
            // way; allowing further writes would let later records shadow the gap.
            self.record_background_error(state, error);
        }

        (group_len, write_result)
    }

    /// Ensure the memtable has room for the next write, applying backpressure along the way:
    /// a 1 ms pause as level 0 grows crowded, a hard wait when it is full or while a previous
    /// flush is still in flight, and a log/memtable switch when the buffer fills.
    fn make_room_for_write(
        &self,
        state: &mut MutexGuard<'_, DbState>,
        force: bool,
    ) -> Result<()> {
        let mut force = force;
        let mut allow_delay = !force;

        loop {
            if let Some(error) = &state.bg_error {
                return Err(error.clone());
            }

            if allow_delay
                && state.versions.current().num_files(0) >= L0_SLOWDOWN_WRITES_TRIGGER
            {
                // Yield a slice of the write budget to the compactor rather than stalling a
                // single write for seconds once level 0 is full.
                MutexGuard::unlocked(state, || {
                    std::thread::sleep(Duration::from_millis(1));
                });
                allow_delay = false;
                continue;
            }

            if !force
                && state.mem.approximate_memory_usage() <= self.opts.write_buffer_size
            {
                return Ok(());
            }

            if state.imm.is_some() {
                // The previous memtable is still being flushed; wait for the compactor.
                self.background_finished.wait(state);
                continue;
            }

            if state.versions.current().num_files(0) >= L0_STOP_WRITES_TRIGGER {
                self.background_finished.wait(state);
                continue;
            }

            // Switch to a fresh log file and memtable; the full memtable becomes immutable
            // and the compactor takes it from here.
            let new_log_number = state.versions.new_file_number();
            let log_path = DbFileName::Log(new_log_number).path_in(&self.db_path);
            let log_file = match File::create(&log_path) {
                Ok(file) => file,
                Err(error) => {
                    state.versions.reuse_file_number(new_log_number);
                    return Err(error.into());
                }
            };

            state.log = Some(LogWriter::new_empty(BufWriter::new(log_file)));
            state.log_file_number = new_log_number;
            let full_memtable =
                std::mem::replace(&mut state.mem, Memtable::new(self.icmp.clone()));
            state.imm = Some(full_memtable);
            self.has_imm.store(true, Ordering::Release);
            force = false;
            self.maybe_schedule_compaction(state);
        }
    }
}

/// Merge the queued writers' batches behind the head into one, stopping at the size cap and
/// before any sync write joins a non-sync group. Returns the merged batch and how many queue
/// entries it covers.
fn build_batch_group(state: &DbState) -> (WriteBatch, usize) {
    let head = state.writers.front().expect("the caller is the queue head");
    let head_sync = head.sync;
    let mut group_batch = head
        .batch
        .lock()
        .take()
        .expect("the queue head carries a batch");

    // A small write should not be held hostage by kilobytes of followers.
    let head_size = group_batch.approximate_size();
    let max_size = if head_size <= SMALL_BATCH_SIZE {
        head_size + SMALL_BATCH_SIZE
    } else {
        MAX_GROUPED_BATCH_SIZE
    };

    let mut group_len = 1;
    let mut group_size = head_size;
    for writer in state.writers.iter().skip(1) {
        if writer.sync && !head_sync {
            // A sync write must not be acknowledged off a non-sync commit.
            break;
        }
        let follower = writer.batch.lock();
        let Some(follower_batch) = follower.as_ref() else {
            // A flush request; it runs as its own queue head.
            break;
        };
        group_size += follower_batch.approximate_size();
        if group_size > max_size {
            break;
        }
        group_batch.append(follower_batch);
        group_len += 1;
    }

    (group_batch, group_len)
}

/// Append the group batch to the log (optionally syncing), then apply it to the memtable.
fn append_and_apply(
    log:   &mut LogWriter<BufWriter<File>>,
    sync:  bool,
    batch: &WriteBatch,
    mem:   &Memtable,
) -> Result<()> {
    log.add_record(batch.contents())?;
    if sync {
        log.sync()?;
    }

    let mut sequence = batch.sequence();
    batch.iterate(|entry| {
        match entry {
            BatchEntry::Value { key, value } => {
                mem.add(sequence, EntryType::Value, key, value);
            }
            BatchEntry::Deletion { key } => {
                mem.add(sequence, EntryType::Deletion, key, b"");
            }
        }
        sequence = sequence.checked_add(1)?;
        Ok(())
    })
}
