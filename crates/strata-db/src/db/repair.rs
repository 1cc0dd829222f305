//! Destroying a database, and the salvage path that rebuilds a usable manifest out of
//! whatever table and log files survive in a damaged directory.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use strata_sstable::{TableComparator as _, TableReadOptions};

use crate::batch::{BatchEntry, WriteBatch};
use crate::comparator::InternalKeyComparator;
use crate::error::{Error, ErrorKind, Result};
use crate::filenames::{DbFileName, set_current_file};
use crate::format::{EntryType, InternalKey, SequenceNumber, parse_internal_key};
use crate::memtable::Memtable;
use crate::options::Options;
use crate::table_cache::TableCache;
use crate::version::VersionEdit;
use crate::write_log::{CorruptionReporter, LogReader, LogWriter};
use super::background::build_table;


/// Delete the database rooted at `path`: every file the engine recognises, then the directory
/// itself if nothing else lives there. A missing directory is a success.
pub fn destroy_db(path: impl AsRef<Path>, _options: &Options) -> Result<()> {
    let db_path = path.as_ref();
    let entries = match fs::read_dir(db_path) {
        Ok(entries) => entries,
        Err(_missing) => return Ok(()),
    };

    let lock_path = DbFileName::Lockfile.path_in(db_path);
    let lock_file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)?;
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

    let mut result = Ok(());
    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else { continue };
        let Some(parsed) = DbFileName::parse(file_name) else { continue };
        if parsed == DbFileName::Lockfile {
            continue;
        }
        if let Err(error) = fs::remove_file(entry.path()) {
            if result.is_ok() {
                result = Err(error.into());
            }
        }
    }

    let _release = fs4::fs_std::FileExt::unlock(&lock_file);
    drop(lock_file);
    let _best_effort = fs::remove_file(&lock_path);
    let _only_if_empty = fs::remove_dir(db_path);
    result
}

struct LenientReporter;

impl CorruptionReporter for LenientReporter {
    fn corruption(&mut self, bytes: usize, reason: &str) {
        warn!(bytes, reason, "repair: skipping corrupt log region");
    }
}

struct SalvagedTable {
    number:       u64,
    size:         u64,
    smallest:     InternalKey,
    largest:      InternalKey,
    max_sequence: SequenceNumber,
}

/// Best-effort recovery of a damaged database: every readable log is rewritten as a table,
/// every readable table is kept, and a fresh manifest places them all at level 0 so normal
/// compaction re-sorts them. Entries that were deleted or overwritten may resurface; data that
/// was readable is not lost.
pub fn repair_db(path: impl AsRef<Path>, options: Options) -> Result<()> {
    let db_path = path.as_ref();
    let opts = Arc::new(options);
    let icmp = InternalKeyComparator::new(Arc::clone(&opts.comparator));
    let table_cache = TableCache::new(db_path.to_path_buf(), &opts, icmp.clone());

    let mut log_numbers = Vec::new();
    let mut table_numbers = Vec::new();
    let mut manifest_names = Vec::new();
    let mut max_number = 1;

    for entry in fs::read_dir(db_path)?.flatten() {
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else { continue };
        match DbFileName::parse(file_name) {
            Some(DbFileName::Log(number)) => {
                log_numbers.push(number);
                max_number = max_number.max(number);
            }
            Some(DbFileName::Table(number) | DbFileName::TableLegacy(number)) => {
                table_numbers.push(number);
                max_number = max_number.max(number);
            }
            Some(DbFileName::Manifest(number)) => {
                manifest_names.push(file_name.to_owned());
                max_number = max_number.max(number);
            }
            Some(DbFileName::Temp(number)) => {
                max_number = max_number.max(number);
                let _best_effort = fs::remove_file(entry.path());
            }
            _ => {}
        }
    }
    log_numbers.sort_unstable();
    table_numbers.sort_unstable();

    let mut next_file_number = max_number + 1;
    let mut salvaged: Vec<SalvagedTable> = Vec::new();

    // Rewrite each log as a level-0 table.
    for &log_number in &log_numbers {
        let table_number = next_file_number;
        next_file_number += 1;
        match convert_log_to_table(
            db_path,
            &opts,
            &icmp,
            &table_cache,
            log_number,
            table_number,
        ) {
            Ok(Some(table)) => {
                info!(log = log_number, table = table.number, "repair: converted log");
                salvaged.push(table);
                let _best_effort =
                    fs::remove_file(DbFileName::Log(log_number).path_in(db_path));
            }
            Ok(None) => {
                let _best_effort =
                    fs::remove_file(DbFileName::Log(log_number).path_in(db_path));
            }
            Err(error) => {
                warn!(log = log_number, %error, "repair: abandoning unreadable log");
            }
        }
    }

    // Keep every table whose contents still scan cleanly.
    for &table_number in &table_numbers {
        match scan_table(db_path, &table_cache, table_number) {
            Ok(table) => salvaged.push(table),
            Err(error) => {
                warn!(table = table_number, %error, "repair: dropping unreadable table");
                table_cache.evict(table_number);
            }
        }
    }

    // A fresh manifest referencing everything salvaged, at level 0.
    let mut edit = VersionEdit::new();
    edit.comparator_name = Some(opts.comparator.name().to_owned());
    edit.log_number = Some(0);
    let max_sequence = salvaged
        .iter()
        .map(|table| table.max_sequence)
        .max()
        .unwrap_or(SequenceNumber::ZERO);
    edit.last_sequence = Some(max_sequence);

    for table in &salvaged {
        edit.add_file(
            0,
            table.number,
            table.size,
            table.smallest.clone(),
            table.largest.clone(),
        );
    }

    let manifest_number = next_file_number;
    next_file_number += 1;
    edit.next_file_number = Some(next_file_number);

    let manifest_path = DbFileName::Manifest(manifest_number).path_in(db_path);
    let manifest_file = File::create(&manifest_path)?;
    let mut manifest_log = LogWriter::new_empty(BufWriter::new(manifest_file));
    let mut record = Vec::new();
    edit.encode(&mut record);
    manifest_log.add_record(&record)?;
    manifest_log.sync()?;
    set_current_file(db_path, manifest_number)?;

    // The replaced manifests are now dead.
    for manifest_name in manifest_names {
        if manifest_name != DbFileName::Manifest(manifest_number).file_name() {
            let _best_effort = fs::remove_file(db_path.join(manifest_name));
        }
    }

    info!(
        tables = salvaged.len(),
        last_sequence = max_sequence.inner(),
        "repair finished",
    );
    Ok(())
}

/// Replay one log (leniently) into a memtable and flush it as a table. `None` when the log
/// held no usable entries.
fn convert_log_to_table(
    db_path:      &Path,
    opts:         &Arc<Options>,
    icmp:         &InternalKeyComparator,
    table_cache:  &TableCache,
    log_number:   u64,
    table_number: u64,
) -> Result<Option<SalvagedTable>> {
    let log_file = File::open(DbFileName::Log(log_number).path_in(db_path))?;
    let mut reader = LogReader::new(BufReader::new(log_file), true, 0);
    let mut reporter = LenientReporter;

    let memtable = Memtable::new(icmp.clone());
    let mut max_sequence = SequenceNumber::ZERO;

    let mut record = Vec::new();
    while reader.read_record(&mut record, &mut reporter) {
        let Ok(batch) = WriteBatch::from_contents(record.clone()) else {
            reporter.corruption(record.len(), "unparsable write batch");
            continue;
        };

        let mut sequence = batch.sequence();
        let apply_result = batch.iterate(|entry| {
            match entry {
                BatchEntry::Value { key, value } => {
                    memtable.add(sequence, EntryType::Value, key, value);
                }
                BatchEntry::Deletion { key } => {
                    memtable.add(sequence, EntryType::Deletion, key, b"");
                }
            }
            if sequence > max_sequence {
                max_sequence = sequence;
            }
            sequence = sequence.checked_add(1)?;
            Ok(())
        });
        if apply_result.is_err() {
            reporter.corruption(record.len(), "write batch ended mid-entry");
        }
    }

    let Some((size, smallest, largest)) =
        build_table(db_path, opts, icmp, table_cache, &memtable, table_number)?
    else {
        return Ok(None);
    };

    Ok(Some(SalvagedTable {
        number: table_number,
        size,
        smallest,
        largest,
        max_sequence,
    }))
}

/// Fully scan one existing table, collecting its key range and newest sequence.
fn scan_table(
    db_path:      &Path,
    table_cache:  &TableCache,
    table_number: u64,
) -> Result<SalvagedTable> {
    let mut table_path = DbFileName::Table(table_number).path_in(db_path);
    if !table_path.exists() {
        table_path = DbFileName::TableLegacy(table_number).path_in(db_path);
    }
    let size = fs::metadata(&table_path)?.len();

    let mut iter = table_cache.iter(
        TableReadOptions {
            verify_checksums: true,
            fill_cache:       false,
        },
        table_number,
        size,
    )?;

    iter.seek_to_first();
    let mut smallest: Option<InternalKey> = None;
    let mut largest: Option<InternalKey> = None;
    let mut max_sequence = SequenceNumber::ZERO;
    let mut entries = 0_u64;

    while iter.valid() {
        let key = InternalKey::decode(iter.key())?;
        let parsed = parse_internal_key(key.encoded())?;
        if parsed.sequence > max_sequence {
            max_sequence = parsed.sequence;
        }
        if smallest.is_none() {
            smallest = Some(key.clone());
        }
        largest = Some(key);
        entries += 1;
        iter.next();
    }
    iter.status()?;

    let (Some(smallest), Some(largest)) = (smallest, largest) else {
        return Err(Error::corruption(format!(
            "table {table_number:06} holds no entries",
        )));
    };

    info!(table = table_number, entries, "repair: table scans cleanly");
    Ok(SalvagedTable {
        number: table_number,
        size,
        smallest,
        largest,
        max_sequence,
    })
}
