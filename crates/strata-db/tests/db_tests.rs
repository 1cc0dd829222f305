//! End-to-end tests driving a real database directory.

use std::cmp::Ordering;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::time::Duration;

use tempfile::TempDir;

use strata_db::{
    BloomFilterPolicy, Comparator, ErrorKind, FilterPolicy, Options, ReadOptions, StrataDb,
    WriteBatch, WriteOptions,
};


fn test_options() -> Options {
    let mut options = Options::default();
    options.create_if_missing = true;
    options
}

fn open_db(dir: &TempDir, options: Options) -> StrataDb {
    StrataDb::open(dir.path(), options).expect("open database")
}

fn get(db: &StrataDb, key: &[u8]) -> Option<Vec<u8>> {
    db.get(&ReadOptions::default(), key).expect("get")
}

fn put(db: &StrataDb, key: &[u8], value: &[u8]) {
    db.put(&WriteOptions::default(), key, value).expect("put");
}

fn delete(db: &StrataDb, key: &[u8]) {
    db.delete(&WriteOptions::default(), key).expect("delete");
}

fn scan_all(db: &StrataDb) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut iter = db.new_iterator(&ReadOptions::default()).expect("iterator");
    iter.seek_to_first();
    let mut entries = Vec::new();
    while iter.valid() {
        entries.push((iter.key().to_vec(), iter.value().to_vec()));
        iter.next();
    }
    iter.status().expect("scan status");
    entries
}

#[test]
fn put_get_delete_basics() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir, test_options());

    assert_eq!(get(&db, b"foo"), None);

    put(&db, b"foo", b"v1");
    assert_eq!(get(&db, b"foo"), Some(b"v1".to_vec()));

    put(&db, b"foo", b"v2");
    assert_eq!(get(&db, b"foo"), Some(b"v2".to_vec()));

    delete(&db, b"foo");
    assert_eq!(get(&db, b"foo"), None);
    assert!(!db.has(&ReadOptions::default(), b"foo").unwrap());

    // Deleting an absent key is fine.
    delete(&db, b"never-existed");
}

#[test]
fn snapshot_isolation() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir, test_options());

    put(&db, b"k", b"a");
    let snapshot = db.snapshot();
    put(&db, b"k", b"b");

    let mut at_snapshot = ReadOptions::default();
    at_snapshot.snapshot = Some(snapshot);
    assert_eq!(db.get(&at_snapshot, b"k").unwrap(), Some(b"a".to_vec()));
    assert_eq!(get(&db, b"k"), Some(b"b".to_vec()));

    drop(at_snapshot);
    assert_eq!(get(&db, b"k"), Some(b"b".to_vec()));
}

#[test]
fn snapshot_sees_through_deletions() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir, test_options());

    put(&db, b"k", b"kept");
    let snapshot = db.snapshot();
    delete(&db, b"k");

    assert_eq!(get(&db, b"k"), None);
    let mut at_snapshot = ReadOptions::default();
    at_snapshot.snapshot = Some(snapshot);
    assert_eq!(db.get(&at_snapshot, b"k").unwrap(), Some(b"kept".to_vec()));
}

#[test]
fn batches_apply_atomically_and_in_order() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir, test_options());

    put(&db, b"b", b"will-be-deleted");

    let mut batch = WriteBatch::new();
    batch.put(b"a", b"1");
    batch.delete(b"b");
    batch.put(b"c", b"3");
    db.write(&WriteOptions::default(), batch).unwrap();

    assert_eq!(
        scan_all(&db),
        vec![(b"a".to_vec(), b"1".to_vec()), (b"c".to_vec(), b"3".to_vec())],
    );
    assert!(!db.has(&ReadOptions::default(), b"b").unwrap());

    // A batch's own later entries win over its earlier ones.
    let mut batch = WriteBatch::new();
    batch.put(b"dup", b"first");
    batch.put(b"dup", b"second");
    db.write(&WriteOptions::default(), batch).unwrap();
    assert_eq!(get(&db, b"dup"), Some(b"second".to_vec()));

    // Empty batches are legal.
    db.write(&WriteOptions::default(), WriteBatch::new()).unwrap();
}

#[test]
fn writes_survive_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let db = open_db(&dir, test_options());
        put(&db, b"x", b"y");
    }
    {
        // Replayed from the write-ahead log; nothing was flushed.
        let db = open_db(&dir, test_options());
        assert_eq!(get(&db, b"x"), Some(b"y".to_vec()));
        put(&db, b"x", b"z");
    }
    {
        let db = open_db(&dir, test_options());
        assert_eq!(get(&db, b"x"), Some(b"z".to_vec()));
    }
}

#[test]
fn recovery_keeps_only_the_newest_value() {
    let dir = TempDir::new().unwrap();
    {
        let db = open_db(&dir, test_options());
        put(&db, b"key", b"older");
        put(&db, b"key", b"newer");
        delete(&db, b"gone");
        put(&db, b"gone", b"back");
    }
    let db = open_db(&dir, test_options());
    assert_eq!(get(&db, b"key"), Some(b"newer".to_vec()));
    assert_eq!(get(&db, b"gone"), Some(b"back".to_vec()));
}

#[test]
fn reopen_after_flushes_recovers_tables_and_log() {
    let dir = TempDir::new().unwrap();
    let mut options = test_options();
    options.write_buffer_size = 64 << 10;

    let value = vec![b'v'; 512];
    {
        let db = open_db(&dir, options.clone());
        for index in 0..1_000_u32 {
            put(&db, format!("key{index:05}").as_bytes(), &value);
        }
    }
    {
        let db = open_db(&dir, options);
        for index in 0..1_000_u32 {
            assert_eq!(
                get(&db, format!("key{index:05}").as_bytes()),
                Some(value.clone()),
                "key{index:05}",
            );
        }
    }
}

#[test]
fn compaction_preserves_live_keys_and_drops_deleted_ones() {
    let dir = TempDir::new().unwrap();
    let mut options = test_options();
    options.write_buffer_size = 100 << 10;
    options.max_file_size = 128 << 10;

    let db = open_db(&dir, options);
    let value = vec![b'x'; 1_000];

    // About 2 MiB of distinct keys, forcing many memtable flushes.
    for index in 0..2_000_u32 {
        put(&db, format!("key{index:06}").as_bytes(), &value);
    }
    // Delete every even key.
    for index in (0..2_000_u32).step_by(2) {
        delete(&db, format!("key{index:06}").as_bytes());
    }

    db.compact_range(None, None).unwrap();

    let files_below_level0: usize = (1..7)
        .map(|level| {
            db.property(&format!("leveldb.num-files-at-level{level}"))
                .unwrap()
                .parse::<usize>()
                .unwrap()
        })
        .sum();
    assert!(files_below_level0 > 0, "compaction moved nothing below level 0");

    for index in 0..2_000_u32 {
        let key = format!("key{index:06}");
        let found = get(&db, key.as_bytes());
        if index % 2 == 0 {
            assert_eq!(found, None, "{key} should be deleted");
        } else {
            assert_eq!(found, Some(value.clone()), "{key} should survive");
        }
    }
}

#[test]
fn compaction_respects_snapshots() {
    let dir = TempDir::new().unwrap();
    let mut options = test_options();
    options.write_buffer_size = 64 << 10;

    let db = open_db(&dir, options);
    put(&db, b"pinned", b"old-value");
    let snapshot = db.snapshot();

    delete(&db, b"pinned");
    // Churn enough data to force flushes and compactions past the tombstone.
    let filler = vec![b'f'; 1_000];
    for index in 0..500_u32 {
        put(&db, format!("filler{index:04}").as_bytes(), &filler);
    }
    db.compact_range(None, None).unwrap();

    assert_eq!(get(&db, b"pinned"), None);
    let mut at_snapshot = ReadOptions::default();
    at_snapshot.snapshot = Some(snapshot);
    assert_eq!(
        db.get(&at_snapshot, b"pinned").unwrap(),
        Some(b"old-value".to_vec()),
    );
}

#[test]
fn iterators_merge_all_tiers_in_order() {
    let dir = TempDir::new().unwrap();
    let mut options = test_options();
    options.write_buffer_size = 64 << 10;
    let db = open_db(&dir, options);

    let value = vec![b'v'; 512];
    for index in (0..600_u32).rev() {
        put(&db, format!("key{index:04}").as_bytes(), &value);
    }
    // Overwrites and deletions scattered across tiers.
    put(&db, b"key0000", b"overwritten");
    delete(&db, b"key0001");

    let entries = scan_all(&db);
    assert_eq!(entries.len(), 599);
    assert_eq!(entries[0].0, b"key0000");
    assert_eq!(entries[0].1, b"overwritten");
    assert_eq!(entries[1].0, b"key0002");
    for pair in entries.windows(2) {
        assert!(pair[0].0 < pair[1].0, "iterator out of order");
    }
}

#[test]
fn iterator_seek_and_prev() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir, test_options());

    for key in [b"a".as_slice(), b"c", b"e", b"g"] {
        put(&db, key, key);
    }
    delete(&db, b"e");

    let mut iter = db.new_iterator(&ReadOptions::default()).unwrap();

    iter.seek(b"b");
    assert!(iter.valid());
    assert_eq!(iter.key(), b"c");

    // "e" is deleted, so seeking at it lands on "g".
    iter.seek(b"d");
    assert_eq!(iter.key(), b"g");

    assert!(iter.prev());
    assert_eq!(iter.key(), b"c");
    assert!(iter.prev());
    assert_eq!(iter.key(), b"a");
    assert!(!iter.prev());
    assert!(!iter.valid());

    iter.seek_to_last();
    assert_eq!(iter.key(), b"g");
}

#[test]
fn iterators_are_stable_against_later_writes() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir, test_options());

    put(&db, b"a", b"1");
    put(&db, b"b", b"2");

    let mut iter = db.new_iterator(&ReadOptions::default()).unwrap();
    put(&db, b"c", b"3");
    delete(&db, b"a");

    iter.seek_to_first();
    let mut keys = Vec::new();
    while iter.valid() {
        keys.push(iter.key().to_vec());
        iter.next();
    }
    // The iterator's sequence was pinned at creation time.
    assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec()]);
}

#[test]
fn concurrent_writers_all_commit() {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(open_db(&dir, test_options()));

    let mut handles = Vec::new();
    for writer in 0..8_u32 {
        let db = Arc::clone(&db);
        handles.push(std::thread::spawn(move || {
            for index in 0..250_u32 {
                let key = format!("w{writer:02}-{index:04}");
                db.put(&WriteOptions::default(), key.as_bytes(), key.as_bytes())
                    .expect("concurrent put");
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    for writer in 0..8_u32 {
        for index in 0..250_u32 {
            let key = format!("w{writer:02}-{index:04}");
            assert_eq!(get(&db, key.as_bytes()), Some(key.clone().into_bytes()), "{key}");
        }
    }
}

#[test]
fn sync_writes_are_accepted() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir, test_options());

    let wopts = WriteOptions { sync: true };
    db.put(&wopts, b"durable", b"yes").unwrap();
    assert_eq!(get(&db, b"durable"), Some(b"yes".to_vec()));
}

#[test]
fn reuse_logs_resumes_the_last_log() {
    let dir = TempDir::new().unwrap();
    let mut options = test_options();
    options.reuse_logs = true;

    {
        let db = open_db(&dir, options.clone());
        put(&db, b"first", b"1");
    }
    {
        let db = open_db(&dir, options.clone());
        assert_eq!(get(&db, b"first"), Some(b"1".to_vec()));
        put(&db, b"second", b"2");
    }
    {
        let db = open_db(&dir, options);
        assert_eq!(get(&db, b"first"), Some(b"1".to_vec()));
        assert_eq!(get(&db, b"second"), Some(b"2".to_vec()));
    }
}

#[test]
fn missing_database_requires_create_if_missing() {
    let dir = TempDir::new().unwrap();
    let result = StrataDb::open(dir.path().join("no-such-db"), Options::default());
    assert_eq!(result.unwrap_err().kind, ErrorKind::InvalidArgument);
}

#[test]
fn error_if_exists_rejects_existing_databases() {
    let dir = TempDir::new().unwrap();
    {
        let _db = open_db(&dir, test_options());
    }
    let mut options = test_options();
    options.error_if_exists = true;
    let result = StrataDb::open(dir.path(), options);
    assert_eq!(result.unwrap_err().kind, ErrorKind::InvalidArgument);
}

#[test]
fn second_open_is_locked_out() {
    let dir = TempDir::new().unwrap();
    let _db = open_db(&dir, test_options());

    let result = StrataDb::open(dir.path(), test_options());
    assert_eq!(result.unwrap_err().kind, ErrorKind::Io);
}

/// Reverses the bytewise order; used to prove comparator-name checking.
#[derive(Debug, Default, Clone, Copy)]
struct ReverseComparator;

impl Comparator for ReverseComparator {
    fn name(&self) -> &'static str {
        "test.ReverseComparator"
    }

    fn cmp(&self, lhs: &[u8], rhs: &[u8]) -> Ordering {
        rhs.cmp(lhs)
    }

    fn find_short_separator(&self, from: &[u8], _to: &[u8], output: &mut Vec<u8>) {
        output.clear();
        output.extend(from);
    }

    fn find_short_successor(&self, key: &[u8], output: &mut Vec<u8>) {
        output.clear();
        output.extend(key);
    }
}

#[test]
fn comparator_mismatch_is_rejected_at_open() {
    let dir = TempDir::new().unwrap();
    {
        let _db = open_db(&dir, test_options());
    }

    let mut options = test_options();
    options.comparator = Arc::new(ReverseComparator);
    let result = StrataDb::open(dir.path(), options);
    assert_eq!(result.unwrap_err().kind, ErrorKind::InvalidArgument);
}

/// Counts bloom queries so filter effectiveness is observable from the outside.
#[derive(Debug)]
struct CountingBloom {
    inner:   BloomFilterPolicy,
    queries: AtomicUsize,
    misses:  AtomicUsize,
}

impl FilterPolicy for CountingBloom {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn create_filter(&self, flattened_keys: &[u8], key_offsets: &[usize], filter: &mut Vec<u8>) {
        self.inner.create_filter(flattened_keys, key_offsets, filter);
    }

    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool {
        self.queries.fetch_add(1, AtomicOrdering::Relaxed);
        let matched = self.inner.key_may_match(key, filter);
        if !matched {
            self.misses.fetch_add(1, AtomicOrdering::Relaxed);
        }
        matched
    }
}

#[test]
fn bloom_filter_prunes_absent_key_lookups() {
    let dir = TempDir::new().unwrap();
    let policy = Arc::new(CountingBloom {
        inner:   BloomFilterPolicy::new(10),
        queries: AtomicUsize::new(0),
        misses:  AtomicUsize::new(0),
    });

    let mut options = test_options();
    options.filter_policy = Some(Arc::clone(&policy) as Arc<dyn FilterPolicy + Send + Sync>);
    options.write_buffer_size = 64 << 10;

    let db = open_db(&dir, options);
    // Even-numbered keys exist; odd-numbered keys interleave with them, so absent-key lookups
    // land inside file ranges and must be answered by the filters.
    for index in 0..10_000_u32 {
        put(&db, format!("key{:06}", index * 2).as_bytes(), b"v");
    }
    // Force everything into tables so lookups go through the filters.
    db.compact_range(None, None).unwrap();

    for index in 0..10_000_u32 {
        assert_eq!(get(&db, format!("key{:06}", index * 2 + 1).as_bytes()), None);
    }

    let queries = policy.queries.load(AtomicOrdering::Relaxed);
    let misses = policy.misses.load(AtomicOrdering::Relaxed);
    assert!(queries >= 10_000, "filters were not consulted ({queries} queries)");
    // At 10 bits per key, under 2% of absent-key probes may pass the filter.
    let passes = queries - misses;
    assert!(
        (passes as f64) < (queries as f64) * 0.02,
        "bloom filter passed {passes} of {queries} probes",
    );
}

#[test]
fn properties_report_engine_state() {
    let dir = TempDir::new().unwrap();
    let db = open_db(&dir, test_options());

    put(&db, b"some", b"data");

    let usage: usize = db
        .property("leveldb.approximate-memory-usage")
        .unwrap()
        .parse()
        .unwrap();
    assert!(usage > 0);

    assert!(db.property("leveldb.num-files-at-level0").is_some());
    assert!(db.property("leveldb.num-files-at-level99").is_none());
    assert!(db.property("leveldb.stats").is_some());
    assert!(db.property("leveldb.sstables").is_some());
    assert!(db.property("no.such.property").is_none());
}

#[test]
fn approximate_sizes_grow_with_data() {
    let dir = TempDir::new().unwrap();
    let mut options = test_options();
    options.write_buffer_size = 64 << 10;
    let db = open_db(&dir, options);

    let value = vec![b'v'; 1_000];
    for index in 0..500_u32 {
        put(&db, format!("key{index:04}").as_bytes(), &value);
    }
    db.compact_range(None, None).unwrap();

    let sizes = db
        .approximate_sizes(&[
            (b"key0000".as_slice(), b"key0250".as_slice()),
            (b"key0000".as_slice(), b"key0499".as_slice()),
            (b"zzz0000".as_slice(), b"zzz9999".as_slice()),
        ])
        .unwrap();

    assert!(sizes[0] > 0, "first half should occupy space");
    assert!(sizes[1] >= sizes[0], "larger range should not be smaller");
    assert_eq!(sizes[2], 0, "empty range occupies nothing");
}

#[test]
fn destroy_db_removes_everything() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("db");
    {
        let db = StrataDb::open(&db_path, test_options()).unwrap();
        put(&db, b"k", b"v");
    }

    strata_db::destroy_db(&db_path, &Options::default()).unwrap();
    assert!(!db_path.exists());

    // Destroying a database that is not there is fine.
    strata_db::destroy_db(&db_path, &Options::default()).unwrap();
}

#[test]
fn repair_db_rebuilds_a_usable_manifest() {
    let dir = TempDir::new().unwrap();
    let mut options = test_options();
    options.write_buffer_size = 64 << 10;

    let value = vec![b'v'; 500];
    {
        let db = open_db(&dir, options.clone());
        for index in 0..500_u32 {
            put(&db, format!("key{index:04}").as_bytes(), &value);
        }
    }

    // Simulate manifest loss.
    for entry in std::fs::read_dir(dir.path()).unwrap().flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy().into_owned();
        if name == "CURRENT" || name.starts_with("MANIFEST-") {
            std::fs::remove_file(entry.path()).unwrap();
        }
    }
    assert!(StrataDb::open(dir.path(), options.clone()).is_err());

    strata_db::repair_db(dir.path(), options.clone()).unwrap();

    let db = open_db(&dir, options);
    for index in 0..500_u32 {
        assert_eq!(
            get(&db, format!("key{index:04}").as_bytes()),
            Some(value.clone()),
            "key{index:04} lost by repair",
        );
    }
}

#[test]
fn background_work_quiesces() {
    let dir = TempDir::new().unwrap();
    let mut options = test_options();
    options.write_buffer_size = 32 << 10;
    let db = open_db(&dir, options);

    let value = vec![b'q'; 512];
    for index in 0..2_000_u32 {
        put(&db, format!("key{index:05}").as_bytes(), &value);
    }

    // Level 0 must eventually drain below the slowdown threshold on its own.
    let mut level0 = usize::MAX;
    for _ in 0..200 {
        level0 = db
            .property("leveldb.num-files-at-level0")
            .unwrap()
            .parse()
            .unwrap();
        if level0 < 8 {
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    assert!(level0 < 8, "level 0 stuck at {level0} files");
}
