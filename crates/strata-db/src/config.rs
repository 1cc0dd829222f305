/// The number of levels in the tree.
pub(crate) const NUM_LEVELS: usize = 7;
/// The maximum level a fresh memtable flush may be placed at, when nothing overlaps it.
pub(crate) const MAX_MEM_COMPACT_LEVEL: usize = 2;

/// Once there are this many level-0 files, size compactions may target level 0.
pub(crate) const L0_COMPACTION_TRIGGER: usize = 4;
/// Once there are this many level-0 files, each write sleeps 1 ms to let compaction catch up.
pub(crate) const L0_SLOWDOWN_WRITES_TRIGGER: usize = 8;
/// Once there are this many level-0 files, writes stop entirely until compaction catches up.
pub(crate) const L0_STOP_WRITES_TRIGGER: usize = 12;

/// The byte budget of level 1. Each level after that is allowed ten times the previous one.
/// The limit of level 0 is a file count, not a byte size.
pub(crate) const MAX_BYTES_FOR_LEVEL_1: f64 = 10.0 * 1024.0 * 1024.0;
pub(crate) const LEVEL_BYTES_MULTIPLIER: f64 = 10.0;

/// A compaction output is cut when its overlap with the grandparent level reaches
/// `GRANDPARENT_OVERLAP_FACTOR * max_file_size` bytes.
pub(crate) const GRANDPARENT_OVERLAP_FACTOR: u64 = 10;
/// A compaction's level-L input is not grown past
/// `EXPANDED_COMPACTION_FACTOR * max_file_size` total input bytes.
pub(crate) const EXPANDED_COMPACTION_FACTOR: u64 = 25;

/// The block size of the record format shared by write-ahead logs and MANIFEST files.
pub(crate) const LOG_BLOCK_SIZE: usize = 1 << 15;

/// Group commit caps: a small head batch may grow by at most 128 KiB of followers, any other
/// merged batch stops at 1 MiB.
pub(crate) const SMALL_BATCH_SIZE: usize = 128 << 10;
pub(crate) const MAX_GROUPED_BATCH_SIZE: usize = 1 << 20;

#[must_use]
pub(crate) fn max_bytes_for_level(level: usize) -> f64 {
    let mut max_bytes = MAX_BYTES_FOR_LEVEL_1;
    let mut level = level;
    while level > 1 {
        max_bytes *= LEVEL_BYTES_MULTIPLIER;
        level -= 1;
    }
    max_bytes
}
