//! An arena-backed skiplist holding opaque byte entries, built as the memtable structure of
//! `strata-db`.
//!
//! The list supports exactly one writer at a time (inserts take an internal writer mutex, and
//! callers are expected to serialize writes anyway) while readers traverse the list without any
//! locking, using acquire/release atomics on the forward pointers. Entries are never removed;
//! all node and entry memory lives in a [`bumpalo`] arena that is freed when the last handle to
//! the list is dropped.

mod comparator;
mod list;
mod node_heights;


pub use self::comparator::{Comparator, LexicographicComparator};
pub use self::list::{Skiplist, SkiplistIter};
