//! Iteration over internal entries: per-level concatenation, heap-free k-way merging, and the
//! public iterator that collapses internal entries into user-visible ones.

mod db_iter;
mod level_iter;
mod merge_iter;


pub(crate) use self::db_iter::IterPin;
pub(crate) use self::level_iter::LevelIter;
pub(crate) use self::merge_iter::MergingIter;
pub use self::db_iter::DbIterator;

use crate::error::Result;
use crate::memtable::MemtableIter;
use crate::table_cache::DbTableIter;


/// A cursor over internal entries. One variant per source tier, so the merging iterator can
/// hold a uniform list without boxing.
#[derive(Debug)]
pub(crate) enum InternalIter {
    Memtable(MemtableIter),
    Table(Box<DbTableIter>),
    Level(LevelIter),
}

impl InternalIter {
    pub(crate) fn valid(&self) -> bool {
        match self {
            Self::Memtable(iter) => iter.valid(),
            Self::Table(iter)    => iter.valid(),
            Self::Level(iter)    => iter.valid(),
        }
    }

    /// The current encoded internal key.
    ///
    /// # Panics
    /// May panic if the iterator is not valid.
    pub(crate) fn key(&self) -> &[u8] {
        match self {
            Self::Memtable(iter) => iter.key(),
            Self::Table(iter)    => iter.key(),
            Self::Level(iter)    => iter.key(),
        }
    }

    /// # Panics
    /// May panic if the iterator is not valid.
    pub(crate) fn value(&self) -> &[u8] {
        match self {
            Self::Memtable(iter) => iter.value(),
            Self::Table(iter)    => iter.value(),
            Self::Level(iter)    => iter.value(),
        }
    }

    pub(crate) fn next(&mut self) {
        match self {
            Self::Memtable(iter) => {
                let _valid = iter.next();
            }
            Self::Table(iter) => {
                let _valid = iter.next();
            }
            Self::Level(iter) => iter.next(),
        }
    }

    pub(crate) fn prev(&mut self) {
        match self {
            Self::Memtable(iter) => {
                let _valid = iter.prev();
            }
            Self::Table(iter) => {
                let _valid = iter.prev();
            }
            Self::Level(iter) => iter.prev(),
        }
    }

    pub(crate) fn seek(&mut self, target: &[u8]) {
        match self {
            Self::Memtable(iter) => iter.seek(target),
            Self::Table(iter)    => iter.seek(target),
            Self::Level(iter)    => iter.seek(target),
        }
    }

    pub(crate) fn seek_to_first(&mut self) {
        match self {
            Self::Memtable(iter) => iter.seek_to_first(),
            Self::Table(iter)    => iter.seek_to_first(),
            Self::Level(iter)    => iter.seek_to_first(),
        }
    }

    pub(crate) fn seek_to_last(&mut self) {
        match self {
            Self::Memtable(iter) => iter.seek_to_last(),
            Self::Table(iter)    => iter.seek_to_last(),
            Self::Level(iter)    => iter.seek_to_last(),
        }
    }

    /// The first error this iterator ran into, if any.
    pub(crate) fn status(&self) -> Result<()> {
        match self {
            Self::Memtable(_iter) => Ok(()),
            Self::Table(iter)     => iter.status().map_err(Into::into),
            Self::Level(iter)     => iter.status(),
        }
    }
}
