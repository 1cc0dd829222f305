use std::sync::Arc;

use strata_sstable::TableReadOptions;

use crate::comparator::InternalKeyComparator;
use crate::error::{Error, Result};
use crate::table_cache::{DbTableIter, TableCache};
use crate::version::FileMetadata;


/// A cursor concatenating the tables of one level ≥ 1, whose files are disjoint and sorted.
/// Tables are opened lazily, one at a time, as the cursor moves through the level.
#[derive(Debug)]
pub(crate) struct LevelIter {
    icmp:       InternalKeyComparator,
    cache:      TableCache,
    ropts:      TableReadOptions,
    files:      Vec<Arc<FileMetadata>>,
    /// Index of the file `table_iter` is open on; `files.len()` when exhausted.
    file_index: usize,
    table_iter: Option<DbTableIter>,
    error:      Option<Error>,
}

impl LevelIter {
    #[must_use]
    pub(crate) fn new(
        icmp:  InternalKeyComparator,
        cache: TableCache,
        ropts: TableReadOptions,
        files: Vec<Arc<FileMetadata>>,
    ) -> Self {
        let file_index = files.len();
        Self {
            icmp,
            cache,
            ropts,
            files,
            file_index,
            table_iter: None,
            error:      None,
        }
    }

    pub(crate) fn valid(&self) -> bool {
        self.error.is_none() && self.table_iter.as_ref().is_some_and(DbTableIter::valid)
    }

    pub(crate) fn key(&self) -> &[u8] {
        self.table_iter.as_ref().expect("iterator is valid").key()
    }

    pub(crate) fn value(&self) -> &[u8] {
        self.table_iter.as_ref().expect("iterator is valid").value()
    }

    pub(crate) fn status(&self) -> Result<()> {
        if let Some(error) = &self.error {
            return Err(error.clone());
        }
        if let Some(table_iter) = &self.table_iter {
            table_iter.status()?;
        }
        Ok(())
    }

    pub(crate) fn seek(&mut self, target: &[u8]) {
        // The files are disjoint and sorted, so the target can only be in the first file whose
        // largest key is at or after it.
        let index = self.files.partition_point(|file| {
            use strata_sstable::TableComparator as _;
            self.icmp.cmp(file.largest().encoded(), target).is_lt()
        });

        if !self.open_file(index) {
            return;
        }
        if let Some(table_iter) = &mut self.table_iter {
            table_iter.seek(target);
        }
        self.skip_empty_tables_forward();
    }

    pub(crate) fn seek_to_first(&mut self) {
        if !self.open_file(0) {
            return;
        }
        if let Some(table_iter) = &mut self.table_iter {
            table_iter.seek_to_first();
        }
        self.skip_empty_tables_forward();
    }

    pub(crate) fn seek_to_last(&mut self) {
        if self.files.is_empty() {
            self.table_iter = None;
            return;
        }
        if !self.open_file(self.files.len() - 1) {
            return;
        }
        if let Some(table_iter) = &mut self.table_iter {
            table_iter.seek_to_last();
        }
    }

    pub(crate) fn next(&mut self) {
        if let Some(table_iter) = &mut self.table_iter {
            let _still_in_table = table_iter.next();
        }
        self.skip_empty_tables_forward();
    }

    pub(crate) fn prev(&mut self) {
        if let Some(table_iter) = &mut self.table_iter {
            let _still_in_table = table_iter.prev();
        }

        while self.error.is_none()
            && self.table_iter.as_ref().map(|iter| !iter.valid()).unwrap_or(true)
        {
            if self.file_index == 0 {
                self.table_iter = None;
                self.file_index = self.files.len();
                return;
            }
            if !self.open_file(self.file_index - 1) {
                return;
            }
            if let Some(table_iter) = &mut self.table_iter {
                table_iter.seek_to_last();
            }
        }
    }

    fn skip_empty_tables_forward(&mut self) {
        while self.error.is_none()
            && self.table_iter.as_ref().map(|iter| !iter.valid()).unwrap_or(true)
        {
            if self.file_index + 1 >= self.files.len() {
                self.table_iter = None;
                self.file_index = self.files.len();
                return;
            }
            if !self.open_file(self.file_index + 1) {
                return;
            }
            if let Some(table_iter) = &mut self.table_iter {
                table_iter.seek_to_first();
            }
        }
    }

    /// Open the table at `index`, leaving its cursor unpositioned. Returns `false` when the
    /// index is out of range or the open failed.
    fn open_file(&mut self, index: usize) -> bool {
        if index >= self.files.len() {
            self.table_iter = None;
            self.file_index = self.files.len();
            return false;
        }
        if index == self.file_index && self.table_iter.is_some() {
            return true;
        }

        let file = &self.files[index];
        match self.cache.iter(self.ropts, file.number(), file.size()) {
            Ok(table_iter) => {
                self.table_iter = Some(table_iter);
                self.file_index = index;
                true
            }
            Err(error) => {
                self.error = Some(error);
                self.table_iter = None;
                false
            }
        }
    }
}
