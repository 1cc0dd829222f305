use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::sync::Arc;

use crate::block::BlockIter;
use crate::comparator::TableComparator;
use crate::error::{TableError, TableResult};
use crate::filter::FilterPolicy;
use crate::format::BlockHandle;
use super::{Table, TableReadOptions};


/// A two-level cursor over a [`Table`]: an index-block iterator selecting data blocks, and a
/// data-block iterator walking the entries of the selected block.
///
/// A freshly created iterator is not positioned at any entry. Any corruption or I/O error
/// encountered while loading blocks permanently invalidates the iterator;
/// [`TableIter::status`] reports the first such error.
pub struct TableIter<Cmp, Policy> {
    table:                 Arc<Table<Cmp, Policy>>,
    ropts:                 TableReadOptions,
    index_iter:            BlockIter<Cmp>,
    data_iter:             Option<BlockIter<Cmp>>,
    /// The file offset of the block `data_iter` came from, to avoid reloading it.
    current_handle_offset: Option<u64>,
    error:                 Option<TableError>,
}

impl<Cmp, Policy> TableIter<Cmp, Policy>
where
    Cmp:    TableComparator + Clone,
    Policy: FilterPolicy,
{
    #[must_use]
    pub(super) fn new(table: Arc<Table<Cmp, Policy>>, ropts: TableReadOptions) -> Self {
        let index_iter = table.index_iter();
        Self {
            table,
            ropts,
            index_iter,
            data_iter:             None,
            current_handle_offset: None,
            error:                 None,
        }
    }

    #[must_use]
    pub fn valid(&self) -> bool {
        self.error.is_none() && self.data_iter.as_ref().map(BlockIter::valid).unwrap_or(false)
    }

    /// `Err` with the first corruption or I/O error this iterator ran into, if any.
    pub fn status(&self) -> TableResult<()> {
        if let Some(error) = &self.error {
            return Err(error.clone());
        }
        self.index_iter.status()?;
        if let Some(data_iter) = &self.data_iter {
            data_iter.status()?;
        }
        Ok(())
    }

    /// # Panics
    /// May panic if the iterator is not [`valid`](Self::valid).
    #[must_use]
    pub fn key(&self) -> &[u8] {
        self.data_iter.as_ref().expect("iterator is valid").key()
    }

    /// # Panics
    /// May panic if the iterator is not [`valid`](Self::valid).
    #[must_use]
    pub fn value(&self) -> &[u8] {
        self.data_iter.as_ref().expect("iterator is valid").value()
    }

    /// Position at the first entry whose key is greater than or equal to `target`.
    pub fn seek(&mut self, target: &[u8]) {
        if self.error.is_some() {
            return;
        }

        self.index_iter.seek(target);
        self.init_data_block();
        if let Some(data_iter) = &mut self.data_iter {
            data_iter.seek(target);
        }
        self.skip_empty_data_blocks_forward();
    }

    pub fn seek_to_first(&mut self) {
        if self.error.is_some() {
            return;
        }

        self.index_iter.seek_to_first();
        self.init_data_block();
        if let Some(data_iter) = &mut self.data_iter {
            data_iter.seek_to_first();
        }
        self.skip_empty_data_blocks_forward();
    }

    pub fn seek_to_last(&mut self) {
        if self.error.is_some() {
            return;
        }

        self.index_iter.seek_to_last();
        self.init_data_block();
        if let Some(data_iter) = &mut self.data_iter {
            data_iter.seek_to_last();
        }
        self.skip_empty_data_blocks_backward();
    }

    /// Advance to the next entry. Returns whether the iterator is valid afterward.
    pub fn next(&mut self) -> bool {
        if !self.valid() {
            return false;
        }
        if let Some(data_iter) = &mut self.data_iter {
            let _still_in_block = data_iter.next();
        }
        self.skip_empty_data_blocks_forward();
        self.valid()
    }

    /// Step back to the previous entry. Returns whether the iterator is valid afterward.
    pub fn prev(&mut self) -> bool {
        if !self.valid() {
            return false;
        }
        if let Some(data_iter) = &mut self.data_iter {
            let _still_in_block = data_iter.prev();
        }
        self.skip_empty_data_blocks_backward();
        self.valid()
    }

    /// Point `data_iter` at the block the index iterator currently selects, reusing the loaded
    /// block when it is unchanged. The data iterator starts out unpositioned.
    fn init_data_block(&mut self) {
        if !self.index_iter.valid() {
            if let Err(error) = self.index_iter.status() {
                self.error = Some(error);
            }
            self.data_iter = None;
            self.current_handle_offset = None;
            return;
        }

        let handle = match BlockHandle::decode_from(self.index_iter.value()) {
            Ok((handle, _)) => handle,
            Err(error) => {
                self.error = Some(error);
                self.data_iter = None;
                self.current_handle_offset = None;
                return;
            }
        };

        if self.current_handle_offset == Some(handle.offset) && self.data_iter.is_some() {
            // Same block as before; keep the data iterator's buffer, but the caller decides
            // where to position it.
            return;
        }

        match self.table.load_data_block(handle, &self.ropts) {
            Ok(block) => {
                self.data_iter = Some(block.iter(self.table.comparator.clone()));
                self.current_handle_offset = Some(handle.offset);
            }
            Err(error) => {
                self.error = Some(error);
                self.data_iter = None;
                self.current_handle_offset = None;
            }
        }
    }

    fn skip_empty_data_blocks_forward(&mut self) {
        while self.error.is_none()
            && self.data_iter.as_ref().map(|data_iter| !data_iter.valid()).unwrap_or(true)
        {
            if !self.index_iter.valid() {
                self.data_iter = None;
                self.current_handle_offset = None;
                return;
            }

            self.index_iter.next();
            self.init_data_block();
            if let Some(data_iter) = &mut self.data_iter {
                data_iter.seek_to_first();
            }
        }
    }

    fn skip_empty_data_blocks_backward(&mut self) {
        while self.error.is_none()
            && self.data_iter.as_ref().map(|data_iter| !data_iter.valid()).unwrap_or(true)
        {
            if !self.index_iter.valid() {
                self.data_iter = None;
                self.current_handle_offset = None;
                return;
            }

            self.index_iter.prev();
            self.init_data_block();
            if let Some(data_iter) = &mut self.data_iter {
                data_iter.seek_to_last();
            }
        }
    }
}

impl<Cmp, Policy> Debug for TableIter<Cmp, Policy> {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("TableIter")
            .field("current_handle_offset", &self.current_handle_offset)
            .field("has_error", &self.error.is_some())
            .finish_non_exhaustive()
    }
}
