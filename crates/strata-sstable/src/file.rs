use std::fs::File;
use std::io::{BufWriter, Result as IoResult, Write};


/// Positioned reads into an immutable file. Implementations must allow concurrent readers.
pub trait RandomAccess: Send + Sync {
    /// Read up to `output.len()` bytes starting at `offset`, returning how many bytes were read.
    fn read_at(&self, offset: u64, output: &mut [u8]) -> IoResult<usize>;
}

#[cfg(unix)]
impl RandomAccess for File {
    #[inline]
    fn read_at(&self, offset: u64, output: &mut [u8]) -> IoResult<usize> {
        std::os::unix::fs::FileExt::read_at(self, output, offset)
    }
}

#[cfg(windows)]
impl RandomAccess for File {
    #[inline]
    fn read_at(&self, offset: u64, output: &mut [u8]) -> IoResult<usize> {
        std::os::windows::fs::FileExt::seek_read(self, output, offset)
    }
}

/// In-memory tables, used by tests.
impl RandomAccess for Vec<u8> {
    fn read_at(&self, offset: u64, output: &mut [u8]) -> IoResult<usize> {
        let offset = usize::try_from(offset).unwrap_or(usize::MAX);
        let available = self.len().saturating_sub(offset);
        let read_len = available.min(output.len());
        output[..read_len].copy_from_slice(&self[offset..offset + read_len]);
        Ok(read_len)
    }
}

impl<R: RandomAccess + ?Sized> RandomAccess for std::sync::Arc<R> {
    #[inline]
    fn read_at(&self, offset: u64, output: &mut [u8]) -> IoResult<usize> {
        (**self).read_at(offset, output)
    }
}

/// An append-only file a table can be built into.
pub trait WritableTableFile: Write {
    /// Flush application buffers and ask the OS to sync file data to persistent storage.
    fn sync_data(&mut self) -> IoResult<()>;
}

impl WritableTableFile for File {
    #[inline]
    fn sync_data(&mut self) -> IoResult<()> {
        Self::sync_data(self)
    }
}

impl WritableTableFile for BufWriter<File> {
    fn sync_data(&mut self) -> IoResult<()> {
        self.flush()?;
        self.get_ref().sync_data()
    }
}

/// In-memory tables, used by tests.
impl WritableTableFile for Vec<u8> {
    #[inline]
    fn sync_data(&mut self) -> IoResult<()> {
        Ok(())
    }
}

impl<F: WritableTableFile + ?Sized> WritableTableFile for &mut F {
    #[inline]
    fn sync_data(&mut self) -> IoResult<()> {
        (**self).sync_data()
    }
}
