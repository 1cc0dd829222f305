use std::io::Error as IoError;

use thiserror::Error;


pub type TableResult<T> = Result<T, TableError>;

/// Errors produced while reading or writing a table file.
#[derive(Error, Debug)]
pub enum TableError {
    /// The file contents do not form a valid table: truncated footer, bad magic, mismatched
    /// block checksum, malformed varint, unknown compression tag, and similar.
    #[error("table corruption: {0}")]
    Corruption(String),
    #[error(transparent)]
    Io(#[from] IoError),
}

impl TableError {
    #[must_use]
    pub(crate) fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption(message.into())
    }
}

impl Clone for TableError {
    fn clone(&self) -> Self {
        match self {
            Self::Corruption(message) => Self::Corruption(message.clone()),
            // `io::Error` is not `Clone`; preserve the kind and rendered message.
            Self::Io(error) => Self::Io(IoError::new(error.kind(), error.to_string())),
        }
    }
}
