use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;

use strata_sstable::TableError;


pub type Result<T> = StdResult<T, Error>;

/// The category of a database [`Error`].
///
/// A missing key is not an error: `get` reports it as `Ok(None)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Stored data failed validation: bad checksums, malformed records, unexpected file
    /// contents. Corruption is fatal for the operation that found it.
    Corruption,
    Io,
    InvalidArgument,
    NotSupported,
}

impl ErrorKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Corruption      => "corruption",
            Self::Io              => "IO error",
            Self::InvalidArgument => "invalid argument",
            Self::NotSupported    => "not supported",
        }
    }
}

#[derive(Error, Debug, Clone)]
#[error("{}: {message}", .kind.as_str())]
pub struct Error {
    pub kind:    ErrorKind,
    pub message: String,
}

impl Error {
    #[must_use]
    pub(crate) fn corruption(message: impl Into<String>) -> Self {
        Self {
            kind:    ErrorKind::Corruption,
            message: message.into(),
        }
    }

    #[must_use]
    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        Self {
            kind:    ErrorKind::InvalidArgument,
            message: message.into(),
        }
    }

    #[must_use]
    pub(crate) fn not_supported(message: impl Into<String>) -> Self {
        Self {
            kind:    ErrorKind::NotSupported,
            message: message.into(),
        }
    }
}

impl From<IoError> for Error {
    fn from(error: IoError) -> Self {
        Self {
            kind:    ErrorKind::Io,
            message: error.to_string(),
        }
    }
}

impl From<TableError> for Error {
    fn from(error: TableError) -> Self {
        match error {
            TableError::Corruption(message) => Self::corruption(message),
            TableError::Io(error)           => Self::from(error),
        }
    }
}
