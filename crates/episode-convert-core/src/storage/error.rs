use std::{error::Error, fmt, io};

use snafu::{Backtrace, prelude::*};

/// Raw failure reported by the backend holding a dataset root.
#[derive(Debug)]
pub enum BackendError {
    /// Local filesystem failure.
    Local(io::Error),
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Local(e) => write!(f, "{e}"),
        }
    }
}

impl Error for BackendError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            BackendError::Local(e) => Some(e),
        }
    }
}

/// Errors from reading or writing a dataset root.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    /// Nothing exists at the path.
    #[snafu(display("No such file or directory: {path}"))]
    NotFound {
        /// Absolute path.
        path: String,
        /// Backend error.
        source: BackendError,
        /// Where the error was raised.
        backtrace: Backtrace,
    },

    /// A directory or special file sits where a regular file was expected.
    #[snafu(display("Not a regular file: {path}"))]
    NotAFile {
        /// Absolute path.
        path: String,
        /// Where the error was raised.
        backtrace: Backtrace,
    },

    /// Any other I/O failure.
    #[snafu(display("I/O error at {path}: {source}"))]
    OtherIo {
        /// Absolute path.
        path: String,
        /// Backend error.
        source: BackendError,
        /// Where the error was raised.
        backtrace: Backtrace,
    },
}

impl StorageError {
    /// Absolute path the failing operation was acting on.
    pub fn path(&self) -> &str {
        match self {
            StorageError::NotFound { path, .. }
            | StorageError::NotAFile { path, .. }
            | StorageError::OtherIo { path, .. } => path,
        }
    }

    /// Whether no usable file exists at [`StorageError::path`]. Source
    /// artifacts in either state are reported as missing.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StorageError::NotFound { .. } | StorageError::NotAFile { .. }
        )
    }
}
