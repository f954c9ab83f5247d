//! What a mapping is backed by.

use alloc::sync::Arc;
use core::fmt;

/// Failure reported by a [`BackingFile`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackingError {
    #[error("i/o error: {0}")]
    Io(&'static str),
    #[error("file is not readable")]
    NotReadable,
}

/// The slice of the file system a file mapping needs.
pub trait BackingFile: Send + Sync {
    /// Read up to `buf.len()` bytes at `offset`; returns the number of bytes
    /// read, which is short at end of file.
    ///
    /// # Errors
    /// Whatever the file system reports.
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, BackingError>;

    /// Whether the file was opened for writing.
    fn writable(&self) -> bool;
}

#[derive(Clone)]
pub enum Backing {
    /// Zero-filled memory, allocated eagerly.
    Anonymous,
    /// File contents from `offset`, loaded on first touch.
    File {
        file: Arc<dyn BackingFile>,
        offset: u64,
    },
}

impl Backing {
    #[must_use]
    pub fn file(file: Arc<dyn BackingFile>, offset: u64) -> Self {
        Self::File { file, offset }
    }

    #[must_use]
    pub const fn is_anonymous(&self) -> bool {
        matches!(self, Self::Anonymous)
    }
}

impl fmt::Debug for Backing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Anonymous => f.write_str("Anonymous"),
            Self::File { offset, file } => f
                .debug_struct("File")
                .field("offset", offset)
                .field("writable", &file.writable())
                .finish(),
        }
    }
}
