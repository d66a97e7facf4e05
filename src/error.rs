//! Error types shared by the VFS backends and the SQLite glue layer.
//!
//! The engine expects failures as numeric result codes, so every VFS error
//! carries enough information to map onto the corresponding `SQLITE_*`
//! constant. Service-level code wraps these in `anyhow` with context.

use std::os::raw::c_int;

use rusqlite::ffi;
use thiserror::Error;

/// Category of a failed I/O operation, mapped to the engine's IOERR sub-codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoKind {
    Read,
    Write,
    Fsync,
    Truncate,
    Lock,
    Close,
    Delete,
    Access,
    Fstat,
}

impl std::fmt::Display for IoKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            IoKind::Read => "read",
            IoKind::Write => "write",
            IoKind::Fsync => "fsync",
            IoKind::Truncate => "truncate",
            IoKind::Lock => "lock",
            IoKind::Close => "close",
            IoKind::Delete => "delete",
            IoKind::Access => "access",
            IoKind::Fstat => "fstat",
        };
        write!(f, "{}", name)
    }
}

/// Errors produced by VFS implementations.
#[derive(Debug, Clone, Error)]
pub enum VfsError {
    /// The file does not exist, cannot be created, or carries unsupported
    /// open flags.
    #[error("cannot open file")]
    CantOpen,

    /// Lock contention; the engine retries according to its own policy.
    #[error("file is locked")]
    Busy,

    /// An I/O operation failed in the named category.
    #[error("{0} I/O error")]
    Io(IoKind),
}

impl VfsError {
    /// The engine result code this error maps to.
    pub fn code(&self) -> c_int {
        match self {
            VfsError::CantOpen => ffi::SQLITE_CANTOPEN,
            VfsError::Busy => ffi::SQLITE_BUSY,
            VfsError::Io(kind) => match kind {
                IoKind::Read => ffi::SQLITE_IOERR_READ,
                IoKind::Write => ffi::SQLITE_IOERR_WRITE,
                IoKind::Fsync => ffi::SQLITE_IOERR_FSYNC,
                IoKind::Truncate => ffi::SQLITE_IOERR_TRUNCATE,
                IoKind::Lock => ffi::SQLITE_IOERR_LOCK,
                IoKind::Close => ffi::SQLITE_IOERR_CLOSE,
                IoKind::Delete => ffi::SQLITE_IOERR_DELETE,
                IoKind::Access => ffi::SQLITE_IOERR_ACCESS,
                IoKind::Fstat => ffi::SQLITE_IOERR_FSTAT,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(VfsError::CantOpen.code(), ffi::SQLITE_CANTOPEN);
        assert_eq!(VfsError::Busy.code(), ffi::SQLITE_BUSY);
        assert_eq!(VfsError::Io(IoKind::Read).code(), ffi::SQLITE_IOERR_READ);
        assert_eq!(VfsError::Io(IoKind::Fsync).code(), ffi::SQLITE_IOERR_FSYNC);
        assert_eq!(
            VfsError::Io(IoKind::Delete).code(),
            ffi::SQLITE_IOERR_DELETE
        );
    }
}
