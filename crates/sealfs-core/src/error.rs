//! Error taxonomy for SealFS core operations.
//!
//! Every high-level operation ultimately converts its failure into a negative
//! POSIX errno for the kernel bridge; [`FsError::to_errno`] is the single
//! mapping point. Unexpected failures default to `EPERM` at the bridge
//! boundary, not here.

use std::io;
use thiserror::Error;

/// Errors surfaced by the store, the file table, and the path operations.
#[derive(Debug, Error)]
pub enum FsError {
    /// Path or directory entry does not exist.
    #[error("no such file or directory")]
    NoSuchFile,

    /// Name collision on create/link, or the on-disk pair already exists.
    #[error("file already exists")]
    Exists,

    /// A non-terminal path component resolved to a non-directory.
    #[error("not a directory")]
    NotADirectory,

    /// A non-directory was asked to replace a directory.
    #[error("is a directory")]
    IsADirectory,

    /// Refusing to remove a directory that still has entries.
    #[error("directory not empty")]
    NotEmpty,

    /// Operation rejected by policy (e.g. link on a directory).
    #[error("operation not permitted")]
    PermissionDenied,

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Mutation attempted on a read-only mount.
    #[error("read-only filesystem")]
    ReadOnlyFilesystem,

    /// A capability view was requested that the inode does not have.
    #[error("inode is not a {expected}")]
    WrongType {
        /// The capability that was requested.
        expected: &'static str,
    },

    /// A kernel file handle did not resolve to a live object.
    #[error("stale or null file handle")]
    BadHandle,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Decryption or envelope parsing failed; treated as data corruption.
    #[error("cryptographic failure: {0}")]
    Crypto(&'static str),
}

impl FsError {
    /// Maps this error to a positive libc errno value.
    pub fn to_errno(&self) -> i32 {
        match self {
            FsError::NoSuchFile => libc::ENOENT,
            FsError::Exists => libc::EEXIST,
            FsError::NotADirectory => libc::ENOTDIR,
            FsError::IsADirectory => libc::EISDIR,
            FsError::NotEmpty => libc::ENOTEMPTY,
            FsError::PermissionDenied => libc::EPERM,
            FsError::InvalidArgument(_) => libc::EINVAL,
            FsError::ReadOnlyFilesystem => libc::EROFS,
            FsError::WrongType { .. } => libc::EPERM,
            FsError::BadHandle => libc::EFAULT,
            FsError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            FsError::Crypto(_) => libc::EIO,
        }
    }
}

/// Result type used throughout the core.
pub type FsResult<T> = Result<T, FsError>;
