//! Path resolution, filesystem operations and FUSE bridge for SealFS.
//!
//! This crate sits between the kernel syscall surface and the encrypted
//! object store of `sealfs-core`:
//!
//! - [`FileSystemContext`] - per-mount container binding the file table, the
//!   root inode id, the flags word, and the path-resolution memo
//! - [`walker`] - translates textual paths into inode ids by streaming
//!   through encrypted directory objects
//! - [`ops`] - the high-level operations (create, remove, rename, ...)
//!   composed from the walker and the file table
//! - [`SealFs`] - the `fuser::Filesystem` implementation mapping kernel inode
//!   numbers and file handles onto the path-based operations

pub mod context;
pub mod filesystem;
pub mod handles;
pub mod inode;
pub mod ops;
pub mod walker;

pub use context::FileSystemContext;
pub use filesystem::SealFs;
pub use handles::HandleTable;
pub use inode::{InoTable, ROOT_INODE};
