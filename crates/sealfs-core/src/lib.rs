//! Encrypted inode store and object table for SealFS.
//!
//! This crate owns the data plane of a SealFS vault: the on-disk encrypted
//! object pairs, the in-memory [`FileObject`] representation of an inode, and
//! the [`FileTable`] cache that guarantees at-most-one live object per inode
//! id across all operation threads.
//!
//! # Components
//!
//! - [`InodeId`] - 32-byte random inode identifier and its on-disk path mapping
//! - [`FileStore`] - factory for the encrypted data/metadata file pairs
//! - [`FileObject`] - a single inode with kind-specific capability views
//! - [`FileTable`] - identity and lifetime cache with two-stage eviction
//! - [`FileGuard`] - RAII owner that returns an object to the table on drop
//! - [`Finalizer`] - background worker that absorbs slow close/delete work
//!
//! The path walker and the FUSE surface live in `sealfs-fuse`; this crate has
//! no notion of textual paths beyond the id-derived shard layout.

pub mod error;
pub mod file;
pub mod finalizer;
pub mod flags;
pub mod handle;
pub mod id;
pub mod store;
pub mod table;

pub use error::{FsError, FsResult};
pub use file::{DirEntry, FileKind, FileObject, FileStat, TimeSpec};
pub use finalizer::Finalizer;
pub use flags::MountFlags;
pub use handle::FileGuard;
pub use id::InodeId;
pub use store::{FileStore, StatVfs};
pub use table::{FileTable, MAX_NUM_CLOSED, NUM_EJECT};
