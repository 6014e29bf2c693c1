//! Serialized per-inode metadata records.

use serde::{Deserialize, Serialize};

use crate::error::{FsError, FsResult};
use crate::file::{FileKind, TimeSpec};

/// The persistent metadata of one inode.
///
/// This record is the full plaintext of the metadata file of an on-disk pair,
/// sealed inside a [`PayloadCipher`](super::payload::PayloadCipher) envelope.
/// The kind is authoritative: directory entries also carry it, but the record
/// decides which capability views an opened object exposes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaRecord {
    pub kind: FileKind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub atime: TimeSpec,
    pub mtime: TimeSpec,
    pub ctime: TimeSpec,
}

impl MetaRecord {
    /// Fresh record for a just-created inode; mode and ownership are filled
    /// in by `initialize_empty`.
    pub fn new(kind: FileKind) -> Self {
        let now = TimeSpec::now();
        Self {
            kind,
            mode: 0,
            uid: 0,
            gid: 0,
            nlink: 1,
            atime: now,
            mtime: now,
            ctime: now,
        }
    }

    pub fn to_bytes(&self) -> FsResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|_| FsError::Crypto("metadata encoding failed"))
    }

    pub fn from_bytes(bytes: &[u8]) -> FsResult<Self> {
        serde_json::from_slice(bytes).map_err(|_| FsError::Crypto("metadata record malformed"))
    }
}
