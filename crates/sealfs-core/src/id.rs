//! Inode identifiers and their on-disk path mapping.

use rand::RngCore;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::PathBuf;

/// Length of an inode identifier in bytes.
pub const ID_LENGTH: usize = 32;

/// A fixed-width random inode identifier.
///
/// Ids are generated uniformly at random at creation time; collision
/// probability is cryptographically negligible, so no uniqueness check is
/// performed beyond the `create_new` race on the backing files. Equality is
/// bytewise. The id doubles as the cache key of the file table and as the
/// source of the on-disk pathname.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InodeId([u8; ID_LENGTH]);

impl InodeId {
    /// Generates a fresh random id.
    pub fn random() -> Self {
        let mut bytes = [0u8; ID_LENGTH];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Wraps raw bytes as an id.
    pub fn from_bytes(bytes: [u8; ID_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Parses an id from its lowercase hex form.
    pub fn from_hex(s: &str) -> Option<Self> {
        let decoded = hex::decode(s).ok()?;
        let bytes: [u8; ID_LENGTH] = decoded.try_into().ok()?;
        Some(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; ID_LENGTH] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Relative on-disk location of this id beneath the vault root.
    ///
    /// The first two bytes become nested shard directories so that no single
    /// directory accumulates every object:
    /// `<hex(id[0])>/<hex(id[1])>/<hex(id[2..])>`.
    pub fn shard_path(&self) -> PathBuf {
        let mut path = PathBuf::new();
        path.push(hex::encode(&self.0[0..1]));
        path.push(hex::encode(&self.0[1..2]));
        path.push(hex::encode(&self.0[2..]));
        path
    }
}

impl fmt::Debug for InodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InodeId({}..)", hex::encode(&self.0[0..4]))
    }
}

impl Serialize for InodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

struct IdVisitor;

impl Visitor<'_> for IdVisitor {
    type Value = InodeId;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a {}-character hex string", ID_LENGTH * 2)
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<InodeId, E> {
        InodeId::from_hex(v).ok_or_else(|| E::custom("malformed inode id"))
    }
}

impl<'de> Deserialize<'de> for InodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_str(IdVisitor)
    }
}
