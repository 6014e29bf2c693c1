//! In-memory inode objects and their capability views.
//!
//! A [`FileObject`] is the live representation of one on-disk pair. It is the
//! sole mutator of its persistent state: content and metadata are decrypted
//! once at open time, mutated in memory under the object's own lock, and
//! re-sealed on flush. The file table shares objects across threads via
//! `Arc`, so every operation takes `&self`.
//!
//! Kind-specific operations are exposed through runtime-checked projections
//! ([`RegularView`], [`DirectoryView`], [`SymlinkView`]) that fail with
//! `WrongType` instead of exposing an invalid capability.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{FsError, FsResult};
use crate::id::InodeId;
use crate::store::meta::MetaRecord;
use crate::store::FileStore;

/// Apparent size of a directory in `stat` output.
const DIRECTORY_STAT_SIZE: u64 = 4096;

/// A second-and-nanosecond timestamp as persisted in metadata records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSpec {
    pub secs: i64,
    pub nanos: u32,
}

impl TimeSpec {
    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    pub fn from_system_time(t: SystemTime) -> Self {
        match t.duration_since(UNIX_EPOCH) {
            Ok(d) => Self {
                secs: d.as_secs() as i64,
                nanos: d.subsec_nanos(),
            },
            Err(e) => Self {
                secs: -(e.duration().as_secs() as i64),
                nanos: 0,
            },
        }
    }

    pub fn to_system_time(self) -> SystemTime {
        if self.secs >= 0 {
            UNIX_EPOCH + Duration::new(self.secs as u64, self.nanos)
        } else {
            UNIX_EPOCH - Duration::from_secs(self.secs.unsigned_abs())
        }
    }
}

/// The three inode kinds of a vault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
}

impl FileKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FileKind::Regular => "regular file",
            FileKind::Directory => "directory",
            FileKind::Symlink => "symlink",
        }
    }

    /// The `S_IFMT` bits for this kind.
    pub fn mode_bits(self) -> u32 {
        match self {
            FileKind::Regular => libc::S_IFREG as u32,
            FileKind::Directory => libc::S_IFDIR as u32,
            FileKind::Symlink => libc::S_IFLNK as u32,
        }
    }
}

/// One record in a directory's entry table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub id: InodeId,
    pub kind: FileKind,
}

/// A point-in-time stat of an inode.
#[derive(Debug, Clone, Copy)]
pub struct FileStat {
    pub kind: FileKind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub size: u64,
    pub blocks: u64,
    pub atime: TimeSpec,
    pub mtime: TimeSpec,
    pub ctime: TimeSpec,
}

/// Decoded content of the data file, by kind.
enum Content {
    Regular(Vec<u8>),
    Directory(BTreeMap<String, DirEntry>),
    Symlink(String),
}

impl Content {
    fn decode(kind: FileKind, bytes: &[u8]) -> FsResult<Self> {
        match kind {
            FileKind::Regular => Ok(Content::Regular(bytes.to_vec())),
            FileKind::Directory => {
                if bytes.is_empty() {
                    return Ok(Content::Directory(BTreeMap::new()));
                }
                serde_json::from_slice(bytes)
                    .map(Content::Directory)
                    .map_err(|_| FsError::Crypto("directory table malformed"))
            }
            FileKind::Symlink => String::from_utf8(bytes.to_vec())
                .map(Content::Symlink)
                .map_err(|_| FsError::Crypto("symlink target not UTF-8")),
        }
    }

    fn encode(&self) -> FsResult<Vec<u8>> {
        match self {
            Content::Regular(bytes) => Ok(bytes.clone()),
            Content::Directory(entries) => serde_json::to_vec(entries)
                .map_err(|_| FsError::Crypto("directory table encoding failed")),
            Content::Symlink(target) => Ok(target.as_bytes().to_vec()),
        }
    }
}

struct FileInner {
    meta: MetaRecord,
    content: Content,
    meta_dirty: bool,
    content_dirty: bool,
}

/// The live object backing one inode id.
pub struct FileObject {
    id: InodeId,
    kind: FileKind,
    store: FileStore,
    inner: Mutex<FileInner>,
}

impl FileObject {
    /// Initial data-file plaintext for a freshly created inode of `kind`.
    pub(crate) fn empty_content(kind: FileKind) -> Vec<u8> {
        match kind {
            FileKind::Regular | FileKind::Symlink => Vec::new(),
            FileKind::Directory => b"{}".to_vec(),
        }
    }

    pub(crate) fn from_store(
        id: InodeId,
        store: FileStore,
        meta: MetaRecord,
        content_bytes: &[u8],
    ) -> FsResult<Self> {
        let content = Content::decode(meta.kind, content_bytes)?;
        Ok(Self {
            id,
            kind: meta.kind,
            store,
            inner: Mutex::new(FileInner {
                meta,
                content,
                meta_dirty: false,
                content_dirty: false,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, FileInner> {
        self.inner.lock().expect("file object lock poisoned")
    }

    pub fn id(&self) -> InodeId {
        self.id
    }

    pub fn kind(&self) -> FileKind {
        self.kind
    }

    /// Fills in ownership and permissions of a just-created inode and
    /// persists the metadata record.
    pub fn initialize_empty(&self, mode: u32, uid: u32, gid: u32) -> FsResult<()> {
        let mut inner = self.lock();
        let now = TimeSpec::now();
        inner.meta.mode = mode;
        inner.meta.uid = uid;
        inner.meta.gid = gid;
        inner.meta.atime = now;
        inner.meta.mtime = now;
        inner.meta.ctime = now;
        self.store.write_meta(&self.id, &inner.meta)?;
        inner.meta_dirty = false;
        Ok(())
    }

    pub fn stat(&self) -> FsResult<FileStat> {
        let inner = self.lock();
        let size = match &inner.content {
            Content::Regular(bytes) => bytes.len() as u64,
            Content::Directory(_) => DIRECTORY_STAT_SIZE,
            Content::Symlink(target) => target.len() as u64,
        };
        let (atime, mtime, ctime) = if self.store.store_time() {
            (inner.meta.atime, inner.meta.mtime, inner.meta.ctime)
        } else {
            let t = TimeSpec::from_system_time(self.store.data_mtime(&self.id)?);
            (t, t, t)
        };
        Ok(FileStat {
            kind: self.kind,
            mode: inner.meta.mode,
            uid: inner.meta.uid,
            gid: inner.meta.gid,
            nlink: inner.meta.nlink,
            size,
            blocks: size.div_ceil(512),
            atime,
            mtime,
            ctime,
        })
    }

    /// Writes any dirty state back through the store.
    pub fn flush(&self) -> FsResult<()> {
        let mut inner = self.lock();
        if inner.content_dirty {
            let encoded = inner.content.encode()?;
            self.store.write_data(&self.id, &encoded)?;
            inner.content_dirty = false;
        }
        if inner.meta_dirty {
            self.store.write_meta(&self.id, &inner.meta)?;
            inner.meta_dirty = false;
        }
        Ok(())
    }

    /// Flushes and forces both files of the pair to stable storage.
    pub fn fsync(&self) -> FsResult<()> {
        self.flush()?;
        self.store.sync_pair(&self.id)
    }

    /// Updates access/modification times. A no-op on mounts that do not
    /// persist timestamps.
    pub fn utimens(&self, atime: Option<TimeSpec>, mtime: Option<TimeSpec>) -> FsResult<()> {
        if !self.store.store_time() {
            return Ok(());
        }
        let mut inner = self.lock();
        if let Some(t) = atime {
            inner.meta.atime = t;
        }
        if let Some(t) = mtime {
            inner.meta.mtime = t;
        }
        inner.meta.ctime = TimeSpec::now();
        inner.meta_dirty = true;
        Ok(())
    }

    pub fn get_mode(&self) -> u32 {
        self.lock().meta.mode
    }

    pub fn set_mode(&self, mode: u32) {
        let mut inner = self.lock();
        inner.meta.mode = mode;
        inner.meta.ctime = TimeSpec::now();
        inner.meta_dirty = true;
    }

    pub fn get_uid(&self) -> u32 {
        self.lock().meta.uid
    }

    pub fn set_uid(&self, uid: u32) {
        let mut inner = self.lock();
        inner.meta.uid = uid;
        inner.meta.ctime = TimeSpec::now();
        inner.meta_dirty = true;
    }

    pub fn get_gid(&self) -> u32 {
        self.lock().meta.gid
    }

    pub fn set_gid(&self, gid: u32) {
        let mut inner = self.lock();
        inner.meta.gid = gid;
        inner.meta.ctime = TimeSpec::now();
        inner.meta_dirty = true;
    }

    pub fn get_nlink(&self) -> u32 {
        self.lock().meta.nlink
    }

    pub fn set_nlink(&self, nlink: u32) {
        let mut inner = self.lock();
        inner.meta.nlink = nlink;
        inner.meta.ctime = TimeSpec::now();
        inner.meta_dirty = true;
    }

    /// Drops one logical name of this inode. Directories and symlinks have a
    /// single name, so their link count goes straight to zero.
    pub fn unlink(&self) {
        let mut inner = self.lock();
        inner.meta.nlink = match self.kind {
            FileKind::Regular => inner.meta.nlink.saturating_sub(1),
            FileKind::Directory | FileKind::Symlink => 0,
        };
        inner.meta.ctime = TimeSpec::now();
        inner.meta_dirty = true;
    }

    /// Whether every logical name of this inode is gone. The file table
    /// deletes the on-disk pair of unlinked objects once the last reference
    /// is dropped.
    pub fn is_unlinked(&self) -> bool {
        self.lock().meta.nlink == 0
    }

    pub fn as_regular(&self) -> FsResult<RegularView<'_>> {
        match self.kind {
            FileKind::Regular => Ok(RegularView(self)),
            _ => Err(FsError::WrongType {
                expected: "regular file",
            }),
        }
    }

    pub fn as_directory(&self) -> FsResult<DirectoryView<'_>> {
        match self.kind {
            FileKind::Directory => Ok(DirectoryView(self)),
            _ => Err(FsError::WrongType {
                expected: "directory",
            }),
        }
    }

    pub fn as_symlink(&self) -> FsResult<SymlinkView<'_>> {
        match self.kind {
            FileKind::Symlink => Ok(SymlinkView(self)),
            _ => Err(FsError::WrongType { expected: "symlink" }),
        }
    }
}

impl std::fmt::Debug for FileObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileObject")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Capability view over a regular file.
pub struct RegularView<'a>(&'a FileObject);

impl RegularView<'_> {
    pub fn len(&self) -> u64 {
        match &self.0.lock().content {
            Content::Regular(bytes) => bytes.len() as u64,
            _ => unreachable!("view kind checked at construction"),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads up to `size` bytes at `offset`. Reads past the end return the
    /// available prefix; reads starting past the end return nothing.
    pub fn read(&self, offset: u64, size: usize) -> Vec<u8> {
        let inner = self.0.lock();
        let Content::Regular(bytes) = &inner.content else {
            unreachable!("view kind checked at construction");
        };
        let start = offset.min(bytes.len() as u64) as usize;
        let end = (start + size).min(bytes.len());
        bytes[start..end].to_vec()
    }

    /// Writes `data` at `offset`, zero-filling any gap past the current end.
    pub fn write(&self, offset: u64, data: &[u8]) -> FsResult<usize> {
        let offset =
            usize::try_from(offset).map_err(|_| FsError::InvalidArgument("offset too large"))?;
        let end = offset
            .checked_add(data.len())
            .ok_or(FsError::InvalidArgument("write past addressable range"))?;

        let mut inner = self.0.lock();
        let Content::Regular(bytes) = &mut inner.content else {
            unreachable!("view kind checked at construction");
        };
        if bytes.len() < end {
            bytes.resize(end, 0);
        }
        bytes[offset..end].copy_from_slice(data);
        inner.meta.mtime = TimeSpec::now();
        inner.meta.ctime = inner.meta.mtime;
        inner.content_dirty = true;
        inner.meta_dirty = true;
        Ok(data.len())
    }

    pub fn truncate(&self, size: u64) -> FsResult<()> {
        let size =
            usize::try_from(size).map_err(|_| FsError::InvalidArgument("size too large"))?;
        let mut inner = self.0.lock();
        let Content::Regular(bytes) = &mut inner.content else {
            unreachable!("view kind checked at construction");
        };
        bytes.resize(size, 0);
        inner.meta.mtime = TimeSpec::now();
        inner.meta.ctime = inner.meta.mtime;
        inner.content_dirty = true;
        inner.meta_dirty = true;
        Ok(())
    }
}

/// Capability view over a directory.
pub struct DirectoryView<'a>(&'a FileObject);

impl DirectoryView<'_> {
    pub fn get_entry(&self, name: &str) -> Option<DirEntry> {
        match &self.0.lock().content {
            Content::Directory(entries) => entries.get(name).copied(),
            _ => unreachable!("view kind checked at construction"),
        }
    }

    /// Adds an entry; returns `false` without modification when the name is
    /// already taken.
    pub fn add_entry(&self, name: &str, id: InodeId, kind: FileKind) -> FsResult<bool> {
        if name.is_empty() || name.contains('/') {
            return Err(FsError::InvalidArgument("bad directory entry name"));
        }
        let mut inner = self.0.lock();
        let Content::Directory(entries) = &mut inner.content else {
            unreachable!("view kind checked at construction");
        };
        if entries.contains_key(name) {
            return Ok(false);
        }
        entries.insert(name.to_string(), DirEntry { id, kind });
        inner.meta.mtime = TimeSpec::now();
        inner.meta.ctime = inner.meta.mtime;
        inner.content_dirty = true;
        inner.meta_dirty = true;
        Ok(true)
    }

    pub fn remove_entry(&self, name: &str) -> FsResult<()> {
        let mut inner = self.0.lock();
        let Content::Directory(entries) = &mut inner.content else {
            unreachable!("view kind checked at construction");
        };
        if entries.remove(name).is_none() {
            return Err(FsError::NoSuchFile);
        }
        inner.meta.mtime = TimeSpec::now();
        inner.meta.ctime = inner.meta.mtime;
        inner.content_dirty = true;
        inner.meta_dirty = true;
        Ok(())
    }

    /// Feeds every entry to `sink` in name order; stops early when the sink
    /// returns `false`.
    pub fn iterate_over_entries(&self, mut sink: impl FnMut(&str, &DirEntry) -> bool) {
        let inner = self.0.lock();
        let Content::Directory(entries) = &inner.content else {
            unreachable!("view kind checked at construction");
        };
        for (name, entry) in entries {
            if !sink(name, entry) {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        match &self.0.lock().content {
            Content::Directory(entries) => entries.len(),
            _ => unreachable!("view kind checked at construction"),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Capability view over a symlink.
pub struct SymlinkView<'a>(&'a FileObject);

impl SymlinkView<'_> {
    pub fn target(&self) -> String {
        match &self.0.lock().content {
            Content::Symlink(target) => target.clone(),
            _ => unreachable!("view kind checked at construction"),
        }
    }

    pub fn set_target(&self, target: &str) -> FsResult<()> {
        let mut inner = self.0.lock();
        let Content::Symlink(current) = &mut inner.content else {
            unreachable!("view kind checked at construction");
        };
        *current = target.to_string();
        inner.meta.mtime = TimeSpec::now();
        inner.meta.ctime = inner.meta.mtime;
        inner.content_dirty = true;
        inner.meta_dirty = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::MountFlags;
    use tempfile::TempDir;

    fn store_with_flags(dir: &TempDir, flags: MountFlags) -> FileStore {
        FileStore::new(dir.path(), &[9u8; 32], flags).unwrap()
    }

    fn new_object(store: &FileStore, kind: FileKind) -> FileObject {
        let obj = store.create_new(&InodeId::random(), kind).unwrap();
        obj.initialize_empty(kind.mode_bits() | 0o644, 1000, 1000).unwrap();
        obj
    }

    #[test]
    fn test_initialize_and_stat() {
        let dir = TempDir::new().unwrap();
        let store = store_with_flags(&dir, MountFlags::STORE_TIME);
        let obj = new_object(&store, FileKind::Regular);

        let st = obj.stat().unwrap();
        assert_eq!(st.kind, FileKind::Regular);
        assert_eq!(st.mode, libc::S_IFREG as u32 | 0o644);
        assert_eq!(st.uid, 1000);
        assert_eq!(st.nlink, 1);
        assert_eq!(st.size, 0);
    }

    #[test]
    fn test_write_read_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = store_with_flags(&dir, MountFlags::empty());
        let obj = new_object(&store, FileKind::Regular);
        let file = obj.as_regular().unwrap();

        assert_eq!(file.write(0, b"hello world").unwrap(), 11);
        assert_eq!(file.read(0, 11), b"hello world");
        assert_eq!(file.read(6, 100), b"world");
        assert_eq!(file.read(11, 4), b"");
        assert_eq!(file.read(100, 4), b"");
    }

    #[test]
    fn test_sparse_write_zero_fills() {
        let dir = TempDir::new().unwrap();
        let store = store_with_flags(&dir, MountFlags::empty());
        let obj = new_object(&store, FileKind::Regular);
        let file = obj.as_regular().unwrap();

        file.write(4, b"x").unwrap();
        assert_eq!(file.len(), 5);
        assert_eq!(file.read(0, 5), b"\0\0\0\0x");
    }

    #[test]
    fn test_truncate_grows_and_shrinks() {
        let dir = TempDir::new().unwrap();
        let store = store_with_flags(&dir, MountFlags::empty());
        let obj = new_object(&store, FileKind::Regular);
        let file = obj.as_regular().unwrap();

        file.write(0, b"abcdef").unwrap();
        file.truncate(3).unwrap();
        assert_eq!(file.read(0, 10), b"abc");
        file.truncate(5).unwrap();
        assert_eq!(file.read(0, 10), b"abc\0\0");
    }

    #[test]
    fn test_flush_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let store = store_with_flags(&dir, MountFlags::empty());
        let obj = new_object(&store, FileKind::Regular);
        let id = obj.id();

        obj.as_regular().unwrap().write(0, b"durable").unwrap();
        obj.set_mode(libc::S_IFREG as u32 | 0o600);
        obj.flush().unwrap();

        let reopened = store.open_existing(&id).unwrap();
        assert_eq!(reopened.as_regular().unwrap().read(0, 16), b"durable");
        assert_eq!(reopened.get_mode(), libc::S_IFREG as u32 | 0o600);
    }

    #[test]
    fn test_directory_entries() {
        let dir = TempDir::new().unwrap();
        let store = store_with_flags(&dir, MountFlags::empty());
        let obj = new_object(&store, FileKind::Directory);
        let view = obj.as_directory().unwrap();
        let child = InodeId::random();

        assert!(view.is_empty());
        assert!(view.add_entry("a.txt", child, FileKind::Regular).unwrap());
        assert!(!view.add_entry("a.txt", InodeId::random(), FileKind::Regular).unwrap());
        assert_eq!(view.len(), 1);

        let entry = view.get_entry("a.txt").unwrap();
        assert_eq!(entry.id, child);
        assert_eq!(entry.kind, FileKind::Regular);

        view.remove_entry("a.txt").unwrap();
        assert!(matches!(view.remove_entry("a.txt"), Err(FsError::NoSuchFile)));
        assert!(view.is_empty());
    }

    #[test]
    fn test_directory_iteration_order_and_early_stop() {
        let dir = TempDir::new().unwrap();
        let store = store_with_flags(&dir, MountFlags::empty());
        let obj = new_object(&store, FileKind::Directory);
        let view = obj.as_directory().unwrap();

        for name in ["zeta", "alpha", "mid"] {
            view.add_entry(name, InodeId::random(), FileKind::Regular).unwrap();
        }

        let mut seen = Vec::new();
        view.iterate_over_entries(|name, _| {
            seen.push(name.to_string());
            true
        });
        assert_eq!(seen, ["alpha", "mid", "zeta"]);

        let mut count = 0;
        view.iterate_over_entries(|_, _| {
            count += 1;
            false
        });
        assert_eq!(count, 1);
    }

    #[test]
    fn test_entry_name_validation() {
        let dir = TempDir::new().unwrap();
        let store = store_with_flags(&dir, MountFlags::empty());
        let obj = new_object(&store, FileKind::Directory);
        let view = obj.as_directory().unwrap();

        assert!(view.add_entry("", InodeId::random(), FileKind::Regular).is_err());
        assert!(view.add_entry("a/b", InodeId::random(), FileKind::Regular).is_err());
    }

    #[test]
    fn test_symlink_target() {
        let dir = TempDir::new().unwrap();
        let store = store_with_flags(&dir, MountFlags::empty());
        let obj = new_object(&store, FileKind::Symlink);
        let link = obj.as_symlink().unwrap();

        assert_eq!(link.target(), "");
        link.set_target("/some/where").unwrap();
        assert_eq!(link.target(), "/some/where");
    }

    #[test]
    fn test_wrong_type_projection() {
        let dir = TempDir::new().unwrap();
        let store = store_with_flags(&dir, MountFlags::empty());
        let obj = new_object(&store, FileKind::Regular);

        assert!(obj.as_regular().is_ok());
        assert!(matches!(obj.as_directory(), Err(FsError::WrongType { .. })));
        assert!(matches!(obj.as_symlink(), Err(FsError::WrongType { .. })));
    }

    #[test]
    fn test_unlink_semantics() {
        let dir = TempDir::new().unwrap();
        let store = store_with_flags(&dir, MountFlags::empty());

        let file = new_object(&store, FileKind::Regular);
        file.set_nlink(2);
        file.unlink();
        assert!(!file.is_unlinked());
        file.unlink();
        assert!(file.is_unlinked());

        let d = new_object(&store, FileKind::Directory);
        d.unlink();
        assert!(d.is_unlinked());
    }

    #[test]
    fn test_utimens_respects_store_time_flag() {
        let dir = TempDir::new().unwrap();

        let stored = store_with_flags(&dir, MountFlags::STORE_TIME);
        let obj = new_object(&stored, FileKind::Regular);
        let t = TimeSpec { secs: 1_000_000, nanos: 42 };
        obj.utimens(Some(t), Some(t)).unwrap();
        let st = obj.stat().unwrap();
        assert_eq!(st.atime, t);
        assert_eq!(st.mtime, t);

        let dir2 = TempDir::new().unwrap();
        let plain = store_with_flags(&dir2, MountFlags::empty());
        let obj = new_object(&plain, FileKind::Regular);
        obj.utimens(Some(t), Some(t)).unwrap();
        assert_ne!(obj.stat().unwrap().mtime, t);
    }

    #[test]
    fn test_timespec_conversion() {
        let now = SystemTime::now();
        let ts = TimeSpec::from_system_time(now);
        let back = ts.to_system_time();
        let drift = now.duration_since(back).unwrap_or_default();
        assert!(drift < Duration::from_secs(1));
    }
}
