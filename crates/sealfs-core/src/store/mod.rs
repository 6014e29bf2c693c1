//! On-disk layout and factory for encrypted object pairs.
//!
//! Each inode is persisted as two files beneath the vault root, both sealed
//! with the vault's payload cipher:
//!
//! - `<shard>/<hex>.data` - file content, directory entry table, or symlink
//!   target;
//! - `<shard>/<hex>.meta` - the serialized [`MetaRecord`](meta::MetaRecord).
//!
//! The store is the only component that touches these paths. It hands out
//! [`FileObject`]s and performs the raw read/write/remove operations the
//! objects delegate back to; it never interprets content bytes itself.

pub mod meta;
pub mod payload;

use std::ffi::CString;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{FsError, FsResult};
use crate::file::{FileKind, FileObject};
use crate::flags::MountFlags;
use crate::id::InodeId;

use meta::MetaRecord;
use payload::{PayloadCipher, PayloadDomain};

/// Factory and raw I/O layer for the encrypted file pairs of a vault.
///
/// Cheap to clone; all clones share the payload cipher and root path.
#[derive(Clone)]
pub struct FileStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    root: PathBuf,
    cipher: PayloadCipher,
    store_time: bool,
}

impl FileStore {
    /// Opens (or lays down) a store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>, master_key: &[u8; 32], flags: MountFlags) -> FsResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            inner: Arc::new(StoreInner {
                root,
                cipher: PayloadCipher::new(
                    master_key,
                    !flags.contains(MountFlags::NO_AUTHENTICATION),
                ),
                store_time: flags.contains(MountFlags::STORE_TIME),
            }),
        })
    }

    pub fn store_time(&self) -> bool {
        self.inner.store_time
    }

    fn data_path(&self, id: &InodeId) -> PathBuf {
        self.inner.root.join(id.shard_path()).with_extension("data")
    }

    fn meta_path(&self, id: &InodeId) -> PathBuf {
        self.inner.root.join(id.shard_path()).with_extension("meta")
    }

    /// Whether the on-disk pair for `id` is present.
    pub fn exists(&self, id: &InodeId) -> bool {
        self.data_path(id).is_file()
    }

    /// Opens the existing pair for `id`.
    ///
    /// Fails with `NoSuchFile` when the pair is absent.
    pub fn open_existing(&self, id: &InodeId) -> FsResult<FileObject> {
        let meta_sealed = match fs::read(self.meta_path(id)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(FsError::NoSuchFile),
            Err(e) => return Err(e.into()),
        };
        let meta = MetaRecord::from_bytes(&self.inner.cipher.open(
            id,
            PayloadDomain::Metadata,
            &meta_sealed,
        )?)?;
        let data_sealed = match fs::read(self.data_path(id)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(FsError::NoSuchFile),
            Err(e) => return Err(e.into()),
        };
        let content = self
            .inner
            .cipher
            .open(id, PayloadDomain::Content, &data_sealed)?;
        FileObject::from_store(*id, self.clone(), meta, &content)
    }

    /// Creates a fresh pair for `id` and returns the object over it.
    ///
    /// Fails with `Exists` when a pair for `id` is already on disk.
    pub fn create_new(&self, id: &InodeId, kind: FileKind) -> FsResult<FileObject> {
        let data_path = self.data_path(id);
        if let Some(parent) = data_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = FileObject::empty_content(kind);
        let sealed = self
            .inner
            .cipher
            .seal(id, PayloadDomain::Content, &content)?;
        let mut data_file = match OpenOptions::new().write(true).create_new(true).open(&data_path)
        {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Err(FsError::Exists),
            Err(e) => return Err(e.into()),
        };
        data_file.write_all(&sealed)?;

        let meta = MetaRecord::new(kind);
        self.write_meta(id, &meta)?;

        FileObject::from_store(*id, self.clone(), meta, &content)
    }

    /// Re-seals and rewrites the data file for `id`.
    pub fn write_data(&self, id: &InodeId, plaintext: &[u8]) -> FsResult<()> {
        let sealed = self
            .inner
            .cipher
            .seal(id, PayloadDomain::Content, plaintext)?;
        fs::write(self.data_path(id), sealed)?;
        Ok(())
    }

    /// Re-seals and rewrites the metadata file for `id`.
    pub fn write_meta(&self, id: &InodeId, meta: &MetaRecord) -> FsResult<()> {
        let sealed = self
            .inner
            .cipher
            .seal(id, PayloadDomain::Metadata, &meta.to_bytes()?)?;
        fs::write(self.meta_path(id), sealed)?;
        Ok(())
    }

    /// OS-level modification time of the data file, for mounts that do not
    /// persist timestamps.
    pub fn data_mtime(&self, id: &InodeId) -> FsResult<std::time::SystemTime> {
        Ok(fs::metadata(self.data_path(id))?.modified()?)
    }

    /// Pushes both files of the pair to stable storage.
    pub fn sync_pair(&self, id: &InodeId) -> FsResult<()> {
        fs::File::open(self.data_path(id))?.sync_all()?;
        fs::File::open(self.meta_path(id))?.sync_all()?;
        Ok(())
    }

    /// Deletes the on-disk pair for `id`.
    ///
    /// An already-missing file is not an error; deletion happens after the
    /// logical namespace removal, which must not be rolled back.
    pub fn remove(&self, id: &InodeId) -> FsResult<()> {
        for path in [self.data_path(id), self.meta_path(id)] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Filesystem statistics of the volume backing the vault root.
    pub fn statvfs(&self) -> FsResult<StatVfs> {
        let path = CString::new(self.inner.root.as_os_str().as_bytes())
            .map_err(|_| FsError::InvalidArgument("vault root contains NUL"))?;
        let mut vfs: libc::statvfs = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::statvfs(path.as_ptr(), &mut vfs) };
        if rc != 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(StatVfs {
            block_size: vfs.f_bsize as u32,
            fragment_size: vfs.f_frsize as u32,
            blocks: vfs.f_blocks as u64,
            blocks_free: vfs.f_bfree as u64,
            blocks_available: vfs.f_bavail as u64,
            files: vfs.f_files as u64,
            files_free: vfs.f_ffree as u64,
            name_max: vfs.f_namemax as u32,
        })
    }
}

/// Filesystem statistics forwarded from the backing volume.
#[derive(Debug, Clone, Copy)]
pub struct StatVfs {
    pub block_size: u32,
    pub fragment_size: u32,
    pub blocks: u64,
    pub blocks_free: u64,
    pub blocks_available: u64,
    pub files: u64,
    pub files_free: u64,
    pub name_max: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_store(dir: &TempDir) -> FileStore {
        FileStore::new(dir.path(), &[3u8; 32], MountFlags::empty()).unwrap()
    }

    #[test]
    fn test_create_then_open() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let id = InodeId::random();

        let created = store.create_new(&id, FileKind::Regular).unwrap();
        assert_eq!(created.kind(), FileKind::Regular);
        assert!(store.exists(&id));

        let reopened = store.open_existing(&id).unwrap();
        assert_eq!(reopened.kind(), FileKind::Regular);
        assert_eq!(reopened.id(), id);
    }

    #[test]
    fn test_create_twice_fails() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let id = InodeId::random();

        store.create_new(&id, FileKind::Regular).unwrap();
        assert!(matches!(
            store.create_new(&id, FileKind::Regular),
            Err(FsError::Exists)
        ));
    }

    #[test]
    fn test_open_missing_fails() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        assert!(matches!(
            store.open_existing(&InodeId::random()),
            Err(FsError::NoSuchFile)
        ));
    }

    #[test]
    fn test_remove_deletes_pair() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let id = InodeId::random();

        store.create_new(&id, FileKind::Directory).unwrap();
        assert!(store.exists(&id));
        store.remove(&id).unwrap();
        assert!(!store.exists(&id));
        // Idempotent.
        store.remove(&id).unwrap();
    }

    #[test]
    fn test_wrong_key_is_corruption() {
        let dir = TempDir::new().unwrap();
        let id = InodeId::random();
        test_store(&dir).create_new(&id, FileKind::Regular).unwrap();

        let other = FileStore::new(dir.path(), &[4u8; 32], MountFlags::empty()).unwrap();
        assert!(matches!(other.open_existing(&id), Err(FsError::Crypto(_))));
    }

    #[test]
    fn test_statvfs_reports_volume() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let vfs = store.statvfs().unwrap();
        assert!(vfs.block_size > 0);
        assert!(vfs.blocks > 0);
    }
}
