//! Identity and lifetime cache over inode objects.
//!
//! The table guarantees that at any instant there is at most one live
//! [`FileObject`] per inode id, across every operation thread. Objects are
//! reference-counted by the table itself (not by `Arc` strong counts, which
//! also include transient clones) so that the moment an id goes cold is
//! observable under the table lock.
//!
//! # Eviction
//!
//! Eviction is two-staged. A zero-refcount object first parks in the `live`
//! map with its id queued on `closed_ids`, where a reopen can revive it for
//! free. Only when the queue reaches [`MAX_NUM_CLOSED`] are the oldest
//! [`NUM_EJECT`] ids moved to the `closing` set and handed to the
//! [`Finalizer`], which performs the flush (and, for unlinked inodes, the
//! deletion of the on-disk pair) off the caller thread.
//!
//! The `closing` set has its own lock so that `open_as` can wait for an id
//! that is mid-finalization without stalling every other open behind the
//! finalizer.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::error::{FsError, FsResult};
use crate::file::{FileKind, FileObject};
use crate::finalizer::Finalizer;
use crate::flags::MountFlags;
use crate::id::InodeId;
use crate::store::{FileStore, StatVfs};

/// Queue length at which the table ejects cold objects.
pub const MAX_NUM_CLOSED: usize = 201;
/// How many of the oldest cold objects one ejection pass removes.
pub const NUM_EJECT: usize = 150;

struct LiveEntry {
    object: Arc<FileObject>,
    refcount: u32,
}

struct TableInner {
    live: HashMap<InodeId, LiveEntry>,
    closed_ids: VecDeque<InodeId>,
}

struct ClosingSet {
    objects: Mutex<HashMap<InodeId, Arc<FileObject>>>,
    done: Condvar,
}

/// The per-mount object cache.
pub struct FileTable {
    inner: Mutex<TableInner>,
    closing: Arc<ClosingSet>,
    store: FileStore,
    flags: MountFlags,
    finalizer: Finalizer,
}

impl FileTable {
    /// Builds a table over the vault rooted at `root`.
    pub fn new(root: impl Into<PathBuf>, master_key: &[u8; 32], flags: MountFlags) -> FsResult<Self> {
        Ok(Self::with_store(FileStore::new(root, master_key, flags)?, flags))
    }

    pub fn with_store(store: FileStore, flags: MountFlags) -> Self {
        Self {
            inner: Mutex::new(TableInner {
                live: HashMap::new(),
                closed_ids: VecDeque::new(),
            }),
            closing: Arc::new(ClosingSet {
                objects: Mutex::new(HashMap::new()),
                done: Condvar::new(),
            }),
            store,
            flags,
            finalizer: Finalizer::new(),
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, TableInner> {
        self.inner.lock().expect("file table lock poisoned")
    }

    fn lock_closing(&self) -> MutexGuard<'_, HashMap<InodeId, Arc<FileObject>>> {
        self.closing
            .objects
            .lock()
            .expect("closing set lock poisoned")
    }

    fn is_closing(&self, id: &InodeId) -> bool {
        self.lock_closing().contains_key(id)
    }

    fn wait_until_not_closing(&self, id: &InodeId) {
        let mut map = self.lock_closing();
        while map.contains_key(id) {
            map = self
                .closing
                .done
                .wait(map)
                .expect("closing set lock poisoned");
        }
    }

    /// Opens the object for `id`, expecting it to be of `kind`.
    ///
    /// Returns the already-live object (same `Arc`) if one exists; otherwise
    /// waits out any in-flight finalization of the id and instantiates the
    /// object from the store. Fails with `NoSuchFile` when the on-disk pair
    /// is absent and `WrongType` when the stored kind differs.
    pub fn open_as(&self, id: InodeId, kind: FileKind) -> FsResult<Arc<FileObject>> {
        loop {
            self.wait_until_not_closing(&id);
            let mut inner = self.lock_inner();

            if let Some(entry) = inner.live.get_mut(&id) {
                if entry.object.kind() != kind {
                    return Err(FsError::WrongType {
                        expected: kind.as_str(),
                    });
                }
                entry.refcount += 1;
                let revived = entry.refcount == 1;
                let object = Arc::clone(&entry.object);
                if revived {
                    // Revived a cold entry; it leaves the eviction queue so
                    // an id is queued at most once.
                    inner.closed_ids.retain(|closed| closed != &id);
                }
                return Ok(object);
            }

            // close() may have moved the id into the closing set between our
            // condvar wait and taking the table lock.
            if self.is_closing(&id) {
                continue;
            }

            let object = Arc::new(self.store.open_existing(&id)?);
            if object.kind() != kind {
                return Err(FsError::WrongType {
                    expected: kind.as_str(),
                });
            }
            inner.live.insert(
                id,
                LiveEntry {
                    object: Arc::clone(&object),
                    refcount: 1,
                },
            );
            return Ok(object);
        }
    }

    /// Creates the on-disk pair for `id` and returns the fresh object.
    ///
    /// Fails with `Exists` if the id is already known to the table or its
    /// files are already on disk.
    pub fn create_as(&self, id: InodeId, kind: FileKind) -> FsResult<Arc<FileObject>> {
        let mut inner = self.lock_inner();
        if inner.live.contains_key(&id) || self.is_closing(&id) {
            return Err(FsError::Exists);
        }
        let object = Arc::new(self.store.create_new(&id, kind)?);
        inner.live.insert(
            id,
            LiveEntry {
                object: Arc::clone(&object),
                refcount: 1,
            },
        );
        Ok(object)
    }

    /// Returns one reference on `object` to the table.
    ///
    /// When the last reference goes, the object either queues for deferred
    /// eviction or, if its inode has been unlinked, goes straight to the
    /// finalizer which deletes the on-disk pair. Never fails: bookkeeping
    /// anomalies are logged and swallowed, since callers (guard drops,
    /// kernel release) have no way to recover.
    pub fn close(&self, object: &Arc<FileObject>) {
        let id = object.id();
        let mut inner = self.lock_inner();

        let Some(entry) = inner.live.get_mut(&id) else {
            warn!(?id, "close of an object the table does not own");
            return;
        };
        if entry.refcount == 0 {
            warn!(?id, "unbalanced close");
            return;
        }
        entry.refcount -= 1;
        if entry.refcount > 0 {
            return;
        }

        if entry.object.is_unlinked() {
            // The live-to-closing transition happens under the table lock so
            // a concurrent open_as sees the id in exactly one of the two.
            let entry = inner.live.remove(&id).expect("entry observed above");
            inner.closed_ids.retain(|closed| closed != &id);
            self.submit_finalize(id, entry.object, true);
            return;
        }

        inner.closed_ids.push_back(id);
        if inner.closed_ids.len() >= MAX_NUM_CLOSED {
            self.eject(&mut inner);
        }
    }

    /// Moves the oldest cold ids to the finalizer. Ids that were reopened
    /// since they were queued are skipped.
    fn eject(&self, inner: &mut TableInner) {
        debug!(backlog = inner.closed_ids.len(), "ejecting cold objects");
        for _ in 0..NUM_EJECT {
            let Some(id) = inner.closed_ids.pop_front() else {
                break;
            };
            let still_cold = matches!(inner.live.get(&id), Some(entry) if entry.refcount == 0);
            if still_cold {
                let entry = inner.live.remove(&id).expect("entry observed above");
                let delete = entry.object.is_unlinked();
                self.submit_finalize(id, entry.object, delete);
            }
        }
    }

    /// Drains every cold object into the finalizer and waits for it to
    /// quiesce. Called at unmount and available on explicit request.
    pub fn gc(&self) {
        {
            let mut inner = self.lock_inner();
            while let Some(id) = inner.closed_ids.pop_front() {
                let still_cold = matches!(inner.live.get(&id), Some(entry) if entry.refcount == 0);
                if still_cold {
                    let entry = inner.live.remove(&id).expect("entry observed above");
                    let delete = entry.object.is_unlinked();
                    self.submit_finalize(id, entry.object, delete);
                }
            }
        }
        self.finalizer.wait_idle();
    }

    fn submit_finalize(&self, id: InodeId, object: Arc<FileObject>, delete: bool) {
        self.lock_closing().insert(id, Arc::clone(&object));
        let closing = Arc::clone(&self.closing);
        let store = self.store.clone();
        self.finalizer.submit(move || {
            if let Err(e) = object.flush() {
                warn!(?id, error = %e, "flush during finalization failed");
            }
            // The on-disk pair goes away only after the flush above; the
            // logical removal already happened in the directory entry.
            if delete {
                if let Err(e) = store.remove(&id) {
                    warn!(?id, error = %e, "deleting on-disk pair failed");
                }
            }
            let mut map = closing.objects.lock().expect("closing set lock poisoned");
            map.remove(&id);
            closing.done.notify_all();
        });
    }

    pub fn is_readonly(&self) -> bool {
        self.flags.contains(MountFlags::READ_ONLY)
    }

    pub fn is_auth_enabled(&self) -> bool {
        !self.flags.contains(MountFlags::NO_AUTHENTICATION)
    }

    pub fn is_time_stored(&self) -> bool {
        self.flags.contains(MountFlags::STORE_TIME)
    }

    pub fn flags(&self) -> MountFlags {
        self.flags
    }

    /// Statistics of the volume backing the vault.
    pub fn statfs(&self) -> FsResult<StatVfs> {
        self.store.statvfs()
    }

    pub fn store(&self) -> &FileStore {
        &self.store
    }

    /// Number of cold ids currently awaiting possible reopen.
    pub fn closed_backlog(&self) -> usize {
        self.lock_inner().closed_ids.len()
    }

    #[cfg(test)]
    fn closed_occurrences(&self, id: &InodeId) -> usize {
        self.lock_inner()
            .closed_ids
            .iter()
            .filter(|closed| *closed == id)
            .count()
    }

    #[cfg(test)]
    fn refcount(&self, id: &InodeId) -> Option<u32> {
        self.lock_inner().live.get(id).map(|entry| entry.refcount)
    }
}

impl Drop for FileTable {
    /// Tears the table down: every cold object passes through the finalizer
    /// and every still-referenced object (leaked kernel handles at unmount)
    /// is flushed in place. No object outlives the table.
    fn drop(&mut self) {
        self.gc();
        let mut inner = self.lock_inner();
        for (id, entry) in inner.live.drain() {
            if entry.refcount > 0 {
                warn!(?id, refcount = entry.refcount, "object still referenced at teardown");
            }
            if let Err(e) = entry.object.flush() {
                warn!(?id, error = %e, "flush at teardown failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_table(dir: &TempDir) -> FileTable {
        FileTable::new(dir.path(), &[1u8; 32], MountFlags::empty()).unwrap()
    }

    fn create_file(table: &FileTable, kind: FileKind) -> InodeId {
        let id = InodeId::random();
        let object = table.create_as(id, kind).unwrap();
        object
            .initialize_empty(kind.mode_bits() | 0o644, 0, 0)
            .unwrap();
        table.close(&object);
        id
    }

    #[test]
    fn test_open_missing_id() {
        let dir = TempDir::new().unwrap();
        let table = test_table(&dir);
        assert!(matches!(
            table.open_as(InodeId::random(), FileKind::Regular),
            Err(FsError::NoSuchFile)
        ));
    }

    #[test]
    fn test_create_then_reopen_is_same_object() {
        let dir = TempDir::new().unwrap();
        let table = test_table(&dir);
        let id = InodeId::random();

        let created = table.create_as(id, FileKind::Regular).unwrap();
        created.initialize_empty(0o644, 0, 0).unwrap();
        let reopened = table.open_as(id, FileKind::Regular).unwrap();
        assert!(Arc::ptr_eq(&created, &reopened));

        table.close(&created);
        table.close(&reopened);
    }

    #[test]
    fn test_cold_entry_revived_with_same_object() {
        let dir = TempDir::new().unwrap();
        let table = test_table(&dir);
        let id = create_file(&table, FileKind::Regular);

        let first = table.open_as(id, FileKind::Regular).unwrap();
        table.close(&first);
        // Cold but not ejected: the reopen must observe the same object.
        let second = table.open_as(id, FileKind::Regular).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        table.close(&second);
    }

    #[test]
    fn test_create_duplicate_id_fails() {
        let dir = TempDir::new().unwrap();
        let table = test_table(&dir);
        let id = InodeId::random();

        let object = table.create_as(id, FileKind::Regular).unwrap();
        assert!(matches!(
            table.create_as(id, FileKind::Regular),
            Err(FsError::Exists)
        ));
        table.close(&object);
    }

    #[test]
    fn test_wrong_kind_rejected() {
        let dir = TempDir::new().unwrap();
        let table = test_table(&dir);
        let id = create_file(&table, FileKind::Regular);

        assert!(matches!(
            table.open_as(id, FileKind::Directory),
            Err(FsError::WrongType { .. })
        ));
        // The failed open must not leave a reference behind.
        let object = table.open_as(id, FileKind::Regular).unwrap();
        assert_eq!(table.refcount(&id), Some(1));
        table.close(&object);
    }

    #[test]
    fn test_balanced_open_close_queues_id_once() {
        let dir = TempDir::new().unwrap();
        let table = test_table(&dir);
        let id = create_file(&table, FileKind::Regular);

        let handles: Vec<_> = (0..3)
            .map(|_| table.open_as(id, FileKind::Regular).unwrap())
            .collect();
        assert_eq!(table.refcount(&id), Some(3));
        assert_eq!(table.closed_occurrences(&id), 0);

        for handle in &handles {
            table.close(handle);
        }
        assert_eq!(table.refcount(&id), Some(0));
        assert_eq!(table.closed_occurrences(&id), 1);
    }

    #[test]
    fn test_eviction_bounds_backlog() {
        let dir = TempDir::new().unwrap();
        let table = test_table(&dir);

        // Scenario: open 400 distinct files, close them all.
        let ids: Vec<_> = (0..400)
            .map(|_| create_file(&table, FileKind::Regular))
            .collect();
        for id in &ids {
            let object = table.open_as(*id, FileKind::Regular).unwrap();
            table.close(&object);
        }
        assert!(table.closed_backlog() < MAX_NUM_CLOSED);

        // Every ejected object must still be reachable from disk.
        table.gc();
        assert_eq!(table.closed_backlog(), 0);
        for id in &ids {
            let object = table.open_as(*id, FileKind::Regular).unwrap();
            table.close(&object);
        }
    }

    #[test]
    fn test_unlinked_close_deletes_pair() {
        let dir = TempDir::new().unwrap();
        let table = test_table(&dir);
        let id = create_file(&table, FileKind::Regular);

        let object = table.open_as(id, FileKind::Regular).unwrap();
        object.unlink();
        assert!(table.store().exists(&id));
        table.close(&object);
        table.gc();

        assert!(!table.store().exists(&id));
        assert!(matches!(
            table.open_as(id, FileKind::Regular),
            Err(FsError::NoSuchFile)
        ));
    }

    #[test]
    fn test_unlinked_survives_while_still_referenced() {
        let dir = TempDir::new().unwrap();
        let table = test_table(&dir);
        let id = create_file(&table, FileKind::Regular);

        let first = table.open_as(id, FileKind::Regular).unwrap();
        let second = table.open_as(id, FileKind::Regular).unwrap();
        first.unlink();
        table.close(&first);

        // One reference remains: the pair must still exist and be readable.
        assert!(table.store().exists(&id));
        second.as_regular().unwrap().write(0, b"still here").unwrap();
        table.close(&second);
        table.gc();
        assert!(!table.store().exists(&id));
    }

    #[test]
    fn test_gc_flushes_dirty_cold_objects() {
        let dir = TempDir::new().unwrap();
        let table = test_table(&dir);
        let id = create_file(&table, FileKind::Regular);

        let object = table.open_as(id, FileKind::Regular).unwrap();
        object.as_regular().unwrap().write(0, b"persisted").unwrap();
        table.close(&object);
        table.gc();

        let reopened = table.store().open_existing(&id).unwrap();
        assert_eq!(reopened.as_regular().unwrap().read(0, 16), b"persisted");
    }

    #[test]
    fn test_reopen_races_with_ejection() {
        let dir = TempDir::new().unwrap();
        let table = test_table(&dir);
        let hot = create_file(&table, FileKind::Regular);

        // Repeatedly push the table over the ejection threshold while
        // reopening one id; the reopen must always succeed, either reviving
        // the cold entry or waiting out the finalizer.
        for _ in 0..3 {
            for _ in 0..MAX_NUM_CLOSED {
                let id = create_file(&table, FileKind::Regular);
                let object = table.open_as(id, FileKind::Regular).unwrap();
                table.close(&object);
            }
            let object = table.open_as(hot, FileKind::Regular).unwrap();
            table.close(&object);
        }
    }

    #[test]
    fn test_concurrent_open_close_single_id() {
        use std::thread;

        let dir = TempDir::new().unwrap();
        let table = Arc::new(test_table(&dir));
        let id = create_file(&table, FileKind::Regular);

        // Keep one anchor reference so the object stays live throughout.
        let anchor = table.open_as(id, FileKind::Regular).unwrap();

        let mut threads = vec![];
        for _ in 0..8 {
            let table = Arc::clone(&table);
            let anchor = Arc::clone(&anchor);
            threads.push(thread::spawn(move || {
                for _ in 0..200 {
                    let object = table.open_as(id, FileKind::Regular).unwrap();
                    assert!(Arc::ptr_eq(&object, &anchor));
                    table.close(&object);
                }
            }));
        }
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(table.refcount(&id), Some(1));
        table.close(&anchor);
        assert_eq!(table.refcount(&id), Some(0));
        assert_eq!(table.closed_occurrences(&id), 1);
    }

    #[test]
    fn test_flag_queries() {
        let dir = TempDir::new().unwrap();
        let flags = MountFlags::READ_ONLY | MountFlags::STORE_TIME;
        let table = FileTable::new(dir.path(), &[1u8; 32], flags).unwrap();
        assert!(table.is_readonly());
        assert!(table.is_time_stored());
        assert!(table.is_auth_enabled());
    }

    #[test]
    fn test_statfs_forwarded() {
        let dir = TempDir::new().unwrap();
        let table = test_table(&dir);
        assert!(table.statfs().unwrap().block_size > 0);
    }
}
