//! Kernel file-handle table.
//!
//! `open`/`opendir`/`create` publish the raw inode object as the `fh` value
//! of the kernel reply; every subsequent read/write/flush/release resolves
//! the handle back here. The table owns the reference the guard released, so
//! an object with an open kernel handle can never be evicted out from under
//! the kernel.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use sealfs_core::FileObject;

/// Maps kernel `fh` values to inode objects.
///
/// Handle ids start at 1; 0 is reserved for the invalid handle.
pub struct HandleTable {
    handles: DashMap<u64, Arc<FileObject>>,
    next: AtomicU64,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            handles: DashMap::new(),
            next: AtomicU64::new(1),
        }
    }

    /// Stores `object` and returns its handle id.
    pub fn insert(&self, object: Arc<FileObject>) -> u64 {
        let mut object = Some(object);
        loop {
            let fh = self.next.fetch_add(1, Ordering::Relaxed);
            if fh == 0 {
                continue;
            }
            if let Entry::Vacant(slot) = self.handles.entry(fh) {
                slot.insert(object.take().expect("object inserted twice"));
                return fh;
            }
        }
    }

    pub fn get(&self, fh: u64) -> Option<Arc<FileObject>> {
        self.handles.get(&fh).map(|entry| Arc::clone(&entry))
    }

    pub fn remove(&self, fh: u64) -> Option<Arc<FileObject>> {
        self.handles.remove(&fh).map(|(_, object)| object)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sealfs_core::{FileKind, FileTable, InodeId, MountFlags};
    use tempfile::TempDir;

    fn test_object(table: &FileTable) -> Arc<FileObject> {
        let id = InodeId::random();
        let object = table.create_as(id, FileKind::Regular).unwrap();
        object.initialize_empty(0o644, 0, 0).unwrap();
        object
    }

    #[test]
    fn test_insert_get_remove() {
        let dir = TempDir::new().unwrap();
        let table = FileTable::new(dir.path(), &[8u8; 32], MountFlags::empty()).unwrap();
        let handles = HandleTable::new();

        let object = test_object(&table);
        let fh = handles.insert(Arc::clone(&object));
        assert!(fh > 0);
        assert_eq!(handles.len(), 1);

        let fetched = handles.get(fh).unwrap();
        assert!(Arc::ptr_eq(&fetched, &object));

        let removed = handles.remove(fh).unwrap();
        assert!(Arc::ptr_eq(&removed, &object));
        assert!(handles.is_empty());
        assert!(handles.get(fh).is_none());

        table.close(&object);
    }

    #[test]
    fn test_handles_are_unique() {
        let dir = TempDir::new().unwrap();
        let table = FileTable::new(dir.path(), &[8u8; 32], MountFlags::empty()).unwrap();
        let handles = HandleTable::new();

        let object = test_object(&table);
        let mut seen = Vec::new();
        for _ in 0..32 {
            seen.push(handles.insert(Arc::clone(&object)));
        }
        let mut sorted = seen.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), seen.len());

        for fh in seen {
            handles.remove(fh);
        }
        table.close(&object);
    }
}
