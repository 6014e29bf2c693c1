//! RAII ownership of opened inode objects.

use std::sync::Arc;

use crate::error::FsResult;
use crate::file::{DirectoryView, FileKind, FileObject, RegularView, SymlinkView};
use crate::id::InodeId;
use crate::table::FileTable;

/// Move-only owner of one table reference on an inode object.
///
/// Every object obtained from the [`FileTable`] must be returned on all exit
/// paths, including mid-operation failures; the guard does that on drop.
/// [`release`](FileGuard::release) transfers the raw object out (the kernel
/// file-handle path), after which the guard is spent.
pub struct FileGuard<'t> {
    table: &'t FileTable,
    object: Option<Arc<FileObject>>,
}

impl<'t> FileGuard<'t> {
    /// Adopts an object the caller already holds a table reference on.
    pub fn adopt(table: &'t FileTable, object: Arc<FileObject>) -> Self {
        Self {
            table,
            object: Some(object),
        }
    }

    /// Opens `id` through the table and wraps the result.
    pub fn open_as(table: &'t FileTable, id: InodeId, kind: FileKind) -> FsResult<Self> {
        Ok(Self::adopt(table, table.open_as(id, kind)?))
    }

    /// Creates `id` through the table and wraps the result.
    pub fn create_as(table: &'t FileTable, id: InodeId, kind: FileKind) -> FsResult<Self> {
        Ok(Self::adopt(table, table.create_as(id, kind)?))
    }

    pub fn get(&self) -> &FileObject {
        self.object.as_deref().expect("guard already released")
    }

    pub fn as_regular(&self) -> FsResult<RegularView<'_>> {
        self.get().as_regular()
    }

    pub fn as_directory(&self) -> FsResult<DirectoryView<'_>> {
        self.get().as_directory()
    }

    pub fn as_symlink(&self) -> FsResult<SymlinkView<'_>> {
        self.get().as_symlink()
    }

    /// Closes the current object and adopts `next` in its place.
    pub fn reset(&mut self, next: Option<Arc<FileObject>>) {
        if let Some(current) = self.object.take() {
            self.table.close(&current);
        }
        self.object = next;
    }

    /// Relinquishes ownership without returning the reference to the table.
    ///
    /// The caller becomes responsible for pairing this with a later
    /// [`adopt`](FileGuard::adopt)-and-drop (the kernel release path).
    pub fn release(mut self) -> Arc<FileObject> {
        self.object.take().expect("guard already released")
    }
}

impl Drop for FileGuard<'_> {
    /// Returns the reference to the table. `close` never panics and never
    /// propagates failures, so dropping a guard during unwinding is safe.
    fn drop(&mut self) {
        if let Some(object) = self.object.take() {
            self.table.close(&object);
        }
    }
}
