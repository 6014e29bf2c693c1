//! Per-mount filesystem context and path-resolution memo.
//!
//! The context is created at mount and destroyed at unmount; there is no
//! process-wide singleton. It owns exactly one [`FileTable`], the root inode
//! id, the flags word, and the two memo maps of the path walker:
//!
//! - `id_cache`: path prefix -> inode id, ordered so that a range scan
//!   enumerates all descendants of a prefix in key order;
//! - `id_reverse`: inode id -> the prefix that most recently produced an
//!   `id_cache` entry for it.
//!
//! The memo is advisory. A stale hit is revalidated by the next directory
//! read and a stale miss only costs one. Both maps sit behind a single
//! dedicated mutex that is never held across storage I/O.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use sealfs_core::{FileGuard, FileKind, FileTable, FsResult, InodeId, MountFlags};

#[derive(Default)]
struct PathMemo {
    id_cache: BTreeMap<String, InodeId>,
    id_reverse: HashMap<InodeId, String>,
}

/// Per-mount container for the file table, root id, flags, and memo.
pub struct FileSystemContext {
    table: FileTable,
    root_id: InodeId,
    flags: MountFlags,
    memo: Mutex<PathMemo>,
}

impl FileSystemContext {
    /// Opens a context over an existing vault.
    ///
    /// The root directory object is opened once to verify the key and the
    /// recorded root id before any operation is accepted.
    pub fn new(
        root: impl Into<PathBuf>,
        master_key: &[u8; 32],
        flags: MountFlags,
        root_id: InodeId,
    ) -> FsResult<Self> {
        let table = FileTable::new(root, master_key, flags)?;
        FileGuard::open_as(&table, root_id, FileKind::Directory)?;
        Ok(Self {
            table,
            root_id,
            flags,
            memo: Mutex::new(PathMemo::default()),
        })
    }

    /// Lays down a fresh vault: creates the root directory object under a
    /// newly generated root id and returns the ready context.
    pub fn initialize(
        root: impl Into<PathBuf>,
        master_key: &[u8; 32],
        flags: MountFlags,
        uid: u32,
        gid: u32,
    ) -> FsResult<Self> {
        let table = FileTable::new(root, master_key, flags)?;
        let root_id = InodeId::random();
        let guard = FileGuard::create_as(&table, root_id, FileKind::Directory)?;
        guard
            .get()
            .initialize_empty(FileKind::Directory.mode_bits() | 0o755, uid, gid)?;
        drop(guard);
        Ok(Self {
            table,
            root_id,
            flags,
            memo: Mutex::new(PathMemo::default()),
        })
    }

    pub fn table(&self) -> &FileTable {
        &self.table
    }

    pub fn root_id(&self) -> InodeId {
        self.root_id
    }

    pub fn flags(&self) -> MountFlags {
        self.flags
    }

    pub fn is_readonly(&self) -> bool {
        self.table.is_readonly()
    }

    pub fn case_fold(&self) -> bool {
        self.flags.contains(MountFlags::CASE_FOLD)
    }

    /// Canonical memo key for a textual path: case-folded when the mount
    /// requires it, empty components dropped, leading `/`, no trailing `/`.
    /// The root canonicalizes to the empty string.
    pub fn canonicalize(&self, path: &str) -> String {
        let folded;
        let path = if self.case_fold() {
            folded = path.to_lowercase();
            folded.as_str()
        } else {
            path
        };
        let mut canonical = String::new();
        for component in path.split('/').filter(|c| !c.is_empty()) {
            canonical.push('/');
            canonical.push_str(component);
        }
        canonical
    }

    fn lock_memo(&self) -> MutexGuard<'_, PathMemo> {
        self.memo.lock().expect("path memo lock poisoned")
    }

    /// Memoized id for a canonical prefix, if any.
    pub fn lookup_cached(&self, prefix: &str) -> Option<InodeId> {
        self.lock_memo().id_cache.get(prefix).copied()
    }

    /// Records that `prefix` resolved to `id` during a successful walk.
    pub fn remember(&self, prefix: &str, id: InodeId) {
        let mut memo = self.lock_memo();
        memo.id_cache.insert(prefix.to_string(), id);
        memo.id_reverse.insert(id, prefix.to_string());
    }

    /// Drops every memo entry whose key starts with `path`.
    ///
    /// `id_cache` iterates in key order, so the affected entries form one
    /// contiguous range starting at `path` and the scan stops at the first
    /// non-matching key.
    pub fn clear_cache_path(&self, path: &str) {
        let mut memo = self.lock_memo();
        let stale: Vec<String> = memo
            .id_cache
            .range(path.to_string()..)
            .take_while(|(key, _)| key.starts_with(path))
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            if let Some(id) = memo.id_cache.remove(&key) {
                if memo.id_reverse.get(&id).is_some_and(|p| *p == key) {
                    memo.id_reverse.remove(&id);
                }
            }
        }
    }

    /// Drops the memo entries for the prefix that produced `id`, and all of
    /// its descendants.
    pub fn clear_cache_id(&self, id: &InodeId) {
        let prefix = self.lock_memo().id_reverse.get(id).cloned();
        if let Some(prefix) = prefix {
            self.clear_cache_path(&prefix);
        }
    }

    /// Number of memoized prefixes; diagnostic only.
    pub fn memo_len(&self) -> usize {
        self.lock_memo().id_cache.len()
    }
}
