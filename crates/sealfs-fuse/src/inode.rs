//! Kernel inode number bookkeeping.
//!
//! The path-based operations know nothing about kernel inode numbers, so the
//! FUSE bridge keeps a bidirectional mapping between the `u64` inodes it
//! hands to the kernel and the textual paths the operations consume, with
//! `nlookup` counting for correct `forget` handling.
//!
//! Entries are only evicted when the kernel says so: a deleted or renamed
//! path invalidates the path-to-inode direction immediately, but the
//! inode-to-path entry stays until the matching `forget`, because the kernel
//! may keep using the number from its dcache.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// The root inode number (FUSE convention).
pub const ROOT_INODE: u64 = 1;

struct InoEntry {
    path: String,
    nlookup: AtomicU64,
}

/// Bidirectional inode-number/path table.
pub struct InoTable {
    by_ino: DashMap<u64, InoEntry>,
    by_path: DashMap<String, u64>,
    next: AtomicU64,
}

impl InoTable {
    pub fn new() -> Self {
        let table = Self {
            by_ino: DashMap::new(),
            by_path: DashMap::new(),
            next: AtomicU64::new(ROOT_INODE + 1),
        };
        table.by_ino.insert(
            ROOT_INODE,
            InoEntry {
                path: "/".to_string(),
                nlookup: AtomicU64::new(1),
            },
        );
        table.by_path.insert("/".to_string(), ROOT_INODE);
        table
    }

    /// Inode for `path`, allocating one if needed; bumps `nlookup`.
    ///
    /// Use for replies that the kernel will pair with a `forget` (lookup,
    /// create, mkdir, symlink, link).
    pub fn get_or_insert(&self, path: &str) -> u64 {
        self.get_or_insert_with_count(path, 1)
    }

    /// Inode for `path` without touching `nlookup`; readdir entries do not
    /// count as kernel references.
    pub fn peek_or_insert(&self, path: &str) -> u64 {
        self.get_or_insert_with_count(path, 0)
    }

    fn get_or_insert_with_count(&self, path: &str, count: u64) -> u64 {
        if let Some(ino) = self.by_path.get(path).map(|r| *r) {
            if count > 0 {
                if let Some(entry) = self.by_ino.get(&ino) {
                    entry.nlookup.fetch_add(count, Ordering::Relaxed);
                }
            }
            return ino;
        }
        // Entry API avoids double allocation when two threads race on the
        // same fresh path.
        *self.by_path.entry(path.to_string()).or_insert_with(|| {
            let ino = self.next.fetch_add(1, Ordering::Relaxed);
            self.by_ino.insert(
                ino,
                InoEntry {
                    path: path.to_string(),
                    nlookup: AtomicU64::new(count),
                },
            );
            ino
        })
    }

    pub fn path_of(&self, ino: u64) -> Option<String> {
        self.by_ino.get(&ino).map(|entry| entry.path.clone())
    }

    /// Drops `count` kernel references; evicts the entry when none remain.
    pub fn forget(&self, ino: u64, count: u64) {
        if ino == ROOT_INODE {
            return;
        }
        let evict = match self.by_ino.get(&ino) {
            Some(entry) => {
                let before = entry.nlookup.fetch_sub(count, Ordering::AcqRel);
                before <= count
            }
            None => return,
        };
        if evict {
            if let Some((_, entry)) = self.by_ino.remove(&ino) {
                self.by_path.remove_if(&entry.path, |_, mapped| *mapped == ino);
            }
        }
    }

    /// Unbinds `path` after a delete. The inode entry itself survives until
    /// the kernel forgets it.
    pub fn invalidate_path(&self, path: &str) {
        self.by_path.remove(path);
    }

    /// Rewrites `old` and every path below it to live under `new`.
    pub fn rename_tree(&self, old: &str, new: &str) {
        let descendant_prefix = format!("{}/", old.trim_end_matches('/'));
        let moved: Vec<(u64, String)> = self
            .by_ino
            .iter()
            .filter(|item| item.path == old || item.path.starts_with(&descendant_prefix))
            .map(|item| (*item.key(), item.path.clone()))
            .collect();

        for (ino, old_path) in moved {
            let new_path = format!("{}{}", new, &old_path[old.len()..]);
            self.by_path.remove_if(&old_path, |_, mapped| *mapped == ino);
            if let Some(mut entry) = self.by_ino.get_mut(&ino) {
                entry.path = new_path.clone();
            }
            self.by_path.insert(new_path, ino);
        }
    }

    pub fn len(&self) -> usize {
        self.by_ino.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_ino.len() <= 1
    }
}

impl Default for InoTable {
    fn default() -> Self {
        Self::new()
    }
}
