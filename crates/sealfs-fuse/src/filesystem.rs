//! `fuser::Filesystem` implementation.
//!
//! The kernel speaks inode numbers and file handles; the operations in
//! [`ops`](crate::ops) speak textual paths and scoped guards. This module
//! carries the translation:
//!
//! - [`InoTable`] maps kernel inode numbers to paths (with `nlookup`
//!   bookkeeping for `forget`);
//! - [`HandleTable`] keeps the objects released from their guards alive for
//!   the duration of a kernel open/release window;
//! - every callback converts failures to a negative errno via
//!   [`FsError::to_errno`].
//!
//! Reported uid/gid are those of the mounting process, not the stored ones;
//! the vault is a single-user container.

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
    TimeOrNow,
};
use libc::c_int;
use std::ffi::OsStr;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, trace};

use sealfs_core::{FileGuard, FileKind, FileStat, FsError, TimeSpec};

use crate::context::FileSystemContext;
use crate::handles::HandleTable;
use crate::inode::{InoTable, ROOT_INODE};
use crate::ops;

/// How long the kernel may cache attributes and entries.
const ATTR_TTL: Duration = Duration::from_secs(1);

/// Block size reported in attributes.
const BLOCK_SIZE: u32 = 4096;

/// The mounted filesystem.
pub struct SealFs {
    ctx: FileSystemContext,
    inodes: InoTable,
    handles: HandleTable,
    uid: u32,
    gid: u32,
}

impl SealFs {
    pub fn new(ctx: FileSystemContext) -> Self {
        Self {
            ctx,
            inodes: InoTable::new(),
            handles: HandleTable::new(),
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
        }
    }

    pub fn context(&self) -> &FileSystemContext {
        &self.ctx
    }

    fn path_of(&self, ino: u64) -> Result<String, c_int> {
        self.inodes.path_of(ino).ok_or(libc::ENOENT)
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Result<String, c_int> {
        let parent_path = self.path_of(parent)?;
        let name = name.to_str().ok_or(libc::EINVAL)?;
        if name.contains('/') {
            return Err(libc::EINVAL);
        }
        let name = if self.ctx.case_fold() {
            name.to_lowercase()
        } else {
            name.to_string()
        };
        Ok(join_path(&parent_path, &name))
    }

    fn make_attr(&self, ino: u64, st: &FileStat) -> FileAttr {
        FileAttr {
            ino,
            size: st.size,
            blocks: st.blocks,
            atime: st.atime.to_system_time(),
            mtime: st.mtime.to_system_time(),
            ctime: st.ctime.to_system_time(),
            crtime: st.ctime.to_system_time(),
            kind: file_type(st.kind),
            perm: (st.mode & 0o7777) as u16,
            nlink: st.nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }

    /// Resolves `path`, allocates (or bumps) its inode number, and builds
    /// the entry attributes. Shared by lookup/create/mkdir/symlink/link.
    fn entry_for(&self, path: &str) -> Result<(u64, FileAttr), FsError> {
        let st = ops::getattr(&self.ctx, path)?;
        let ino = self.inodes.get_or_insert(path);
        Ok((ino, self.make_attr(ino, &st)))
    }
}

fn join_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

fn parent_of(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

fn file_type(kind: FileKind) -> FileType {
    match kind {
        FileKind::Regular => FileType::RegularFile,
        FileKind::Directory => FileType::Directory,
        FileKind::Symlink => FileType::Symlink,
    }
}

fn timespec_of(t: TimeOrNow) -> TimeSpec {
    match t {
        TimeOrNow::SpecificTime(st) => TimeSpec::from_system_time(st),
        TimeOrNow::Now => TimeSpec::now(),
    }
}

/// Logs and converts an operation failure. ENOENT probes are routine and
/// stay at trace level.
fn errno(op: &'static str, e: &FsError) -> c_int {
    let errno = e.to_errno();
    if errno == libc::ENOENT {
        trace!(op, "target absent");
    } else {
        debug!(op, error = %e, "operation failed");
    }
    errno
}

impl Filesystem for SealFs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        info!(readonly = self.ctx.is_readonly(), "filesystem mounted");
        Ok(())
    }

    fn destroy(&mut self) {
        // Drain every cold object before the table is torn down.
        self.ctx.table().gc();
        info!("filesystem unmounted");
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let path = match self.child_path(parent, name) {
            Ok(path) => path,
            Err(e) => return reply.error(e),
        };
        match self.entry_for(&path) {
            Ok((_, attr)) => reply.entry(&ATTR_TTL, &attr, 0),
            Err(e) => reply.error(errno("lookup", &e)),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.inodes.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(e) => return reply.error(e),
        };
        match ops::getattr(&self.ctx, &path) {
            Ok(st) => reply.attr(&ATTR_TTL, &self.make_attr(ino, &st)),
            Err(e) => reply.error(errno("getattr", &e)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<std::time::SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<std::time::SystemTime>,
        _chgtime: Option<std::time::SystemTime>,
        _bkuptime: Option<std::time::SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(e) => return reply.error(e),
        };

        if let Some(mode) = mode {
            if let Err(e) = ops::chmod(&self.ctx, &path, mode) {
                return reply.error(errno("setattr", &e));
            }
        }
        if uid.is_some() || gid.is_some() {
            if let Err(e) = ops::chown(&self.ctx, &path, uid, gid) {
                return reply.error(errno("setattr", &e));
            }
        }
        if let Some(size) = size {
            if let Err(e) = ops::truncate(&self.ctx, &path, size) {
                return reply.error(errno("setattr", &e));
            }
        }
        if atime.is_some() || mtime.is_some() {
            if let Err(e) = ops::utimens(
                &self.ctx,
                &path,
                atime.map(timespec_of),
                mtime.map(timespec_of),
            ) {
                return reply.error(errno("setattr", &e));
            }
        }

        match ops::getattr(&self.ctx, &path) {
            Ok(st) => reply.attr(&ATTR_TTL, &self.make_attr(ino, &st)),
            Err(e) => reply.error(errno("setattr", &e)),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(e) => return reply.error(e),
        };
        match ops::readlink(&self.ctx, &path) {
            Ok(target) => reply.data(target.as_bytes()),
            Err(e) => reply.error(errno("readlink", &e)),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let path = match self.child_path(parent, name) {
            Ok(path) => path,
            Err(e) => return reply.error(e),
        };
        let mode = (mode & !(libc::S_IFMT as u32)) | FileKind::Directory.mode_bits();
        if let Err(e) = ops::create(
            &self.ctx,
            &path,
            FileKind::Directory,
            mode,
            req.uid(),
            req.gid(),
        ) {
            return reply.error(errno("mkdir", &e));
        }
        match self.entry_for(&path) {
            Ok((_, attr)) => reply.entry(&ATTR_TTL, &attr, 0),
            Err(e) => reply.error(errno("mkdir", &e)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child_path(parent, name) {
            Ok(path) => path,
            Err(e) => return reply.error(e),
        };
        match ops::remove(&self.ctx, &path) {
            Ok(()) => {
                self.inodes.invalidate_path(&path);
                reply.ok();
            }
            Err(e) => reply.error(errno("unlink", &e)),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        // Same removal path as unlink; the non-empty check comes from the
        // runtime kind of the target.
        let path = match self.child_path(parent, name) {
            Ok(path) => path,
            Err(e) => return reply.error(e),
        };
        match ops::remove(&self.ctx, &path) {
            Ok(()) => {
                self.inodes.invalidate_path(&path);
                reply.ok();
            }
            Err(e) => reply.error(errno("rmdir", &e)),
        }
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let path = match self.child_path(parent, link_name) {
            Ok(path) => path,
            Err(e) => return reply.error(e),
        };
        let Some(target) = target.to_str() else {
            return reply.error(libc::EINVAL);
        };
        if let Err(e) = ops::symlink(&self.ctx, target, &path, req.uid(), req.gid()) {
            return reply.error(errno("symlink", &e));
        }
        match self.entry_for(&path) {
            Ok((_, attr)) => reply.entry(&ATTR_TTL, &attr, 0),
            Err(e) => reply.error(errno("symlink", &e)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        if flags != 0 {
            // RENAME_NOREPLACE / RENAME_EXCHANGE are not supported.
            return reply.error(libc::EINVAL);
        }
        let src = match self.child_path(parent, name) {
            Ok(path) => path,
            Err(e) => return reply.error(e),
        };
        let dst = match self.child_path(newparent, newname) {
            Ok(path) => path,
            Err(e) => return reply.error(e),
        };
        match ops::rename(&self.ctx, &src, &dst) {
            Ok(()) => {
                self.inodes.invalidate_path(&dst);
                self.inodes.rename_tree(&src, &dst);
                reply.ok();
            }
            Err(e) => reply.error(errno("rename", &e)),
        }
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let src = match self.path_of(ino) {
            Ok(path) => path,
            Err(e) => return reply.error(e),
        };
        let dst = match self.child_path(newparent, newname) {
            Ok(path) => path,
            Err(e) => return reply.error(e),
        };
        if let Err(e) = ops::link(&self.ctx, &src, &dst) {
            return reply.error(errno("link", &e));
        }
        match self.entry_for(&dst) {
            Ok((_, attr)) => reply.entry(&ATTR_TTL, &attr, 0),
            Err(e) => reply.error(errno("link", &e)),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(e) => return reply.error(e),
        };
        let access = flags & libc::O_ACCMODE;
        let write = access == libc::O_WRONLY
            || access == libc::O_RDWR
            || (flags & libc::O_APPEND) != 0;
        let truncate = (flags & libc::O_TRUNC) != 0;

        match ops::open(&self.ctx, &path, write, truncate) {
            Ok(guard) => reply.opened(self.handles.insert(guard.release()), 0),
            Err(e) => reply.error(errno("open", &e)),
        }
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let path = match self.child_path(parent, name) {
            Ok(path) => path,
            Err(e) => return reply.error(e),
        };
        let mode = (mode & !(libc::S_IFMT as u32)) | FileKind::Regular.mode_bits();
        let guard = match ops::create(
            &self.ctx,
            &path,
            FileKind::Regular,
            mode,
            req.uid(),
            req.gid(),
        ) {
            Ok(guard) => guard,
            Err(e) => return reply.error(errno("create", &e)),
        };
        let st = match guard.get().stat() {
            Ok(st) => st,
            Err(e) => return reply.error(errno("create", &e)),
        };
        let ino = self.inodes.get_or_insert(&path);
        let attr = self.make_attr(ino, &st);
        let fh = self.handles.insert(guard.release());
        reply.created(&ATTR_TTL, &attr, 0, fh, 0);
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(object) = self.handles.get(fh) else {
            return reply.error(libc::EFAULT);
        };
        if offset < 0 {
            return reply.error(libc::EINVAL);
        }
        match object.as_regular() {
            Ok(file) => reply.data(&file.read(offset as u64, size as usize)),
            Err(e) => reply.error(errno("read", &e)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Some(object) = self.handles.get(fh) else {
            return reply.error(libc::EFAULT);
        };
        if offset < 0 {
            return reply.error(libc::EINVAL);
        }
        let written = object
            .as_regular()
            .and_then(|file| file.write(offset as u64, data));
        match written {
            Ok(n) => reply.written(n as u32),
            Err(e) => reply.error(errno("write", &e)),
        }
    }

    fn flush(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _lock_owner: u64,
        reply: ReplyEmpty,
    ) {
        let Some(object) = self.handles.get(fh) else {
            return reply.error(libc::EFAULT);
        };
        match object.flush() {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("flush", &e)),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let Some(object) = self.handles.remove(fh) else {
            return reply.error(libc::EFAULT);
        };
        let flushed = object.flush();
        // Re-wrap the raw object; the guard returns it to the table.
        FileGuard::adopt(self.ctx.table(), object);
        match flushed {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("release", &e)),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        let Some(object) = self.handles.get(fh) else {
            return reply.error(libc::EFAULT);
        };
        match object.fsync() {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("fsync", &e)),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(e) => return reply.error(e),
        };
        match ops::opendir(&self.ctx, &path) {
            Ok(guard) => reply.opened(self.handles.insert(guard.release()), 0),
            Err(e) => reply.error(errno("opendir", &e)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(object) = self.handles.get(fh) else {
            return reply.error(libc::EFAULT);
        };
        let dir_path = match self.path_of(ino) {
            Ok(path) => path,
            Err(e) => return reply.error(e),
        };

        let parent_ino = if dir_path == "/" {
            ROOT_INODE
        } else {
            self.inodes.peek_or_insert(&parent_of(&dir_path))
        };
        let mut entries: Vec<(u64, FileType, String)> = vec![
            (ino, FileType::Directory, ".".to_string()),
            (parent_ino, FileType::Directory, "..".to_string()),
        ];
        let listed = ops::readdir(&object, |name, kind| {
            let child_ino = self.inodes.peek_or_insert(&join_path(&dir_path, name));
            entries.push((child_ino, file_type(kind), name.to_string()));
            true
        });
        if let Err(e) = listed {
            return reply.error(errno("readdir", &e));
        }

        for (index, (entry_ino, kind, name)) in
            entries.iter().enumerate().skip(offset.max(0) as usize)
        {
            if reply.add(*entry_ino, (index + 1) as i64, *kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        let Some(object) = self.handles.remove(fh) else {
            return reply.error(libc::EFAULT);
        };
        let flushed = object.flush();
        FileGuard::adopt(self.ctx.table(), object);
        match flushed {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("releasedir", &e)),
        }
    }

    fn fsyncdir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _datasync: bool,
        reply: ReplyEmpty,
    ) {
        let Some(object) = self.handles.get(fh) else {
            return reply.error(libc::EFAULT);
        };
        match object.fsync() {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("fsyncdir", &e)),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        match ops::statfs(&self.ctx) {
            Ok(vfs) => reply.statfs(
                vfs.blocks,
                vfs.blocks_free,
                vfs.blocks_available,
                vfs.files,
                vfs.files_free,
                vfs.block_size,
                vfs.name_max,
                vfs.fragment_size,
            ),
            Err(e) => reply.error(errno("statfs", &e)),
        }
    }
}
