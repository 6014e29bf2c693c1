//! High-level filesystem operations.
//!
//! Each operation walks to its target through [`walker`](crate::walker),
//! performs the requested mutation or query on the resolved objects, and
//! keeps the path memo consistent before returning. Read-only mounts reject
//! every mutation with `ReadOnlyFilesystem`.
//!
//! Failure handling follows the namespace-first rule: a directory entry is
//! the authoritative existence of a file, so entry removal happens before
//! inode unlink, and errors in the second step are logged and swallowed
//! rather than resurrecting the entry.

use tracing::warn;

use sealfs_core::{
    FileGuard, FileKind, FileObject, FileStat, FsError, FsResult, InodeId, StatVfs, TimeSpec,
};

use crate::context::FileSystemContext;
use crate::walker::{open_all, open_base_dir, try_open_all};

fn ensure_writable(ctx: &FileSystemContext) -> FsResult<()> {
    if ctx.is_readonly() {
        return Err(FsError::ReadOnlyFilesystem);
    }
    Ok(())
}

/// Creates a fresh inode of `kind` at `path` and links it into its parent.
///
/// The inode is created under a random id before the directory entry is
/// added; if the entry cannot be added (name collision or any other
/// failure), the just-created inode is unlinked again so no orphan pair is
/// left behind.
pub fn create<'t>(
    ctx: &'t FileSystemContext,
    path: &str,
    kind: FileKind,
    mode: u32,
    uid: u32,
    gid: u32,
) -> FsResult<FileGuard<'t>> {
    ensure_writable(ctx)?;
    let (dir, name) = open_base_dir(ctx, path)?;
    if name.is_empty() {
        return Err(FsError::Exists);
    }

    let id = InodeId::random();
    let result = FileGuard::create_as(ctx.table(), id, kind)?;
    result.get().initialize_empty(mode, uid, gid)?;

    let added = match dir.as_directory()?.add_entry(&name, id, kind) {
        Ok(added) => added,
        Err(e) => {
            result.get().unlink();
            return Err(e);
        }
    };
    if !added {
        result.get().unlink();
        return Err(FsError::Exists);
    }
    Ok(result)
}

/// Best-effort unlink of an inode that has already left the namespace.
fn remove_inode(ctx: &FileSystemContext, id: InodeId, kind: FileKind) {
    match FileGuard::open_as(ctx.table(), id, kind) {
        Ok(guard) => {
            guard.get().unlink();
            ctx.clear_cache_id(&id);
        }
        Err(e) => {
            // The apparent filesystem state is already consistent.
            warn!(?id, error = %e, "unlinking displaced inode failed");
        }
    }
}

/// Removes the entry at `path` and unlinks its inode.
///
/// Shared by `unlink` and `rmdir`: a directory target is rejected with
/// `NotEmpty` while it has entries, and its remaining contents are logged
/// for diagnosis.
pub fn remove(ctx: &FileSystemContext, path: &str) -> FsResult<()> {
    ensure_writable(ctx)?;
    let (dir_guard, name) = open_base_dir(ctx, path)?;
    if name.is_empty() {
        return Err(FsError::PermissionDenied);
    }
    let entry = dir_guard
        .as_directory()?
        .get_entry(&name)
        .ok_or(FsError::NoSuchFile)?;

    let target = FileGuard::open_as(ctx.table(), entry.id, entry.kind)?;
    if entry.kind == FileKind::Directory {
        let view = target.as_directory()?;
        if !view.is_empty() {
            let mut contents = String::new();
            view.iterate_over_entries(|entry_name, _| {
                contents.push('\n');
                contents.push_str(entry_name);
                true
            });
            warn!(path, %contents, "refusing to remove non-empty directory");
            return Err(FsError::NotEmpty);
        }
    }

    dir_guard.as_directory()?.remove_entry(&name)?;
    // The entry is gone; unlink failures past this point must not undo it.
    target.get().unlink();
    ctx.clear_cache_id(&entry.id);
    Ok(())
}

/// Moves the entry at `src` to `dst`, displacing a compatible entry at the
/// destination.
///
/// Atomicity is best-effort at the directory-entry level: between removing
/// the source entry and adding the destination entry the name is briefly
/// absent from both directories.
pub fn rename(ctx: &FileSystemContext, src: &str, dst: &str) -> FsResult<()> {
    ensure_writable(ctx)?;
    let (src_dir, src_name) = open_base_dir(ctx, src)?;
    let (dst_dir, dst_name) = open_base_dir(ctx, dst)?;

    let src_entry = src_dir
        .as_directory()?
        .get_entry(&src_name)
        .ok_or(FsError::NoSuchFile)?;
    let dst_entry = dst_dir.as_directory()?.get_entry(&dst_name);

    if let Some(existing) = dst_entry {
        if existing.id == src_entry.id {
            return Ok(());
        }
        if src_entry.kind != FileKind::Directory && existing.kind == FileKind::Directory {
            return Err(FsError::IsADirectory);
        }
        if src_entry.kind != existing.kind {
            return Err(FsError::InvalidArgument("rename across inode kinds"));
        }
        dst_dir.as_directory()?.remove_entry(&dst_name)?;
    }

    src_dir.as_directory()?.remove_entry(&src_name)?;
    if !dst_dir
        .as_directory()?
        .add_entry(&dst_name, src_entry.id, src_entry.kind)?
    {
        return Err(FsError::Exists);
    }

    if let Some(existing) = dst_entry {
        remove_inode(ctx, existing.id, existing.kind);
    }

    ctx.clear_cache_path(&ctx.canonicalize(src));
    Ok(())
}

/// Adds a second name for a regular file, bumping its link count.
pub fn link(ctx: &FileSystemContext, src: &str, dst: &str) -> FsResult<()> {
    ensure_writable(ctx)?;
    let (src_dir, src_name) = open_base_dir(ctx, src)?;
    let (dst_dir, dst_name) = open_base_dir(ctx, dst)?;

    let src_entry = src_dir
        .as_directory()?
        .get_entry(&src_name)
        .ok_or(FsError::NoSuchFile)?;
    if dst_dir.as_directory()?.get_entry(&dst_name).is_some() {
        return Err(FsError::Exists);
    }

    let guard = FileGuard::open_as(ctx.table(), src_entry.id, src_entry.kind)?;
    if guard.get().kind() != FileKind::Regular {
        return Err(FsError::PermissionDenied);
    }

    guard.get().set_nlink(guard.get().get_nlink() + 1);
    if !dst_dir
        .as_directory()?
        .add_entry(&dst_name, src_entry.id, src_entry.kind)?
    {
        guard.get().set_nlink(guard.get().get_nlink() - 1);
        return Err(FsError::Exists);
    }
    Ok(())
}

/// Feeds every entry of an opened directory object to `sink`; iteration
/// stops early when the sink returns `false`.
pub fn readdir(
    dir: &FileObject,
    mut sink: impl FnMut(&str, FileKind) -> bool,
) -> FsResult<()> {
    let view = dir.as_directory()?;
    view.iterate_over_entries(|name, entry| sink(name, entry.kind));
    Ok(())
}

pub fn getattr(ctx: &FileSystemContext, path: &str) -> FsResult<FileStat> {
    match try_open_all(ctx, path)? {
        Some(guard) => guard.get().stat(),
        None => Err(FsError::NoSuchFile),
    }
}

/// Changes permission bits, preserving the file-type bits of the mode.
pub fn chmod(ctx: &FileSystemContext, path: &str, mode: u32) -> FsResult<()> {
    ensure_writable(ctx)?;
    let guard = open_all(ctx, path)?;
    let preserved = guard.get().get_mode() & libc::S_IFMT as u32;
    guard.get().set_mode((mode & 0o777) | preserved);
    guard.get().flush()
}

pub fn chown(
    ctx: &FileSystemContext,
    path: &str,
    uid: Option<u32>,
    gid: Option<u32>,
) -> FsResult<()> {
    ensure_writable(ctx)?;
    let guard = open_all(ctx, path)?;
    if let Some(uid) = uid {
        guard.get().set_uid(uid);
    }
    if let Some(gid) = gid {
        guard.get().set_gid(gid);
    }
    guard.get().flush()
}

pub fn utimens(
    ctx: &FileSystemContext,
    path: &str,
    atime: Option<TimeSpec>,
    mtime: Option<TimeSpec>,
) -> FsResult<()> {
    ensure_writable(ctx)?;
    let guard = open_all(ctx, path)?;
    guard.get().utimens(atime, mtime)?;
    guard.get().flush()
}

pub fn truncate(ctx: &FileSystemContext, path: &str, size: u64) -> FsResult<()> {
    ensure_writable(ctx)?;
    let guard = open_all(ctx, path)?;
    guard.as_regular()?.truncate(size)?;
    guard.get().flush()
}

/// Creates a symlink at `path` pointing to `target`.
pub fn symlink(
    ctx: &FileSystemContext,
    target: &str,
    path: &str,
    uid: u32,
    gid: u32,
) -> FsResult<()> {
    let guard = create(
        ctx,
        path,
        FileKind::Symlink,
        FileKind::Symlink.mode_bits() | 0o755,
        uid,
        gid,
    )?;
    guard.as_symlink()?.set_target(target)?;
    Ok(())
}

pub fn readlink(ctx: &FileSystemContext, path: &str) -> FsResult<String> {
    let guard = open_all(ctx, path)?;
    let target = guard.as_symlink()?.target();
    Ok(target)
}

pub fn statfs(ctx: &FileSystemContext) -> FsResult<StatVfs> {
    ctx.table().statfs()
}

/// Opens the regular file at `path` for a kernel file handle.
pub fn open<'t>(
    ctx: &'t FileSystemContext,
    path: &str,
    write: bool,
    truncate: bool,
) -> FsResult<FileGuard<'t>> {
    if write || truncate {
        ensure_writable(ctx)?;
    }
    let guard = open_all(ctx, path)?;
    {
        let file = guard.as_regular()?;
        if truncate {
            file.truncate(0)?;
        }
    }
    Ok(guard)
}

/// Opens the directory at `path` for a kernel directory handle.
pub fn opendir<'t>(ctx: &'t FileSystemContext, path: &str) -> FsResult<FileGuard<'t>> {
    let guard = open_all(ctx, path)?;
    if guard.get().kind() != FileKind::Directory {
        return Err(FsError::NotADirectory);
    }
    Ok(guard)
}
