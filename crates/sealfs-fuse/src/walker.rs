//! Textual path resolution over encrypted directory objects.
//!
//! Resolution walks the directory chain hop by hop: each non-terminal
//! component is looked up in the current directory object, the walk descends
//! into the child, and the interior prefix is memoized on the context so the
//! next walk over the same prefix skips the directory reads. Every hop is
//! verified against the actual directory entry, so a stale memo entry can
//! never produce a wrong final id.

use sealfs_core::{FileGuard, FileKind, FsError, FsResult};

use crate::context::FileSystemContext;

/// Resolves the parent directory of `path`.
///
/// Returns a guard on the directory containing the final component together
/// with that component. For the root path the guard is on the root directory
/// and the component is empty.
///
/// Fails with `NoSuchFile` when an interior component is missing and
/// `NotADirectory` when one resolves to a non-directory.
pub fn open_base_dir<'t>(
    ctx: &'t FileSystemContext,
    path: &str,
) -> FsResult<(FileGuard<'t>, String)> {
    let folded;
    let path = if ctx.case_fold() {
        folded = path.to_lowercase();
        folded.as_str()
    } else {
        path
    };

    let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
    if components.is_empty() {
        let guard = FileGuard::open_as(ctx.table(), ctx.root_id(), FileKind::Directory)?;
        return Ok((guard, String::new()));
    }

    let mut prefixes = Vec::with_capacity(components.len());
    {
        let mut prefix = String::new();
        for component in &components {
            prefix.push('/');
            prefix.push_str(component);
            prefixes.push(prefix.clone());
        }
    }

    // Fast-forward over memoized interior prefixes.
    let mut id = ctx.root_id();
    let mut first = 0;
    while first + 1 < components.len() {
        match ctx.lookup_cached(&prefixes[first]) {
            Some(cached) => {
                id = cached;
                first += 1;
            }
            None => break,
        }
    }

    let mut guard = FileGuard::open_as(ctx.table(), id, FileKind::Directory)?;
    for i in first..components.len() - 1 {
        let entry = guard
            .as_directory()?
            .get_entry(components[i])
            .ok_or(FsError::NoSuchFile)?;
        if entry.kind != FileKind::Directory {
            return Err(FsError::NotADirectory);
        }
        let next = ctx.table().open_as(entry.id, FileKind::Directory)?;
        guard.reset(Some(next));
        ctx.remember(&prefixes[i], entry.id);
    }

    Ok((guard, components[components.len() - 1].to_string()))
}

/// Resolves `path` all the way to its target object.
pub fn open_all<'t>(ctx: &'t FileSystemContext, path: &str) -> FsResult<FileGuard<'t>> {
    let (mut guard, last_component) = open_base_dir(ctx, path)?;
    if last_component.is_empty() {
        return Ok(guard);
    }
    let entry = guard
        .as_directory()?
        .get_entry(&last_component)
        .ok_or(FsError::NoSuchFile)?;
    let next = ctx.table().open_as(entry.id, entry.kind)?;
    guard.reset(Some(next));
    Ok(guard)
}

/// Non-failing variant of [`open_all`] for the high-frequency existence
/// probes (`getattr`/`lookup`): an absent terminal entry is `Ok(None)`
/// rather than an error.
pub fn try_open_all<'t>(
    ctx: &'t FileSystemContext,
    path: &str,
) -> FsResult<Option<FileGuard<'t>>> {
    let (mut guard, last_component) = open_base_dir(ctx, path)?;
    if last_component.is_empty() {
        return Ok(Some(guard));
    }
    let Some(entry) = guard.as_directory()?.get_entry(&last_component) else {
        return Ok(None);
    };
    let next = ctx.table().open_as(entry.id, entry.kind)?;
    guard.reset(Some(next));
    Ok(Some(guard))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops;
    use sealfs_core::MountFlags;
    use tempfile::TempDir;

    fn test_ctx(flags: MountFlags) -> (TempDir, FileSystemContext) {
        let dir = TempDir::new().unwrap();
        let ctx = FileSystemContext::initialize(dir.path(), &[6u8; 32], flags, 0, 0).unwrap();
        (dir, ctx)
    }

    fn mkdir(ctx: &FileSystemContext, path: &str) {
        ops::create(
            ctx,
            path,
            FileKind::Directory,
            FileKind::Directory.mode_bits() | 0o755,
            0,
            0,
        )
        .unwrap();
    }

    #[test]
    fn test_root_resolution() {
        let (_dir, ctx) = test_ctx(MountFlags::empty());
        for path in ["", "/", "//"] {
            let (guard, last) = open_base_dir(&ctx, path).unwrap();
            assert_eq!(guard.get().id(), ctx.root_id());
            assert!(last.is_empty());
        }
        let guard = open_all(&ctx, "/").unwrap();
        assert_eq!(guard.get().id(), ctx.root_id());
    }

    #[test]
    fn test_base_dir_of_top_level_name() {
        let (_dir, ctx) = test_ctx(MountFlags::empty());
        let (guard, last) = open_base_dir(&ctx, "/file.txt").unwrap();
        assert_eq!(guard.get().id(), ctx.root_id());
        assert_eq!(last, "file.txt");
    }

    #[test]
    fn test_walk_memoizes_interior_prefixes() {
        let (_dir, ctx) = test_ctx(MountFlags::empty());
        mkdir(&ctx, "/a");
        mkdir(&ctx, "/a/b");
        mkdir(&ctx, "/a/b/c");

        assert_eq!(ctx.memo_len(), 0);
        let (_, last) = open_base_dir(&ctx, "/a/b/c/leaf").unwrap();
        assert_eq!(last, "leaf");
        // Interior prefixes /a, /a/b and /a/b/c were recorded.
        assert!(ctx.lookup_cached("/a").is_some());
        assert!(ctx.lookup_cached("/a/b").is_some());
        assert!(ctx.lookup_cached("/a/b/c").is_some());
        assert!(ctx.lookup_cached("/a/b/c/leaf").is_none());
    }

    #[test]
    fn test_walk_fast_forwards_over_memo() {
        let (_dir, ctx) = test_ctx(MountFlags::empty());
        mkdir(&ctx, "/a");
        mkdir(&ctx, "/a/b");
        open_base_dir(&ctx, "/a/b/x").unwrap();

        // The second walk lands on the memoized id for /a/b.
        let b = ctx.lookup_cached("/a/b").unwrap();
        let (guard, _) = open_base_dir(&ctx, "/a/b/x").unwrap();
        assert_eq!(guard.get().id(), b);
    }

    #[test]
    fn test_stale_memo_is_revalidated_by_entry_lookup() {
        let (_dir, ctx) = test_ctx(MountFlags::empty());
        mkdir(&ctx, "/a");
        mkdir(&ctx, "/a/b");

        // Plant a stale mapping: /a points at the root directory. The walk
        // trusts it for the hop, then fails the verified entry lookup
        // instead of ever returning a wrong object.
        ctx.remember("/a", ctx.root_id());
        assert!(matches!(
            open_base_dir(&ctx, "/a/b/x"),
            Err(FsError::NoSuchFile)
        ));
    }

    #[test]
    fn test_missing_interior_component() {
        let (_dir, ctx) = test_ctx(MountFlags::empty());
        mkdir(&ctx, "/a");
        assert!(matches!(
            open_base_dir(&ctx, "/a/missing/leaf"),
            Err(FsError::NoSuchFile)
        ));
    }

    #[test]
    fn test_interior_component_not_a_directory() {
        let (_dir, ctx) = test_ctx(MountFlags::empty());
        ops::create(&ctx, "/file", FileKind::Regular, 0o644, 0, 0).unwrap();
        assert!(matches!(
            open_base_dir(&ctx, "/file/leaf"),
            Err(FsError::NotADirectory)
        ));
    }

    #[test]
    fn test_open_all_terminal_entry() {
        let (_dir, ctx) = test_ctx(MountFlags::empty());
        ops::create(&ctx, "/file", FileKind::Regular, 0o644, 0, 0).unwrap();

        let guard = open_all(&ctx, "/file").unwrap();
        assert_eq!(guard.get().kind(), FileKind::Regular);

        assert!(matches!(open_all(&ctx, "/nope"), Err(FsError::NoSuchFile)));
        assert!(try_open_all(&ctx, "/nope").unwrap().is_none());
        assert!(try_open_all(&ctx, "/file").unwrap().is_some());
    }

    #[test]
    fn test_case_folded_walk() {
        let (_dir, ctx) = test_ctx(MountFlags::CASE_FOLD);
        mkdir(&ctx, "/Docs");
        ops::create(&ctx, "/DOCS/Readme", FileKind::Regular, 0o644, 0, 0).unwrap();

        // Any casing resolves to the same objects.
        let a = open_all(&ctx, "/docs/readme").unwrap();
        let b = open_all(&ctx, "/DoCs/ReAdMe").unwrap();
        assert_eq!(a.get().id(), b.get().id());
        // Memo keys are folded.
        assert!(ctx.lookup_cached("/docs").is_some());
        assert!(ctx.lookup_cached("/Docs").is_none());
    }
}
