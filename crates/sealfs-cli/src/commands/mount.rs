//! `sealfs mount` - mount a vault through FUSE.

use anyhow::{Context, Result};
use fuser::MountOption;
use secrecy::ExposeSecret;
use std::path::PathBuf;
use tracing::info;

use sealfs_core::MountFlags;
use sealfs_fuse::{FileSystemContext, SealFs};

use crate::keyfile;

#[derive(clap::Args, Debug)]
pub struct Args {
    /// Vault directory
    pub dir: PathBuf,

    /// Mount point
    pub mountpoint: PathBuf,

    /// Reject every mutation with EROFS
    #[arg(long)]
    pub readonly: bool,

    /// Allow access by other users (requires user_allow_other in fuse.conf)
    #[arg(long)]
    pub allow_other: bool,
}

pub fn run(args: Args, passphrase: &str) -> Result<()> {
    let keyfile = keyfile::load(&args.dir)?;
    let master_key = keyfile::unlock(&keyfile, passphrase)?;

    let mut flags = keyfile.flags();
    if args.readonly {
        flags |= MountFlags::READ_ONLY;
    }

    let ctx = FileSystemContext::new(
        &args.dir,
        master_key.expose_secret(),
        flags,
        keyfile.root_id,
    )
    .map_err(|e| anyhow::anyhow!("opening vault: {e}"))?;

    let mut options = vec![
        MountOption::FSName("sealfs".to_string()),
        MountOption::DefaultPermissions,
    ];
    if args.readonly {
        options.push(MountOption::RO);
    }
    if args.allow_other {
        options.push(MountOption::AllowOther);
    }

    info!(
        vault = %args.dir.display(),
        mountpoint = %args.mountpoint.display(),
        readonly = args.readonly,
        "mounting"
    );
    // Blocks until the filesystem is unmounted; teardown drains the
    // finalizer through the table drop.
    fuser::mount2(SealFs::new(ctx), &args.mountpoint, &options)
        .with_context(|| format!("mounting on {}", args.mountpoint.display()))?;
    Ok(())
}
