//! `sealfs init` - create a new vault.

use anyhow::{bail, Context, Result};
use secrecy::ExposeSecret;
use std::fs;
use std::path::PathBuf;
use tracing::info;

use sealfs_core::MountFlags;
use sealfs_fuse::FileSystemContext;

use crate::keyfile;

#[derive(clap::Args, Debug)]
pub struct Args {
    /// Directory to create the vault in (created if missing, must be empty)
    pub dir: PathBuf,

    /// Persist atime/mtime/ctime inside the vault
    #[arg(long)]
    pub store_time: bool,

    /// Case-fold path components on lookup
    #[arg(long)]
    pub case_fold: bool,

    /// Seal objects without authentication (AES-CTR); tampering will not be
    /// detected
    #[arg(long)]
    pub no_authentication: bool,
}

pub fn run(args: Args, passphrase: &str) -> Result<()> {
    fs::create_dir_all(&args.dir)
        .with_context(|| format!("creating {}", args.dir.display()))?;
    if fs::read_dir(&args.dir)?.next().is_some() {
        bail!("{} is not empty", args.dir.display());
    }

    let mut flags = MountFlags::empty();
    if args.store_time {
        flags |= MountFlags::STORE_TIME;
    }
    if args.case_fold {
        flags |= MountFlags::CASE_FOLD;
    }
    if args.no_authentication {
        flags |= MountFlags::NO_AUTHENTICATION;
    }

    let master_key = keyfile::generate_master_key();
    let uid = unsafe { libc::getuid() };
    let gid = unsafe { libc::getgid() };

    let root_id = {
        let ctx = FileSystemContext::initialize(
            &args.dir,
            master_key.expose_secret(),
            flags,
            uid,
            gid,
        )
        .map_err(|e| anyhow::anyhow!("laying down vault root: {e}"))?;
        ctx.root_id()
    };

    keyfile::write(&args.dir, passphrase, &master_key, root_id, flags)?;
    info!(dir = %args.dir.display(), "vault created");
    println!("Vault created at {}", args.dir.display());
    Ok(())
}
