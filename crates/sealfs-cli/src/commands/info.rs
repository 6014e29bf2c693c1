//! `sealfs info` - show vault parameters without unlocking.

use anyhow::Result;
use std::path::PathBuf;

use crate::keyfile;

#[derive(clap::Args, Debug)]
pub struct Args {
    /// Vault directory
    pub dir: PathBuf,
}

pub fn run(args: Args) -> Result<()> {
    let keyfile = keyfile::load(&args.dir)?;
    println!("Vault:            {}", args.dir.display());
    println!("Keyfile version:  {}", keyfile.version);
    println!(
        "KDF:              scrypt (N=2^{}, r={}, p={})",
        keyfile.scrypt_log_n, keyfile.scrypt_r, keyfile.scrypt_p
    );
    println!(
        "Authentication:   {}",
        if keyfile.no_authentication { "disabled (AES-CTR)" } else { "AES-GCM" }
    );
    println!("Store timestamps: {}", keyfile.store_time);
    println!("Case folding:     {}", keyfile.case_fold);
    Ok(())
}
