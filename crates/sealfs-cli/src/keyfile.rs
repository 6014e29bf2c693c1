//! Vault keyfile: scrypt-derived key encryption of the master key.
//!
//! `sealfs.json` lives at the vault root next to the object shards. It holds
//! the scrypt parameters, the wrapped 256-bit master key, the root inode id,
//! and the format flags chosen at vault creation. The passphrase-derived key
//! never touches disk; a wrong passphrase surfaces as an AES-GCM tag failure
//! on the wrapped key.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretBox};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use zeroize::Zeroizing;

use sealfs_core::{InodeId, MountFlags};

/// File name of the keyfile beneath the vault root.
pub const KEYFILE_NAME: &str = "sealfs.json";

const KEYFILE_VERSION: u32 = 1;
const SALT_LENGTH: usize = 16;
const NONCE_LENGTH: usize = 12;

/// Default scrypt cost (N = 2^15), with r = 8 and p = 1.
const DEFAULT_SCRYPT_LOG_N: u8 = 15;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;

/// Weak scrypt cost for tests (N = 2^10), enabled via `SEALFS_FAST_KDF=1`.
/// Roughly 32x faster than the default; never use on real vaults.
const FAST_SCRYPT_LOG_N: u8 = 10;

fn scrypt_log_n() -> u8 {
    let fast = std::env::var("SEALFS_FAST_KDF")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    if fast {
        FAST_SCRYPT_LOG_N
    } else {
        DEFAULT_SCRYPT_LOG_N
    }
}

/// On-disk keyfile contents.
#[derive(Debug, Serialize, Deserialize)]
pub struct KeyFile {
    pub version: u32,
    pub scrypt_log_n: u8,
    pub scrypt_r: u32,
    pub scrypt_p: u32,
    /// Base64 scrypt salt.
    pub salt: String,
    /// Base64 AES-GCM nonce for the wrapped key.
    pub nonce: String,
    /// Base64 AES-GCM ciphertext+tag of the master key.
    pub wrapped_key: String,
    pub root_id: InodeId,
    pub store_time: bool,
    pub case_fold: bool,
    pub no_authentication: bool,
}

impl KeyFile {
    /// Format flags recorded at creation; mount-time flags (read-only) are
    /// OR-ed in by the caller.
    pub fn flags(&self) -> MountFlags {
        let mut flags = MountFlags::empty();
        if self.store_time {
            flags |= MountFlags::STORE_TIME;
        }
        if self.case_fold {
            flags |= MountFlags::CASE_FOLD;
        }
        if self.no_authentication {
            flags |= MountFlags::NO_AUTHENTICATION;
        }
        flags
    }
}

fn derive_kek(passphrase: &str, salt: &[u8], log_n: u8, r: u32, p: u32) -> Result<Zeroizing<[u8; 32]>> {
    let params = scrypt::Params::new(log_n, r, p, 32)
        .map_err(|e| anyhow!("invalid scrypt parameters: {e:?}"))?;
    let mut kek = Zeroizing::new([0u8; 32]);
    scrypt::scrypt(passphrase.as_bytes(), salt, &params, kek.as_mut_slice())
        .map_err(|e| anyhow!("scrypt derivation failed: {e:?}"))?;
    Ok(kek)
}

/// Generates a fresh master key.
pub fn generate_master_key() -> SecretBox<[u8; 32]> {
    let mut key = Box::new([0u8; 32]);
    rand::thread_rng().fill_bytes(key.as_mut());
    SecretBox::new(key)
}

/// Writes a new keyfile beneath `vault_dir`. Refuses to overwrite.
pub fn write(
    vault_dir: &Path,
    passphrase: &str,
    master_key: &SecretBox<[u8; 32]>,
    root_id: InodeId,
    flags: MountFlags,
) -> Result<()> {
    let path = vault_dir.join(KEYFILE_NAME);
    if path.exists() {
        bail!("{} already exists", path.display());
    }

    let log_n = scrypt_log_n();
    let mut salt = [0u8; SALT_LENGTH];
    let mut nonce = [0u8; NONCE_LENGTH];
    rand::thread_rng().fill_bytes(&mut salt);
    rand::thread_rng().fill_bytes(&mut nonce);

    let kek = derive_kek(passphrase, &salt, log_n, SCRYPT_R, SCRYPT_P)?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&*kek));
    let wrapped = cipher
        .encrypt(Nonce::from_slice(&nonce), master_key.expose_secret().as_slice())
        .map_err(|_| anyhow::anyhow!("master key wrapping failed"))?;

    let keyfile = KeyFile {
        version: KEYFILE_VERSION,
        scrypt_log_n: log_n,
        scrypt_r: SCRYPT_R,
        scrypt_p: SCRYPT_P,
        salt: BASE64.encode(salt),
        nonce: BASE64.encode(nonce),
        wrapped_key: BASE64.encode(&wrapped),
        root_id,
        store_time: flags.contains(MountFlags::STORE_TIME),
        case_fold: flags.contains(MountFlags::CASE_FOLD),
        no_authentication: flags.contains(MountFlags::NO_AUTHENTICATION),
    };
    fs::write(&path, serde_json::to_string_pretty(&keyfile)?)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

/// Loads the keyfile beneath `vault_dir`.
pub fn load(vault_dir: &Path) -> Result<KeyFile> {
    let path = vault_dir.join(KEYFILE_NAME);
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("reading {} (is this a SealFS vault?)", path.display()))?;
    let keyfile: KeyFile = serde_json::from_str(&raw)
        .with_context(|| format!("parsing {}", path.display()))?;
    if keyfile.version != KEYFILE_VERSION {
        bail!("unsupported keyfile version {}", keyfile.version);
    }
    Ok(keyfile)
}

/// Recovers the master key from a keyfile with the given passphrase.
pub fn unlock(keyfile: &KeyFile, passphrase: &str) -> Result<SecretBox<[u8; 32]>> {
    let salt = BASE64.decode(&keyfile.salt).context("malformed salt")?;
    let nonce = BASE64.decode(&keyfile.nonce).context("malformed nonce")?;
    let wrapped = BASE64
        .decode(&keyfile.wrapped_key)
        .context("malformed wrapped key")?;
    if nonce.len() != NONCE_LENGTH {
        bail!("malformed nonce");
    }

    let kek = derive_kek(
        passphrase,
        &salt,
        keyfile.scrypt_log_n,
        keyfile.scrypt_r,
        keyfile.scrypt_p,
    )?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&*kek));
    let unwrapped = cipher
        .decrypt(Nonce::from_slice(&nonce), wrapped.as_slice())
        .map_err(|_| anyhow::anyhow!("invalid passphrase or corrupted keyfile"))?;

    let key: [u8; 32] = unwrapped
        .as_slice()
        .try_into()
        .map_err(|_| anyhow::anyhow!("wrapped key has wrong length"))?;
    Ok(SecretBox::new(Box::new(key)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fast_kdf() {
        std::env::set_var("SEALFS_FAST_KDF", "1");
    }

    #[test]
    fn test_write_unlock_round_trip() {
        fast_kdf();
        let dir = TempDir::new().unwrap();
        let master = generate_master_key();
        let root_id = InodeId::random();

        write(dir.path(), "correct horse", &master, root_id, MountFlags::STORE_TIME).unwrap();

        let keyfile = load(dir.path()).unwrap();
        assert_eq!(keyfile.root_id, root_id);
        assert!(keyfile.store_time);
        assert!(keyfile.flags().contains(MountFlags::STORE_TIME));
        assert!(!keyfile.flags().contains(MountFlags::CASE_FOLD));

        let unlocked = unlock(&keyfile, "correct horse").unwrap();
        assert_eq!(unlocked.expose_secret(), master.expose_secret());
    }

    #[test]
    fn test_wrong_passphrase_rejected() {
        fast_kdf();
        let dir = TempDir::new().unwrap();
        let master = generate_master_key();
        write(dir.path(), "right", &master, InodeId::random(), MountFlags::empty()).unwrap();

        let keyfile = load(dir.path()).unwrap();
        let err = unlock(&keyfile, "wrong").unwrap_err();
        assert!(err.to_string().contains("invalid passphrase"));
    }

    #[test]
    fn test_refuses_overwrite() {
        fast_kdf();
        let dir = TempDir::new().unwrap();
        let master = generate_master_key();
        write(dir.path(), "pw", &master, InodeId::random(), MountFlags::empty()).unwrap();
        assert!(write(dir.path(), "pw", &master, InodeId::random(), MountFlags::empty()).is_err());
    }

    #[test]
    fn test_load_missing_keyfile() {
        let dir = TempDir::new().unwrap();
        assert!(load(dir.path()).is_err());
    }
}
