//! Sealed envelope format for on-disk object files.
//!
//! Every object file (data and metadata alike) is one envelope:
//!
//! ```text
//! magic (4) | domain (1) | nonce (16) | body
//! ```
//!
//! With authentication enabled the body is an AES-256-GCM ciphertext+tag over
//! the whole plaintext, with the inode id and the domain byte bound as
//! additional authenticated data so an envelope cannot be replayed under a
//! different id or as a different file of the pair. With authentication
//! disabled the body is an AES-256-CTR keystream-xor of the plaintext and
//! tampering goes undetected.

use aes::cipher::{KeyIvInit, StreamCipher};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::{FsError, FsResult};
use crate::id::{InodeId, ID_LENGTH};

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

const MAGIC: &[u8; 4] = b"SLF1";
/// CTR IV length; GCM uses the leading 12 bytes of the same field.
const NONCE_LENGTH: usize = 16;
const HEADER_LENGTH: usize = 4 + 1 + NONCE_LENGTH;
const GCM_TAG_LENGTH: usize = 16;

/// Which file of the on-disk pair an envelope belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadDomain {
    /// The data file: file content, directory entry table, or symlink target.
    Content,
    /// The metadata file: the serialized [`MetaRecord`](super::meta::MetaRecord).
    Metadata,
}

impl PayloadDomain {
    fn tag(self) -> u8 {
        match self {
            PayloadDomain::Content => 0,
            PayloadDomain::Metadata => 1,
        }
    }
}

/// Stateless sealer/opener for object envelopes.
///
/// The payload key is derived from the vault master key with a domain
/// separation label, so the master key itself never touches file contents.
pub struct PayloadCipher {
    key: Zeroizing<[u8; 32]>,
    authenticated: bool,
}

impl PayloadCipher {
    pub fn new(master_key: &[u8; 32], authenticated: bool) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"sealfs.payload.v1");
        hasher.update(master_key);
        let key = Zeroizing::new(hasher.finalize().into());
        Self { key, authenticated }
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Seals `plaintext` into a fresh envelope for `id`.
    pub fn seal(&self, id: &InodeId, domain: PayloadDomain, plaintext: &[u8]) -> FsResult<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LENGTH];
        rand::thread_rng().fill_bytes(&mut nonce);

        let mut out = Vec::with_capacity(HEADER_LENGTH + plaintext.len() + GCM_TAG_LENGTH);
        out.extend_from_slice(MAGIC);
        out.push(domain.tag());
        out.extend_from_slice(&nonce);

        if self.authenticated {
            let cipher = Aes256Gcm::new_from_slice(self.key.as_slice())
                .map_err(|_| FsError::Crypto("bad payload key length"))?;
            let body = cipher
                .encrypt(
                    Nonce::from_slice(&nonce[..12]),
                    Payload {
                        msg: plaintext,
                        aad: &associated_data(id, domain),
                    },
                )
                .map_err(|_| FsError::Crypto("sealing failed"))?;
            out.extend_from_slice(&body);
        } else {
            let mut body = plaintext.to_vec();
            let mut cipher = Aes256Ctr::new_from_slices(self.key.as_slice(), &nonce)
                .map_err(|_| FsError::Crypto("bad payload key length"))?;
            cipher.apply_keystream(&mut body);
            out.extend_from_slice(&body);
        }
        Ok(out)
    }

    /// Opens an envelope previously produced by [`seal`](Self::seal).
    pub fn open(&self, id: &InodeId, domain: PayloadDomain, sealed: &[u8]) -> FsResult<Vec<u8>> {
        if sealed.len() < HEADER_LENGTH {
            return Err(FsError::Crypto("envelope truncated"));
        }
        if &sealed[..4] != MAGIC {
            return Err(FsError::Crypto("bad envelope magic"));
        }
        if sealed[4] != domain.tag() {
            return Err(FsError::Crypto("envelope domain mismatch"));
        }
        let nonce = &sealed[5..HEADER_LENGTH];
        let body = &sealed[HEADER_LENGTH..];

        if self.authenticated {
            let cipher = Aes256Gcm::new_from_slice(self.key.as_slice())
                .map_err(|_| FsError::Crypto("bad payload key length"))?;
            cipher
                .decrypt(
                    Nonce::from_slice(&nonce[..12]),
                    Payload {
                        msg: body,
                        aad: &associated_data(id, domain),
                    },
                )
                .map_err(|_| FsError::Crypto("authentication failed"))
        } else {
            let mut out = body.to_vec();
            let mut cipher = Aes256Ctr::new_from_slices(self.key.as_slice(), nonce)
                .map_err(|_| FsError::Crypto("bad payload key length"))?;
            cipher.apply_keystream(&mut out);
            Ok(out)
        }
    }
}

fn associated_data(id: &InodeId, domain: PayloadDomain) -> [u8; ID_LENGTH + 1] {
    let mut aad = [0u8; ID_LENGTH + 1];
    aad[..ID_LENGTH].copy_from_slice(id.as_bytes());
    aad[ID_LENGTH] = domain.tag();
    aad
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher(authenticated: bool) -> PayloadCipher {
        PayloadCipher::new(&[7u8; 32], authenticated)
    }

    #[test]
    fn test_seal_open_round_trip() {
        let c = cipher(true);
        let id = InodeId::random();
        let sealed = c.seal(&id, PayloadDomain::Content, b"hello world").unwrap();
        let opened = c.open(&id, PayloadDomain::Content, &sealed).unwrap();
        assert_eq!(opened, b"hello world");
    }

    #[test]
    fn test_empty_plaintext() {
        let c = cipher(true);
        let id = InodeId::random();
        let sealed = c.seal(&id, PayloadDomain::Metadata, b"").unwrap();
        assert_eq!(c.open(&id, PayloadDomain::Metadata, &sealed).unwrap(), b"");
    }

    #[test]
    fn test_tampering_detected_when_authenticated() {
        let c = cipher(true);
        let id = InodeId::random();
        let mut sealed = c.seal(&id, PayloadDomain::Content, b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(
            c.open(&id, PayloadDomain::Content, &sealed),
            Err(FsError::Crypto(_))
        ));
    }

    #[test]
    fn test_wrong_id_rejected() {
        let c = cipher(true);
        let sealed = c
            .seal(&InodeId::random(), PayloadDomain::Content, b"payload")
            .unwrap();
        assert!(c
            .open(&InodeId::random(), PayloadDomain::Content, &sealed)
            .is_err());
    }

    #[test]
    fn test_domain_confusion_rejected() {
        let c = cipher(true);
        let id = InodeId::random();
        let sealed = c.seal(&id, PayloadDomain::Content, b"payload").unwrap();
        assert!(c.open(&id, PayloadDomain::Metadata, &sealed).is_err());
    }

    #[test]
    fn test_unauthenticated_round_trip() {
        let c = cipher(false);
        let id = InodeId::random();
        let sealed = c.seal(&id, PayloadDomain::Content, b"stream me").unwrap();
        assert_eq!(c.open(&id, PayloadDomain::Content, &sealed).unwrap(), b"stream me");
    }

    #[test]
    fn test_truncated_envelope() {
        let c = cipher(true);
        let id = InodeId::random();
        assert!(matches!(
            c.open(&id, PayloadDomain::Content, b"SLF1"),
            Err(FsError::Crypto(_))
        ));
    }

    #[test]
    fn test_ciphertext_differs_from_plaintext() {
        for auth in [true, false] {
            let c = cipher(auth);
            let id = InodeId::random();
            let sealed = c.seal(&id, PayloadDomain::Content, b"secret bytes").unwrap();
            assert!(!sealed
                .windows(b"secret bytes".len())
                .any(|w| w == b"secret bytes"));
        }
    }
}
