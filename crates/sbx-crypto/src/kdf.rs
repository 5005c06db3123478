//! Key derivation: passphrase → AES-128 key

use md5::{Digest, Md5};
use secrecy::{ExposeSecret, SecretString};
use zeroize::Zeroize;

use crate::KEY_SIZE;

/// A 128-bit symmetric key derived from a passphrase.
///
/// Zeroized on drop to prevent secrets lingering in memory.
#[derive(Clone)]
pub struct CipherKey {
    bytes: [u8; KEY_SIZE],
}

impl CipherKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for CipherKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Derive the cipher key as the MD5 digest of the passphrase.
///
/// Deterministic and unsalted: the same passphrase always yields the same
/// key, which is what lets a second device decrypt blobs written by the
/// first one.
pub fn derive_key(passphrase: &SecretString) -> CipherKey {
    let digest = Md5::digest(passphrase.expose_secret().as_bytes());
    let mut bytes = [0u8; KEY_SIZE];
    bytes.copy_from_slice(&digest);
    CipherKey::from_bytes(bytes)
}
