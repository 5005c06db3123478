//! AES-128-CTR keystream adapters over any `Read`
//!
//! Both directions are the same operation: bytes are pulled from the inner
//! reader and XORed with the keystream in place, so nothing is buffered
//! beyond the caller's read buffer. The counter is the full 16-byte IV
//! incremented big-endian per block.

use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use rand::RngCore;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::io::{self, Read};

use crate::error::CryptoError;
use crate::kdf::derive_key;
use crate::IV_SIZE;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

/// Per-blob cipher metadata (the CTR initialization vector).
///
/// Stored unencrypted in the catalog next to the record, hex-encoded in JSON.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CipherMeta(#[serde(with = "hex::serde")] Vec<u8>);

impl CipherMeta {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Encrypts everything read through it.
pub struct EncryptingReader<R> {
    inner: R,
    cipher: Aes128Ctr,
    iv: [u8; IV_SIZE],
}

impl<R: Read> EncryptingReader<R> {
    /// Wrap `inner`, drawing a fresh IV from `rng`.
    pub fn new(
        inner: R,
        passphrase: &SecretString,
        rng: &mut dyn RngCore,
    ) -> Result<Self, CryptoError> {
        let key = derive_key(passphrase);
        let mut iv = [0u8; IV_SIZE];
        rng.fill_bytes(&mut iv);
        let cipher = Aes128Ctr::new_from_slices(key.as_bytes(), &iv)
            .map_err(|_| CryptoError::InvalidKeyLength)?;
        Ok(Self { inner, cipher, iv })
    }

    /// Metadata needed to decrypt the produced ciphertext.
    ///
    /// Capture this only after the stream has been read to the end, so the
    /// meta recorded for a blob always belongs to the bytes actually written.
    pub fn meta(&self) -> CipherMeta {
        CipherMeta(self.iv.to_vec())
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for EncryptingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.cipher.apply_keystream(&mut buf[..n]);
        Ok(n)
    }
}

/// Decrypts everything read through it.
pub struct DecryptingReader<R> {
    inner: R,
    cipher: Aes128Ctr,
}

impl<R: Read> DecryptingReader<R> {
    pub fn new(inner: R, passphrase: &SecretString, meta: &CipherMeta) -> Result<Self, CryptoError> {
        if meta.as_bytes().len() != IV_SIZE {
            return Err(CryptoError::InvalidMeta {
                expected: IV_SIZE,
                actual: meta.as_bytes().len(),
            });
        }
        let key = derive_key(passphrase);
        let cipher = Aes128Ctr::new_from_slices(key.as_bytes(), meta.as_bytes())
            .map_err(|_| CryptoError::InvalidKeyLength)?;
        Ok(Self { inner, cipher })
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for DecryptingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.cipher.apply_keystream(&mut buf[..n]);
        Ok(n)
    }
}
