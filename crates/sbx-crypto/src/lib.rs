//! sbx-crypto: streaming encryption primitives for strongbox
//!
//! Pipeline for one secret:
//! ```text
//! plaintext reader → EncryptingReader (AES-128-CTR) → HashWriter (SHA-256) → blob file
//! blob file → DecryptingReader (same key, IV from CipherMeta) → plaintext
//! ```
//!
//! Key derivation is a single MD5 of the passphrase (no salt, no
//! iterations). This is weak and is kept only so existing vaults and
//! archives stay readable.

pub mod error;
pub mod hash;
pub mod ids;
pub mod kdf;
pub mod passphrase;
pub mod stream;

pub use error::CryptoError;
pub use hash::{HashReader, HashWriter};
pub use ids::generate_id;
pub use kdf::{derive_key, CipherKey};
pub use passphrase::{PassphraseProvider, StaticPassphrase, TerminalPrompt};
pub use stream::{CipherMeta, DecryptingReader, EncryptingReader};

/// Size of the derived AES key in bytes (128-bit)
pub const KEY_SIZE: usize = 16;

/// Size of the CTR initialization vector (one AES block)
pub const IV_SIZE: usize = 16;

/// Length of a generated secret ID in hex characters
pub const ID_LEN: usize = 12;
