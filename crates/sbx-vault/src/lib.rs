//! sbx-vault: the local secret store and everything that reconciles it
//!
//! - [`catalog`]: metadata records and the last-write-wins merge shared by
//!   client and server
//! - [`kinds`]: per-kind payload encodings (bank card, login/password)
//! - [`archive`]: the tar transfer format (catalog entry first, then blobs)
//! - [`vault`]: the on-disk vault tying cipher, hasher and catalog together

pub mod archive;
pub mod catalog;
pub mod error;
pub mod kinds;
pub mod remote;
pub mod vault;

pub use archive::{ArchiveReader, ArchiveWriter, Blob, BlobEntries};
pub use catalog::{Catalog, SecretRecord};
pub use error::{VaultError, VaultResult};
pub use kinds::{BankCard, LoginPassword, Secret, SecretKind, SecretPayload};
pub use remote::RemoteConfig;
pub use vault::Vault;
