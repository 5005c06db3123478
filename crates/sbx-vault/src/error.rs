use sbx_crypto::CryptoError;
use thiserror::Error;

pub type VaultResult<T> = Result<T, VaultError>;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} has been deleted")]
    AlreadyDeleted(String),

    #[error("validation failed: {0}")]
    Validation(String),

    /// A blob's bytes do not hash to the digest its record claims.
    #[error("integrity check failed for {id}: expected {expected}, got {actual}")]
    Integrity {
        id: String,
        expected: String,
        actual: String,
    },

    #[error("malformed archive: {0}")]
    Archive(String),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
