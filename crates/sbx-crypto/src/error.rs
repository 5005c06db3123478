use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    /// The passphrase could not be obtained (e.g. no interactive terminal).
    #[error("passphrase unavailable: {0}")]
    Passphrase(String),

    #[error("invalid key length for the block cipher")]
    InvalidKeyLength,

    #[error("invalid cipher meta: expected {expected} bytes, got {actual}")]
    InvalidMeta { expected: usize, actual: usize },
}
