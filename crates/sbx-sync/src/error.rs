use sbx_vault::VaultError;
use thiserror::Error;

pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a status this client does not handle.
    #[error("unexpected status {status} from {url}")]
    UnexpectedStatus { status: u16, url: String },

    #[error("remote not configured: {0}")]
    NotConfigured(&'static str),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
