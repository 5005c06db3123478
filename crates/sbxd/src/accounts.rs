//! Account store: registration, token checks, and the pointer from an
//! account to its archive.
//!
//! [`JsonAccountStore`] keeps every account in one JSON file next to the
//! server and rewrites it (temp file + rename) after each change.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

pub type AccountResult<T> = Result<T, AccountError>;

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("password does not match the registered account")]
    InvalidCredentials,

    #[error("unknown token")]
    UnknownToken,

    #[error("password hashing failed: {0}")]
    Hash(String),

    #[error("account file I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("account file JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Register `username`, or log in when it already exists.
    ///
    /// Returns the account's token either way. A known username with a
    /// different password is [`AccountError::InvalidCredentials`].
    async fn register(&self, username: &str, password: &str) -> AccountResult<String>;

    async fn check(&self, token: &str) -> AccountResult<()>;

    /// Path of the account's stored archive, if one was ever saved.
    async fn archive_path(&self, token: &str) -> AccountResult<Option<PathBuf>>;

    async fn save_archive_path(&self, token: &str, path: &Path) -> AccountResult<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Account {
    username: String,
    password_hash: String,
    token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    archive: Option<PathBuf>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AccountFile {
    #[serde(default)]
    accounts: Vec<Account>,
}

pub struct JsonAccountStore {
    path: PathBuf,
    accounts: RwLock<Vec<Account>>,
}

impl JsonAccountStore {
    /// Load the account file, starting empty when it does not exist yet.
    pub async fn open(path: impl Into<PathBuf>) -> AccountResult<Self> {
        let path = path.into();
        let accounts = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<AccountFile>(&bytes)?.accounts,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        info!(path = %path.display(), accounts = accounts.len(), "account store loaded");
        Ok(Self {
            path,
            accounts: RwLock::new(accounts),
        })
    }

    async fn persist(&self, accounts: &[Account]) -> AccountResult<()> {
        let json = serde_json::to_vec_pretty(&AccountFile {
            accounts: accounts.to_vec(),
        })?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    async fn verify(&self, account: &Account, password: &str) -> AccountResult<String> {
        let hash = account.password_hash.clone();
        let password = password.to_string();
        if tokio::task::spawn_blocking(move || verify_password(&password, &hash)).await? {
            Ok(account.token.clone())
        } else {
            debug!(username = %account.username, "password mismatch");
            Err(AccountError::InvalidCredentials)
        }
    }
}

#[async_trait]
impl AccountStore for JsonAccountStore {
    async fn register(&self, username: &str, password: &str) -> AccountResult<String> {
        let existing = {
            let accounts = self.accounts.read().await;
            accounts.iter().find(|a| a.username == username).cloned()
        };
        if let Some(account) = existing {
            return self.verify(&account, password).await;
        }

        let owned = password.to_string();
        let password_hash = tokio::task::spawn_blocking(move || hash_password(&owned)).await??;

        let mut accounts = self.accounts.write().await;
        // Another request may have registered the name while we were hashing.
        if let Some(account) = accounts.iter().find(|a| a.username == username).cloned() {
            drop(accounts);
            return self.verify(&account, password).await;
        }

        let token = uuid::Uuid::new_v4().simple().to_string();
        let mut next = accounts.clone();
        next.push(Account {
            username: username.to_string(),
            password_hash,
            token: token.clone(),
            archive: None,
        });
        self.persist(&next).await?;
        *accounts = next;
        info!(username, "account registered");
        Ok(token)
    }

    async fn check(&self, token: &str) -> AccountResult<()> {
        let accounts = self.accounts.read().await;
        if accounts.iter().any(|a| a.token == token) {
            Ok(())
        } else {
            Err(AccountError::UnknownToken)
        }
    }

    async fn archive_path(&self, token: &str) -> AccountResult<Option<PathBuf>> {
        let accounts = self.accounts.read().await;
        accounts
            .iter()
            .find(|a| a.token == token)
            .map(|a| a.archive.clone())
            .ok_or(AccountError::UnknownToken)
    }

    async fn save_archive_path(&self, token: &str, path: &Path) -> AccountResult<()> {
        let mut accounts = self.accounts.write().await;
        let account = accounts
            .iter_mut()
            .find(|a| a.token == token)
            .ok_or(AccountError::UnknownToken)?;
        account.archive = Some(path.to_path_buf());
        self.persist(&accounts).await
    }
}

fn hash_password(password: &str) -> AccountResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AccountError::Hash(e.to_string()))
}

fn verify_password(password: &str, hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}
