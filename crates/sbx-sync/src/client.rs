//! HTTP client for the transfer protocol, plus the client-side sync
//! pipeline: pack → upload → unpack the merged archive.

use flate2::write::GzEncoder;
use flate2::Compression;
use futures::StreamExt;
use reqwest::header::{AUTHORIZATION, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::StatusCode;
use sbx_core::config::ClientConfig;
use sbx_vault::{RemoteConfig, Vault};
use std::fs::File;
use std::io::{self, BufReader, Seek, SeekFrom};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::error::{SyncError, SyncResult};
use crate::protocol::{LoginRequest, LoginResponse, LOGIN_PATH, SYNC_PATH, TAR_CONTENT_TYPE};

/// Server answer to an archive upload.
#[derive(Debug)]
pub enum UploadOutcome {
    /// No archive existed for the account; the upload became its archive,
    /// rewritten as catalog plus verified live blobs.
    Created,
    /// The upload was merged; the file holds the merged archive, rewound.
    Merged(File),
}

/// What [`sync_vault`] ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Local vault was empty and the remote archive was downloaded.
    Downloaded,
    /// Local vault and remote were both empty.
    NothingToSync,
    /// First upload for this account.
    Uploaded,
    /// Local and remote archives were merged on both ends.
    Merged,
}

pub struct RemoteClient {
    http: reqwest::Client,
    base: String,
    token: Option<String>,
}

impl std::fmt::Debug for RemoteClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteClient")
            .field("base", &self.base)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl RemoteClient {
    /// `address` may be a full URL or a bare `host:port`, in which case
    /// `config.default_scheme` is prepended.
    pub fn new(address: &str, config: &ClientConfig) -> SyncResult<Self> {
        let address = address.trim().trim_end_matches('/');
        if address.is_empty() {
            return Err(SyncError::NotConfigured("remote address is empty"));
        }
        let base = if address.contains("://") {
            address.to_string()
        } else {
            format!("{}://{address}", config.default_scheme)
        };

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .user_agent(concat!("sbx/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            base,
            token: None,
        })
    }

    /// Build a client from a vault's persisted remote settings.
    pub fn from_remote(remote: &RemoteConfig, config: &ClientConfig) -> SyncResult<Self> {
        let address = remote
            .address
            .as_deref()
            .ok_or(SyncError::NotConfigured("no remote address; run `sbx remote set`"))?;
        let client = Self::new(address, config)?;
        Ok(match &remote.token {
            Some(token) => client.with_token(token.clone()),
            None => client,
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    fn token(&self) -> SyncResult<&str> {
        self.token
            .as_deref()
            .ok_or(SyncError::NotConfigured("no session token; run `sbx login`"))
    }

    /// Register or authenticate; returns the session token.
    pub async fn login(&self, username: &str, password: &str) -> SyncResult<String> {
        let url = self.url(LOGIN_PATH);
        let body = LoginRequest {
            username: username.to_string(),
            password: password.to_string(),
        };
        let resp = self.http.post(&url).json(&body).send().await?;
        if resp.status() != StatusCode::OK {
            return Err(unexpected(resp.status(), url));
        }
        let LoginResponse { token } = resp.json().await?;
        info!(remote = %self.base, "logged in");
        Ok(token)
    }

    /// Download the account's archive; `None` when the server has none yet.
    pub async fn fetch(&self) -> SyncResult<Option<File>> {
        let url = self.url(SYNC_PATH);
        let resp = self
            .http
            .get(&url)
            .header(AUTHORIZATION, self.token()?)
            .send()
            .await?;
        match resp.status() {
            StatusCode::OK => Ok(Some(spool(resp).await?)),
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(unexpected(status, url)),
        }
    }

    /// Upload a packed archive, gzip-compressed on the wire.
    pub async fn upload(&self, archive: File) -> SyncResult<UploadOutcome> {
        let url = self.url(SYNC_PATH);
        let token = self.token()?.to_string();

        let compressed = tokio::task::spawn_blocking(move || gzip(archive)).await??;
        let len = compressed.metadata()?.len();
        debug!(bytes = len, "uploading archive");
        let body = reqwest::Body::wrap_stream(ReaderStream::new(tokio::fs::File::from_std(
            compressed,
        )));

        let resp = self
            .http
            .post(&url)
            .header(AUTHORIZATION, token)
            .header(CONTENT_TYPE, TAR_CONTENT_TYPE)
            .header(CONTENT_ENCODING, "gzip")
            .header(CONTENT_LENGTH, len)
            .body(body)
            .send()
            .await?;
        match resp.status() {
            StatusCode::CREATED => Ok(UploadOutcome::Created),
            StatusCode::OK => Ok(UploadOutcome::Merged(spool(resp).await?)),
            status => Err(unexpected(status, url)),
        }
    }
}

fn unexpected(status: StatusCode, url: String) -> SyncError {
    SyncError::UnexpectedStatus {
        status: status.as_u16(),
        url,
    }
}

/// Stream a response body into an anonymous temp file, rewound.
async fn spool(resp: reqwest::Response) -> SyncResult<File> {
    let mut out = tokio::fs::File::from_std(tempfile::tempfile()?);
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        out.write_all(&chunk?).await?;
    }
    out.flush().await?;
    let mut file = out.into_std().await;
    file.seek(SeekFrom::Start(0))?;
    Ok(file)
}

fn gzip(mut archive: File) -> SyncResult<File> {
    let mut encoder = GzEncoder::new(tempfile::tempfile()?, Compression::default());
    io::copy(&mut archive, &mut encoder)?;
    let mut file = encoder.finish()?;
    file.seek(SeekFrom::Start(0))?;
    Ok(file)
}

/// Reconcile the local vault with the remote.
///
/// An empty vault only downloads. Otherwise the vault is packed and
/// uploaded, and a merged archive in the reply is unpacked locally.
pub async fn sync_vault(vault: &mut Vault, client: &RemoteClient) -> SyncResult<SyncOutcome> {
    if vault.is_empty() {
        return match client.fetch().await? {
            Some(archive) => {
                vault.unpack(BufReader::new(archive))?;
                info!(records = vault.catalog().len(), "downloaded remote vault");
                Ok(SyncOutcome::Downloaded)
            }
            None => {
                info!("nothing to sync");
                Ok(SyncOutcome::NothingToSync)
            }
        };
    }

    let archive = vault.pack()?;
    match client.upload(archive).await? {
        UploadOutcome::Created => {
            info!(records = vault.catalog().len(), "uploaded vault");
            Ok(SyncOutcome::Uploaded)
        }
        UploadOutcome::Merged(merged) => {
            vault.unpack(BufReader::new(merged))?;
            info!(records = vault.catalog().len(), "vault merged with remote");
            Ok(SyncOutcome::Merged)
        }
    }
}
