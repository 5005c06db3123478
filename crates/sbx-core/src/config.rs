use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{SbxError, SbxResult};

/// Top-level configuration (loaded from strongbox.toml)
///
/// The same file shape serves both binaries: `sbx` reads `[vault]` and
/// `[client]`, `sbxd` reads `[server]`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SbxConfig {
    pub vault: VaultConfig,
    pub client: ClientConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Vault root holding catalog.json, remote.json and data/ (default: ~/.strongbox)
    pub dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Whole-request timeout for login and sync calls
    pub timeout_secs: u64,
    /// Skip TLS certificate verification (self-signed test servers)
    pub accept_invalid_certs: bool,
    /// Scheme used when the remote address is a bare host:port
    pub default_scheme: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP listen address (default: 0.0.0.0:8443)
    pub listen: String,
    /// Directory holding one archive per account
    pub archive_dir: PathBuf,
    /// JSON file holding account records
    pub accounts_file: PathBuf,
    /// Log level (default: info)
    pub log_level: String,
    /// Log format: "json" or "text"
    pub log_format: String,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("~/.strongbox"),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            accept_invalid_certs: false,
            default_scheme: "https".into(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8443".into(),
            archive_dir: PathBuf::from("./users"),
            accounts_file: PathBuf::from("./accounts.json"),
            log_level: "info".into(),
            log_format: "text".into(),
        }
    }
}

impl SbxConfig {
    /// Load a config file, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> SbxResult<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| SbxError::Config(format!("parsing {}: {e}", path.display())))
    }
}

/// Expand `~` in path to the user's home directory
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        let home = std::env::var("HOME").unwrap_or_default();
        PathBuf::from(home).join(rest)
    } else if s == "~" {
        PathBuf::from(std::env::var("HOME").unwrap_or_default())
    } else {
        path.to_path_buf()
    }
}
