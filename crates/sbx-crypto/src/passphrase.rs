//! Where the vault passphrase comes from
//!
//! The vault asks its provider each time it needs a key, so an interactive
//! session prompts once per operation and tests can inject a fixed value.

use secrecy::SecretString;

use crate::error::CryptoError;

/// Supplies the passphrase used to derive the cipher key.
pub trait PassphraseProvider: Send + Sync {
    fn passphrase(&self) -> Result<SecretString, CryptoError>;
}

/// Prompts on the controlling terminal without echo.
#[derive(Debug, Clone)]
pub struct TerminalPrompt {
    prompt: String,
}

impl TerminalPrompt {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
        }
    }
}

impl Default for TerminalPrompt {
    fn default() -> Self {
        Self::new("Passphrase: ")
    }
}

impl PassphraseProvider for TerminalPrompt {
    fn passphrase(&self) -> Result<SecretString, CryptoError> {
        tracing::debug!("prompting for passphrase");
        rpassword::prompt_password(&self.prompt)
            .map(SecretString::from)
            .map_err(|e| CryptoError::Passphrase(e.to_string()))
    }
}

/// A fixed passphrase, e.g. from `SBX_PASSPHRASE` or a test.
#[derive(Debug, Clone)]
pub struct StaticPassphrase(SecretString);

impl StaticPassphrase {
    pub fn new(passphrase: impl Into<String>) -> Self {
        Self(SecretString::from(passphrase.into()))
    }
}

impl PassphraseProvider for StaticPassphrase {
    fn passphrase(&self) -> Result<SecretString, CryptoError> {
        Ok(self.0.clone())
    }
}
