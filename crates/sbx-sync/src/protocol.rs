//! Wire protocol shared by `sbx` and `sbxd`.

use serde::{Deserialize, Serialize};
use std::fmt;

pub const LOGIN_PATH: &str = "/api/v1/login";
pub const SYNC_PATH: &str = "/api/v1/sync";
pub const HEALTH_PATH: &str = "/healthz";

pub const JSON_CONTENT_TYPE: &str = "application/json";
pub const TAR_CONTENT_TYPE: &str = "application/x-tar";

/// Content codings accepted on `/sync` in either direction.
pub const SUPPORTED_ENCODINGS: &[&str] = &["gzip", "identity"];

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginRequest")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub token: String,
}

fn codings(header_value: &str) -> impl Iterator<Item = &str> {
    header_value
        .split(',')
        .map(|item| item.split(';').next().unwrap_or("").trim())
        .filter(|coding| !coding.is_empty())
}

/// Whether an `Accept-Encoding` value offers at least one coding we produce.
/// Quality parameters are ignored and `*` matches anything.
pub fn accept_encoding_supported(header_value: &str) -> bool {
    codings(header_value).any(|coding| coding == "*" || SUPPORTED_ENCODINGS.contains(&coding))
}

/// Whether every coding applied to a request body is one we can undo.
pub fn content_encoding_supported(header_value: &str) -> bool {
    let mut any = false;
    for coding in codings(header_value) {
        if !SUPPORTED_ENCODINGS.contains(&coding) {
            return false;
        }
        any = true;
    }
    any
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_encoding_negotiation() {
        assert!(accept_encoding_supported("gzip"));
        assert!(accept_encoding_supported("identity"));
        assert!(accept_encoding_supported("br, gzip;q=0.8"));
        assert!(accept_encoding_supported("*"));
        assert!(!accept_encoding_supported("br"));
        assert!(!accept_encoding_supported("compress, deflate"));
        assert!(!accept_encoding_supported(""));
    }

    #[test]
    fn content_encoding_must_be_fully_supported() {
        assert!(content_encoding_supported("gzip"));
        assert!(content_encoding_supported("identity"));
        assert!(!content_encoding_supported("gzip, br"));
        assert!(!content_encoding_supported("deflate"));
        assert!(!content_encoding_supported(""));
    }

    #[test]
    fn login_request_tolerates_missing_fields() {
        let req: LoginRequest = serde_json::from_str(r#"{"username":"bob"}"#).unwrap();
        assert_eq!(req.username, "bob");
        assert!(req.password.is_empty());
    }

    #[test]
    fn login_request_debug_hides_password() {
        let req = LoginRequest {
            username: "bob".into(),
            password: "hunter2".into(),
        };
        assert!(!format!("{req:?}").contains("hunter2"));
    }
}
