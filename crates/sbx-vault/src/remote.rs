use serde::{Deserialize, Serialize};
use std::fmt;

/// Where and as whom this vault syncs. Absent fields mean "not configured".
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("address", &self.address)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_fields_are_omitted() {
        let json = serde_json::to_string(&RemoteConfig::default()).unwrap();
        assert_eq!(json, "{}");
        let back: RemoteConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(back, RemoteConfig::default());
    }

    #[test]
    fn debug_hides_token() {
        let remote = RemoteConfig {
            address: Some("vault.example:8443".into()),
            token: Some("0d2c6a1e-secret".into()),
        };
        let shown = format!("{remote:?}");
        assert!(shown.contains("vault.example"));
        assert!(!shown.contains("0d2c6a1e"));
    }
}
