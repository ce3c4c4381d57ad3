//! Handshake header types

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Free-form metadata attached to a response by handshake callbacks
pub type Values = BTreeMap<String, serde_json::Value>;

/// Sent once by the client immediately after connecting
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHeader {
    /// Protocol version the client speaks
    pub version: u32,
    /// Display name of the tunnel (diagnostics only)
    #[serde(default)]
    pub name: String,
    /// Shared-secret credential
    #[serde(default)]
    pub token: String,
    /// Requested bind address for the shadow listener; may be empty
    #[serde(default)]
    pub shadow_addr: String,
}

impl RequestHeader {
    pub fn new(
        name: impl Into<String>,
        token: impl Into<String>,
        shadow_addr: impl Into<String>,
    ) -> Self {
        Self {
            version: crate::PROTOCOL_VERSION,
            name: name.into(),
            token: token.into(),
            shadow_addr: shadow_addr.into(),
        }
    }
}

// The token is a credential and must never reach the logs.
impl std::fmt::Debug for RequestHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHeader")
            .field("version", &self.version)
            .field("name", &self.name)
            .field("token", &"<redacted>")
            .field("shadow_addr", &self.shadow_addr)
            .finish()
    }
}

/// Sent once by the server; terminal for the handshake
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseHeader {
    /// Address the server actually bound for the shadow listener
    #[serde(default)]
    pub shadow_addr: String,
    /// Non-empty when the handshake failed
    #[serde(default)]
    pub error: String,
    /// Metadata populated by server-side handshake callbacks
    #[serde(default)]
    pub values: Values,
}

impl ResponseHeader {
    /// Build a failure response carrying `error`
    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            ..Default::default()
        }
    }

    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_uses_current_version() {
        let req = RequestHeader::new("db", "secret", ":0");
        assert_eq!(req.version, crate::PROTOCOL_VERSION);
        assert_eq!(req.shadow_addr, ":0");
    }

    #[test]
    fn test_request_debug_redacts_token() {
        let req = RequestHeader::new("db", "hunter2", "");
        let printed = format!("{:?}", req);
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("<redacted>"));
    }

    #[test]
    fn test_rejected_response() {
        let resp = ResponseHeader::rejected("nope");
        assert!(resp.is_error());
        assert!(resp.shadow_addr.is_empty());
        assert!(resp.values.is_empty());
        assert!(!ResponseHeader::default().is_error());
    }
}
