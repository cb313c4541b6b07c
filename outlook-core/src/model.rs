//! Domain model types for Outlook MCP authentication.
//!
//! This module defines the identifiers and small value types shared by the
//! token cache, the auth manager and the Graph client:
//! - [`IdentityId`] - Name of a configured identity (delegated user or app-only service)
//! - [`FlowKind`] - Which OAuth2 grant produced (and refreshes) a credential
//! - [`Secret`] - A wrapper for sensitive values that prevents accidental logging

use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroize;

/// Identifier for a configured identity.
///
/// Identity IDs are the keys of the token cache. Two identities are well known:
/// [`IdentityId::delegated`] for the signed-in user and [`IdentityId::service`]
/// for the application acting as itself.
///
/// # Examples
///
/// ```
/// use outlook_core::IdentityId;
///
/// let me = IdentityId::delegated();
/// assert_eq!(me.as_str(), "delegated");
/// assert_eq!(IdentityId::new("Service"), IdentityId::service());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityId(String);

impl IdentityId {
    const DELEGATED: &'static str = "delegated";
    const SERVICE: &'static str = "service";

    /// Create a new identity ID.
    ///
    /// The ID is normalized to lowercase.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into().to_lowercase())
    }

    /// The signed-in user identity (authorization code flow).
    pub fn delegated() -> Self {
        Self(Self::DELEGATED.to_string())
    }

    /// The application identity (client credentials flow).
    pub fn service() -> Self {
        Self(Self::SERVICE.to_string())
    }

    /// Get the identity ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The flow used to acquire a token for this identity when nothing is cached.
    pub fn default_flow(&self) -> FlowKind {
        if self.0 == Self::SERVICE {
            FlowKind::ClientCredentials
        } else {
            FlowKind::Delegated
        }
    }
}

impl Default for IdentityId {
    fn default() -> Self {
        Self::delegated()
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for IdentityId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for IdentityId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// OAuth2 grant a credential was obtained with.
///
/// Determines how an expired credential is renewed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowKind {
    /// Authorization code grant on behalf of a user; refreshable.
    Delegated,

    /// Client credentials grant as the application; re-acquired on expiry.
    ClientCredentials,
}

impl FlowKind {
    /// Get the flow kind as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delegated => "delegated",
            Self::ClientCredentials => "client_credentials",
        }
    }
}

impl fmt::Display for FlowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A secret value that prevents accidental exposure in logs.
///
/// The inner value is only accessible via [`expose()`](Secret::expose).
/// Debug and Display implementations show `[REDACTED]` instead of the value.
/// The buffer is wiped when the secret is dropped.
#[derive(Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    /// Create a new secret from a string value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Expose the secret value.
    ///
    /// Use sparingly and never log the result.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Consume the secret and return the inner value.
    pub fn into_inner(mut self) -> String {
        std::mem::take(&mut self.0)
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret([REDACTED])")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl PartialEq for Secret {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for Secret {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_id_normalization() {
        let id = IdentityId::new("Delegated");
        assert_eq!(id, IdentityId::delegated());
        assert_eq!(id.to_string(), "delegated");
    }

    #[test]
    fn test_identity_default_flow() {
        assert_eq!(IdentityId::delegated().default_flow(), FlowKind::Delegated);
        assert_eq!(
            IdentityId::service().default_flow(),
            FlowKind::ClientCredentials
        );
        assert_eq!(IdentityId::new("work").default_flow(), FlowKind::Delegated);
    }

    #[test]
    fn test_flow_kind_serde() {
        let json = serde_json::to_string(&FlowKind::ClientCredentials).unwrap();
        assert_eq!(json, "\"client_credentials\"");

        let parsed: FlowKind = serde_json::from_str("\"delegated\"").unwrap();
        assert_eq!(parsed, FlowKind::Delegated);
    }

    #[test]
    fn test_secret_debug_redacted() {
        let secret = Secret::new("super-secret");
        let debug = format!("{:?}", secret);
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("REDACTED"));
    }

    #[test]
    fn test_secret_display_redacted() {
        let secret = Secret::new("super-secret");
        assert_eq!(format!("{}", secret), "[REDACTED]");
    }

    #[test]
    fn test_secret_serializes_as_plain_string() {
        let secret = Secret::new("abc");
        assert_eq!(serde_json::to_string(&secret).unwrap(), "\"abc\"");
        assert_eq!(secret.into_inner(), "abc");
    }
}
