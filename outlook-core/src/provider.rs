//! Identity provider endpoint configuration.
//!
//! [`ProviderConfig`] describes the endpoints of the OAuth provider the
//! [`AuthManager`](crate::AuthManager) talks to. The Microsoft identity
//! platform layout is built in via [`ProviderConfig::microsoft`].

use serde::{Deserialize, Serialize};

/// Default Microsoft Entra authority host.
pub const MICROSOFT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com";

/// Resource prefix for Microsoft Graph permission scopes.
pub const GRAPH_RESOURCE: &str = "https://graph.microsoft.com";

/// Configuration for an OAuth provider.
///
/// # Example
///
/// ```
/// use outlook_core::provider::ProviderConfig;
///
/// let entra = ProviderConfig::microsoft("https://login.microsoftonline.com", "common");
/// assert_eq!(
///     entra.token_url,
///     "https://login.microsoftonline.com/common/oauth2/v2.0/token"
/// );
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProviderConfig {
    /// OAuth authorization endpoint URL (browser redirect target).
    pub auth_url: String,

    /// OAuth token endpoint URL.
    pub token_url: String,

    /// Scope requested by the client credentials grant.
    pub app_scope: String,
}

impl ProviderConfig {
    /// Microsoft identity platform (v2.0 endpoints) for a tenant.
    ///
    /// `tenant` may be a tenant ID, a verified domain, or one of
    /// `common` / `organizations` / `consumers`.
    pub fn microsoft(authority_host: &str, tenant: &str) -> Self {
        let authority = format!("{}/{}", authority_host.trim_end_matches('/'), tenant);

        Self::default()
            .with_auth_url(format!("{authority}/oauth2/v2.0/authorize"))
            .with_token_url(format!("{authority}/oauth2/v2.0/token"))
            .with_app_scope(format!("{GRAPH_RESOURCE}/.default"))
    }

    /// Set the authorization URL.
    pub fn with_auth_url(mut self, url: impl Into<String>) -> Self {
        self.auth_url = url.into();
        self
    }

    /// Set the token URL.
    pub fn with_token_url(mut self, url: impl Into<String>) -> Self {
        self.token_url = url.into();
        self
    }

    /// Set the client credentials scope.
    pub fn with_app_scope(mut self, scope: impl Into<String>) -> Self {
        self.app_scope = scope.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_config_builder() {
        let config = ProviderConfig::default()
            .with_auth_url("https://example.com/auth")
            .with_token_url("https://example.com/token")
            .with_app_scope("api://test/.default");

        assert_eq!(config.auth_url, "https://example.com/auth");
        assert_eq!(config.token_url, "https://example.com/token");
        assert_eq!(config.app_scope, "api://test/.default");
    }

    #[test]
    fn test_microsoft_endpoints() {
        let config = ProviderConfig::microsoft("https://login.microsoftonline.com/", "contoso.com");

        assert_eq!(
            config.auth_url,
            "https://login.microsoftonline.com/contoso.com/oauth2/v2.0/authorize"
        );
        assert_eq!(
            config.token_url,
            "https://login.microsoftonline.com/contoso.com/oauth2/v2.0/token"
        );
        assert_eq!(config.app_scope, "https://graph.microsoft.com/.default");
    }
}
