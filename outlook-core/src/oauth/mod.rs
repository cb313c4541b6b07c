//! OAuth 2.0 grant implementations.
//!
//! This module provides:
//! - [`TokenExchange`] - The token endpoint seam used by the auth manager
//! - [`OAuthTokenEndpoint`] - `oauth2`-backed implementation of [`TokenExchange`]
//! - [`pkce`] - Authorization Code flow with PKCE and the [`AuthorizationAttempt`](pkce::AuthorizationAttempt)
//! - [`callback`] - Redirect parsing and the local callback listener
//!
//! Token endpoint failures are classified at this boundary: an OAuth error
//! response becomes [`AuthError::InvalidGrant`], anything that prevented a
//! response from arriving becomes [`AuthError::NetworkFailure`].

pub mod callback;
pub mod pkce;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use oauth2::{
    AuthType, AuthUrl, AuthorizationCode, ClientId, ClientSecret, PkceCodeVerifier, RedirectUrl,
    RefreshToken, RequestTokenError, Scope, TokenResponse, TokenUrl,
    basic::{BasicClient, BasicErrorResponse, BasicTokenResponse},
    reqwest::async_http_client,
};

use crate::error::AuthError;
use crate::model::Secret;
use crate::provider::ProviderConfig;
use crate::token::TokenGrant;

/// Token endpoint operations needed by the auth manager.
///
/// Each call performs exactly one round-trip to the identity provider.
#[async_trait]
pub trait TokenExchange: Send + Sync {
    /// Redeem an authorization code with its PKCE verifier.
    async fn exchange_code(
        &self,
        code: &str,
        pkce_verifier: &Secret,
        redirect_uri: &str,
    ) -> Result<TokenGrant, AuthError>;

    /// Redeem a refresh token for a new access token.
    async fn exchange_refresh_token(
        &self,
        refresh_token: &Secret,
        scopes: &[String],
    ) -> Result<TokenGrant, AuthError>;

    /// Acquire an app-only token.
    async fn exchange_client_credentials(&self, scope: &str) -> Result<TokenGrant, AuthError>;
}

/// Create an OAuth2 client from a provider configuration.
///
/// Client credentials are sent in the request body, which the Microsoft
/// identity platform expects for confidential clients.
///
/// # Arguments
///
/// * `config` - Provider configuration
/// * `client_id` - OAuth client ID
/// * `client_secret` - Optional client secret (required for confidential clients)
/// * `redirect_uri` - Redirect URI for the authorization code flow
pub fn create_oauth_client(
    config: &ProviderConfig,
    client_id: &str,
    client_secret: Option<&Secret>,
    redirect_uri: Option<&str>,
) -> Result<BasicClient, AuthError> {
    let auth_url = AuthUrl::new(config.auth_url.clone()).map_err(|e| AuthError::Config {
        message: format!("invalid auth URL: {}", e),
    })?;

    let token_url = TokenUrl::new(config.token_url.clone()).map_err(|e| AuthError::Config {
        message: format!("invalid token URL: {}", e),
    })?;

    let mut client = BasicClient::new(
        ClientId::new(client_id.to_string()),
        client_secret.map(|s| ClientSecret::new(s.expose().to_string())),
        auth_url,
        Some(token_url),
    )
    .set_auth_type(AuthType::RequestBody);

    if let Some(redirect) = redirect_uri {
        let redirect_url =
            RedirectUrl::new(redirect.to_string()).map_err(|e| AuthError::Config {
                message: format!("invalid redirect URL: {}", e),
            })?;
        client = client.set_redirect_uri(redirect_url);
    }

    Ok(client)
}

/// Token endpoint backed by the `oauth2` crate.
#[derive(Debug, Clone)]
pub struct OAuthTokenEndpoint {
    provider: ProviderConfig,
    client_id: String,
    client_secret: Option<Secret>,
    timeout: Duration,
}

impl OAuthTokenEndpoint {
    /// Create a token endpoint client.
    ///
    /// `timeout` bounds every exchange; an exchange that exceeds it fails with
    /// [`AuthError::NetworkFailure`].
    pub fn new(
        provider: ProviderConfig,
        client_id: impl Into<String>,
        client_secret: Option<Secret>,
        timeout: Duration,
    ) -> Self {
        Self {
            provider,
            client_id: client_id.into(),
            client_secret,
            timeout,
        }
    }

    async fn bounded<F>(&self, exchange: F) -> Result<TokenGrant, AuthError>
    where
        F: Future<Output = Result<TokenGrant, AuthError>>,
    {
        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| AuthError::NetworkFailure {
                message: format!(
                    "token endpoint did not respond within {}s",
                    self.timeout.as_secs()
                ),
            })?
    }
}

#[async_trait]
impl TokenExchange for OAuthTokenEndpoint {
    async fn exchange_code(
        &self,
        code: &str,
        pkce_verifier: &Secret,
        redirect_uri: &str,
    ) -> Result<TokenGrant, AuthError> {
        let client = create_oauth_client(
            &self.provider,
            &self.client_id,
            self.client_secret.as_ref(),
            Some(redirect_uri),
        )?;

        self.bounded(async {
            let response = client
                .exchange_code(AuthorizationCode::new(code.to_string()))
                .set_pkce_verifier(PkceCodeVerifier::new(pkce_verifier.expose().to_string()))
                .request_async(async_http_client)
                .await
                .map_err(classify_token_error)?;
            Ok(grant_from_response(&response))
        })
        .await
    }

    async fn exchange_refresh_token(
        &self,
        refresh_token: &Secret,
        scopes: &[String],
    ) -> Result<TokenGrant, AuthError> {
        let client = create_oauth_client(
            &self.provider,
            &self.client_id,
            self.client_secret.as_ref(),
            None,
        )?;
        let refresh_token = RefreshToken::new(refresh_token.expose().to_string());

        self.bounded(async {
            let response = client
                .exchange_refresh_token(&refresh_token)
                .add_scopes(scopes.iter().map(|s| Scope::new(s.clone())))
                .request_async(async_http_client)
                .await
                .map_err(classify_token_error)?;
            Ok(grant_from_response(&response))
        })
        .await
    }

    async fn exchange_client_credentials(&self, scope: &str) -> Result<TokenGrant, AuthError> {
        let secret = self.client_secret.as_ref().ok_or_else(|| AuthError::Config {
            message: "client secret is required for the client credentials grant".to_string(),
        })?;
        let client = create_oauth_client(&self.provider, &self.client_id, Some(secret), None)?;

        self.bounded(async {
            let response = client
                .exchange_client_credentials()
                .add_scope(Scope::new(scope.to_string()))
                .request_async(async_http_client)
                .await
                .map_err(classify_token_error)?;
            Ok(grant_from_response(&response))
        })
        .await
    }
}

/// Map an `oauth2` request failure onto the auth error taxonomy.
fn classify_token_error<RE>(err: RequestTokenError<RE, BasicErrorResponse>) -> AuthError
where
    RE: std::error::Error + 'static,
{
    match err {
        RequestTokenError::ServerResponse(response) => {
            tracing::error!(
                "Token endpoint rejected the grant: {}",
                response.error().as_ref()
            );
            AuthError::InvalidGrant {
                code: response.error().as_ref().to_string(),
                description: response.error_description().cloned(),
            }
        }
        RequestTokenError::Request(e) => AuthError::NetworkFailure {
            message: e.to_string(),
        },
        RequestTokenError::Parse(e, _) => AuthError::NetworkFailure {
            message: format!("unexpected token endpoint response: {}", e),
        },
        RequestTokenError::Other(message) => AuthError::NetworkFailure { message },
    }
}

fn grant_from_response(response: &BasicTokenResponse) -> TokenGrant {
    let expires_in = response
        .expires_in()
        .and_then(|d| chrono::Duration::from_std(d).ok());
    let scopes = response
        .scopes()
        .map(|s| s.iter().map(|scope| scope.to_string()).collect())
        .unwrap_or_default();

    TokenGrant {
        access_token: Secret::new(response.access_token().secret().clone()),
        refresh_token: response
            .refresh_token()
            .map(|t| Secret::new(t.secret().clone())),
        expires_in,
        scopes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_provider() -> ProviderConfig {
        ProviderConfig::default()
            .with_auth_url("https://example.com/auth")
            .with_token_url("https://example.com/token")
            .with_app_scope("https://graph.microsoft.com/.default")
    }

    #[test]
    fn test_create_oauth_client() {
        let client = create_oauth_client(
            &test_provider(),
            "test-client-id",
            Some(&Secret::new("test-secret")),
            Some("http://localhost:5000/callback"),
        );

        assert!(client.is_ok());
    }

    #[test]
    fn test_create_oauth_client_invalid_urls() {
        let config = test_provider().with_auth_url("not a valid url");

        let client = create_oauth_client(&config, "test-client-id", None, None);

        assert!(matches!(client, Err(AuthError::Config { .. })));
    }

    #[tokio::test]
    async fn test_client_credentials_requires_secret() {
        let endpoint =
            OAuthTokenEndpoint::new(test_provider(), "client", None, Duration::from_secs(5));

        let result = endpoint
            .exchange_client_credentials("https://graph.microsoft.com/.default")
            .await;

        assert!(matches!(result, Err(AuthError::Config { .. })));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_network_failure() {
        // Nothing listens on port 9 on loopback.
        let provider = test_provider().with_token_url("http://127.0.0.1:9/token");
        let endpoint = OAuthTokenEndpoint::new(
            provider,
            "client",
            Some(Secret::new("secret")),
            Duration::from_secs(5),
        );

        let result = endpoint
            .exchange_refresh_token(&Secret::new("rt"), &[])
            .await;

        assert!(matches!(result, Err(AuthError::NetworkFailure { .. })));
    }
}
