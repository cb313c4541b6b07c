//! Client configuration handling.
//!
//! Configuration is read from `config.toml` in the platform config directory
//! (if present) and then overridden by environment variables:
//!
//! | Variable                | Field           |
//! |-------------------------|-----------------|
//! | `OUTLOOK_CLIENT_ID`     | `client_id`     |
//! | `OUTLOOK_CLIENT_SECRET` | `client_secret` |
//! | `OUTLOOK_TENANT_ID`     | `tenant_id`     |
//! | `OUTLOOK_REDIRECT_URI`  | `redirect_uri`  |
//! | `OUTLOOK_TOKEN_CACHE`   | `cache_path`    |

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::cache::{CacheError, TokenCache};
use crate::error::AuthError;
use crate::model::Secret;
use crate::provider::{GRAPH_RESOURCE, MICROSOFT_AUTHORITY_HOST, ProviderConfig};

/// Graph API base URL.
pub const GRAPH_BASE_URL: &str = "https://graph.microsoft.com/v1.0";

/// Redirect URI registered for the local callback listener.
pub const DEFAULT_REDIRECT_URI: &str = "http://localhost:5000/callback";

/// Delegated permissions requested during interactive authorization.
pub const DEFAULT_GRAPH_PERMISSIONS: &[&str] = &[
    "Mail.Read",
    "Mail.ReadWrite",
    "Mail.Send",
    "Calendars.Read",
    "Calendars.ReadWrite",
    "User.Read",
];

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config from {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid TOML for this schema.
    #[error("failed to parse config from {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// A required value is not set.
    #[error("{field} is not set (config file or {env})")]
    Missing {
        field: &'static str,
        env: &'static str,
    },

    /// A value is set but unusable.
    #[error("invalid {field}: {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },
}

impl From<ConfigError> for AuthError {
    fn from(err: ConfigError) -> Self {
        AuthError::Config {
            message: err.to_string(),
        }
    }
}

/// Configuration for the auth manager and Graph client.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Application (client) ID of the app registration.
    pub client_id: String,

    /// Client secret; required for the client credentials grant.
    pub client_secret: Option<Secret>,

    /// Tenant ID, domain, or `common`.
    pub tenant_id: String,

    /// Authority host of the identity provider.
    pub authority_host: String,

    /// Redirect URI for the authorization code flow.
    pub redirect_uri: String,

    /// Delegated scopes requested during authorization and refresh.
    pub scopes: Vec<String>,

    /// Graph API base URL.
    pub graph_base_url: String,

    /// Token cache location; defaults to the platform data directory.
    pub cache_path: Option<PathBuf>,

    /// Seconds subtracted from a token's expiry before it is considered unusable.
    pub skew_margin_secs: u64,

    /// Timeout for token exchanges and Graph requests.
    pub request_timeout_secs: u64,

    /// How long interactive authorization waits for the callback.
    pub callback_timeout_secs: u64,

    /// Let a delegated identity without a refresh token fall back to an app-only token.
    pub allow_client_credentials_fallback: bool,

    /// Path to the configuration file that was loaded.
    #[serde(skip)]
    pub config_path: Option<PathBuf>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: None,
            tenant_id: "common".to_string(),
            authority_host: MICROSOFT_AUTHORITY_HOST.to_string(),
            redirect_uri: DEFAULT_REDIRECT_URI.to_string(),
            scopes: default_scopes(),
            graph_base_url: GRAPH_BASE_URL.to_string(),
            cache_path: None,
            skew_margin_secs: 60,
            request_timeout_secs: 30,
            callback_timeout_secs: 300,
            allow_client_credentials_fallback: false,
            config_path: None,
        }
    }
}

/// Fully qualified default delegated scopes, plus `offline_access` for a refresh token.
pub fn default_scopes() -> Vec<String> {
    DEFAULT_GRAPH_PERMISSIONS
        .iter()
        .map(|p| format!("{GRAPH_RESOURCE}/{p}"))
        .chain(std::iter::once("offline_access".to_string()))
        .collect()
}

impl AuthConfig {
    /// Create a configuration for a client ID with defaults for everything else.
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            ..Self::default()
        }
    }

    /// Set the client secret.
    pub fn with_client_secret(mut self, secret: impl Into<String>) -> Self {
        self.client_secret = Some(Secret::new(secret));
        self
    }

    /// Set the tenant.
    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = tenant_id.into();
        self
    }

    /// Set the authority host.
    pub fn with_authority_host(mut self, host: impl Into<String>) -> Self {
        self.authority_host = host.into();
        self
    }

    /// Set the Graph base URL.
    pub fn with_graph_base_url(mut self, url: impl Into<String>) -> Self {
        self.graph_base_url = url.into();
        self
    }

    /// Set the redirect URI.
    pub fn with_redirect_uri(mut self, uri: impl Into<String>) -> Self {
        self.redirect_uri = uri.into();
        self
    }

    /// Set the token cache path.
    pub fn with_cache_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_path = Some(path.into());
        self
    }

    /// Get the default config file path.
    pub fn default_path() -> Option<PathBuf> {
        project_dirs().map(|d| d.config_dir().join("config.toml"))
    }

    /// Load configuration from the default location plus environment overrides.
    ///
    /// A missing config file is not an error.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match Self::default_path() {
            Some(path) if path.exists() => Self::load_from_path(&path)?,
            _ => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific TOML file, without environment overrides.
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut config: Self = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.config_path = Some(path.to_path_buf());

        tracing::debug!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from a variable lookup; empty values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("OUTLOOK_CLIENT_ID") {
            self.client_id = v;
        }
        if let Some(v) = get("OUTLOOK_CLIENT_SECRET") {
            self.client_secret = Some(Secret::new(v));
        }
        if let Some(v) = get("OUTLOOK_TENANT_ID") {
            self.tenant_id = v;
        }
        if let Some(v) = get("OUTLOOK_REDIRECT_URI") {
            self.redirect_uri = v;
        }
        if let Some(v) = get("OUTLOOK_TOKEN_CACHE") {
            self.cache_path = Some(PathBuf::from(v));
        }
    }

    /// Check that the configuration can drive the auth flows.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.client_id.trim().is_empty() {
            return Err(ConfigError::Missing {
                field: "client_id",
                env: "OUTLOOK_CLIENT_ID",
            });
        }
        if self.tenant_id.trim().is_empty() {
            return Err(ConfigError::Missing {
                field: "tenant_id",
                env: "OUTLOOK_TENANT_ID",
            });
        }
        self.redirect_url()?;
        Url::parse(&self.graph_base_url).map_err(|e| ConfigError::Invalid {
            field: "graph_base_url",
            message: e.to_string(),
        })?;
        Ok(())
    }

    /// Parsed redirect URI.
    pub fn redirect_url(&self) -> Result<Url, ConfigError> {
        let url = Url::parse(&self.redirect_uri).map_err(|e| ConfigError::Invalid {
            field: "redirect_uri",
            message: e.to_string(),
        })?;
        if url.host_str().is_none() {
            return Err(ConfigError::Invalid {
                field: "redirect_uri",
                message: "redirect URI has no host".to_string(),
            });
        }
        Ok(url)
    }

    /// Identity provider endpoints for this tenant.
    pub fn provider(&self) -> ProviderConfig {
        ProviderConfig::microsoft(&self.authority_host, &self.tenant_id)
    }

    /// Resolved token cache path.
    pub fn resolved_cache_path(&self) -> Result<PathBuf, CacheError> {
        match &self.cache_path {
            Some(path) => Ok(path.clone()),
            None => TokenCache::default_path(),
        }
    }

    /// Safety margin applied to token expiry.
    pub fn skew_margin(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.skew_margin_secs as i64)
    }

    /// Timeout for a single token exchange or Graph request.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Wait window for the interactive authorization callback.
    pub fn callback_timeout(&self) -> Duration {
        Duration::from_secs(self.callback_timeout_secs)
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "outlook-mcp", "outlook-mcp")
}
