//! # Outlook Core
//!
//! Token lifecycle management and a resilient Microsoft Graph client for
//! the Outlook MCP server.
//!
//! This crate provides:
//! - [`AuthManager`] - Acquires, caches, refreshes and persists OAuth2 tokens
//!   for the delegated (authorization code + PKCE) and app-only (client
//!   credentials) flows
//! - [`TokenCache`] - Durable JSON token cache with atomic rewrites
//! - [`GraphClient`] - Graph HTTP client with one-shot 401 recovery and typed errors
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use outlook_core::{AuthConfig, AuthManager, GraphClient};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = Arc::new(AuthManager::from_config(AuthConfig::load()?)?);
//! let graph = GraphClient::new(manager)?;
//!
//! let me = graph.get("/me", &[]).await?;
//! println!("{}", me.into_value());
//! # Ok(())
//! # }
//! ```

pub mod auth_manager;
pub mod cache;
pub mod config;
pub mod error;
pub mod graph;
pub mod model;
pub mod oauth;
pub mod provider;
pub mod token;

// Re-export commonly used types at crate root
pub use model::{FlowKind, IdentityId, Secret};

pub use token::{CredentialState, TokenGrant, TokenStatus};

pub use cache::{CacheError, TokenCache};

pub use config::{AuthConfig, ConfigError};

pub use error::{AuthError, GraphError};

pub use provider::ProviderConfig;

pub use oauth::{
    OAuthTokenEndpoint, TokenExchange,
    callback::{CallbackData, CallbackListener},
    pkce::{AuthorizationAttempt, AuthorizationMode, CallbackSubmitter},
};

pub use auth_manager::AuthManager;

pub use graph::{GraphClient, GraphResponse};

pub use reqwest::Method;
