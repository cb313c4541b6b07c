//! Authorization Code flow with PKCE (Proof Key for Code Exchange).
//!
//! # Flow Overview
//!
//! 1. [`AuthManager::begin_interactive_authorization`](crate::AuthManager::begin_interactive_authorization)
//!    generates a PKCE verifier/challenge and a CSRF state, and returns an
//!    [`AuthorizationAttempt`] holding the authorization URL
//! 2. The user authorizes in a browser
//! 3. The redirect arrives at the loopback listener, or the user pastes it
//!    into a [`CallbackSubmitter`]
//! 4. The manager checks `state` and exchanges the code using the verifier
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use outlook_core::{AuthConfig, AuthManager, AuthorizationMode, IdentityId};
//!
//! let manager = AuthManager::from_config(AuthConfig::load()?)?;
//! let attempt = manager
//!     .begin_interactive_authorization(&IdentityId::delegated(), AuthorizationMode::Listen)
//!     .await?;
//!
//! println!("Visit: {}", attempt.authorization_url());
//! let token = manager.complete_interactive_authorization(attempt).await?;
//! # Ok(())
//! # }
//! ```

use oauth2::{CsrfToken, PkceCodeChallenge, Scope};
use tokio::sync::mpsc;
use url::Url;

use super::callback::{CallbackData, CallbackEvent, CallbackListener};
use super::create_oauth_client;
use crate::error::AuthError;
use crate::model::{IdentityId, Secret};
use crate::provider::ProviderConfig;

/// How the authorization callback reaches the attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationMode {
    /// Bind a loopback listener on the redirect URI.
    Listen,

    /// No listener; the redirect is submitted through a [`CallbackSubmitter`].
    Manual,
}

/// Authorization URL plus the secrets that must accompany its callback.
pub(crate) struct AuthorizationRequest {
    pub url: Url,
    pub csrf_state: Secret,
    pub pkce_verifier: Secret,
}

/// Generate a random CSRF `state` value.
///
/// Created before the listener is bound so the listener can ignore
/// callbacks that do not carry it.
pub(crate) fn new_csrf_state() -> Secret {
    Secret::new(CsrfToken::new_random().secret().clone())
}

/// Build an authorization URL with a fresh PKCE challenge and the given CSRF state.
pub(crate) fn build_authorization_request(
    config: &ProviderConfig,
    client_id: &str,
    redirect_uri: &Url,
    scopes: &[String],
    csrf_state: Secret,
) -> Result<AuthorizationRequest, AuthError> {
    let client = create_oauth_client(config, client_id, None, Some(redirect_uri.as_str()))?;

    let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();

    let state = csrf_state.expose().to_string();
    let (url, _) = client
        .authorize_url(move || CsrfToken::new(state))
        .add_scopes(scopes.iter().map(|s| Scope::new(s.clone())))
        .set_pkce_challenge(pkce_challenge)
        .url();

    Ok(AuthorizationRequest {
        url,
        csrf_state,
        pkce_verifier: Secret::new(pkce_verifier.secret().clone()),
    })
}

/// One pending interactive authorization.
///
/// Owns the PKCE verifier and the expected CSRF state; hand it back to
/// [`AuthManager::complete_interactive_authorization`](crate::AuthManager::complete_interactive_authorization)
/// or [`AuthManager::complete_with_callback`](crate::AuthManager::complete_with_callback)
/// to finish. Dropping the attempt shuts down its listener.
pub struct AuthorizationAttempt {
    identity: IdentityId,
    authorization_url: Url,
    redirect_uri: Url,
    pub(crate) csrf_state: Secret,
    pub(crate) pkce_verifier: Secret,
    events_tx: mpsc::Sender<CallbackEvent>,
    pub(crate) events_rx: mpsc::Receiver<CallbackEvent>,
    listener: Option<CallbackListener>,
}

impl AuthorizationAttempt {
    pub(crate) fn new(
        identity: IdentityId,
        request: AuthorizationRequest,
        redirect_uri: Url,
        events: (mpsc::Sender<CallbackEvent>, mpsc::Receiver<CallbackEvent>),
        listener: Option<CallbackListener>,
    ) -> Self {
        let (events_tx, events_rx) = events;
        Self {
            identity,
            authorization_url: request.url,
            redirect_uri,
            csrf_state: request.csrf_state,
            pkce_verifier: request.pkce_verifier,
            events_tx,
            events_rx,
            listener,
        }
    }

    /// Identity this attempt authorizes.
    pub fn identity(&self) -> &IdentityId {
        &self.identity
    }

    /// URL the user must open to sign in.
    pub fn authorization_url(&self) -> &Url {
        &self.authorization_url
    }

    /// Redirect URI sent to the provider (and used again for the code exchange).
    pub fn redirect_uri(&self) -> &Url {
        &self.redirect_uri
    }

    /// Whether a loopback listener is waiting for the callback.
    pub fn is_listening(&self) -> bool {
        self.listener.is_some()
    }

    /// Handle for delivering a pasted redirect or cancelling from another task.
    pub fn submitter(&self) -> CallbackSubmitter {
        CallbackSubmitter {
            events: self.events_tx.clone(),
        }
    }

    /// Deliver a redirect URL the user pasted (headless sign-in).
    pub fn submit_redirect_url(&self, redirect: &str) -> Result<(), AuthError> {
        self.submitter().submit_redirect_url(redirect)
    }

    /// Abandon the attempt. The listener shuts down and no exchange happens.
    pub fn cancel(self) {
        tracing::info!("Cancelled authorization for {}", self.identity);
    }

    pub(crate) fn shutdown_listener(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.shutdown();
        }
    }
}

impl std::fmt::Debug for AuthorizationAttempt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationAttempt")
            .field("identity", &self.identity)
            .field("authorization_url", &self.authorization_url.as_str())
            .field("redirect_uri", &self.redirect_uri.as_str())
            .field("listening", &self.listener.is_some())
            .finish()
    }
}

/// Delivers a callback to a pending [`AuthorizationAttempt`].
///
/// Only the first delivered event is consumed; later ones are ignored.
#[derive(Debug, Clone)]
pub struct CallbackSubmitter {
    events: mpsc::Sender<CallbackEvent>,
}

impl CallbackSubmitter {
    /// Submit parsed callback data.
    pub fn submit(&self, data: CallbackData) -> Result<(), AuthError> {
        self.events
            .try_send(CallbackEvent::Received(data))
            .map_err(|_| AuthError::Cancelled)
    }

    /// Parse and submit a redirect URL copied from the browser.
    pub fn submit_redirect_url(&self, redirect: &str) -> Result<(), AuthError> {
        self.submit(CallbackData::from_redirect_url(redirect)?)
    }

    /// Cancel the attempt while it is being awaited.
    pub fn cancel(&self) {
        let _ = self.events.try_send(CallbackEvent::Cancelled);
    }
}
