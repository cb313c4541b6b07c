//! Token lifecycle management.
//!
//! [`AuthManager`] owns the in-memory credential state of every configured
//! identity and decides, per request, whether a cached access token can be
//! handed out or has to be refreshed or re-acquired.
//!
//! # Acquisition rules
//!
//! - A token is usable while `now < expires_at - skew_margin` and it has not
//!   been invalidated; it is returned with no I/O.
//! - Otherwise a delegated credential with a refresh token is refreshed.
//! - Without a refresh token, the `service` identity (and, when
//!   `allow_client_credentials_fallback` is set, any identity) acquires an
//!   app-only token with the client credentials grant.
//! - Anything else needs the interactive flow:
//!   [`begin_interactive_authorization`](AuthManager::begin_interactive_authorization)
//!   followed by
//!   [`complete_interactive_authorization`](AuthManager::complete_interactive_authorization).
//!
//! Every new credential is written to memory, then to the [`TokenCache`],
//! and only then returned. If the cache write fails the credential stays in
//! memory (its refresh token may already have rotated) but is not handed out
//! until a later write succeeds. Exchanges for one identity are serialized
//! behind a per-identity gate; a caller that waited on the gate re-checks the
//! state first and reuses a token someone else just obtained.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{Mutex as AsyncMutex, mpsc};

use crate::cache::TokenCache;
use crate::config::AuthConfig;
use crate::error::AuthError;
use crate::model::{FlowKind, IdentityId, Secret};
use crate::oauth::callback::{CallbackData, CallbackEvent, CallbackListener};
use crate::oauth::pkce::{
    AuthorizationAttempt, AuthorizationMode, build_authorization_request, new_csrf_state,
};
use crate::oauth::{OAuthTokenEndpoint, TokenExchange};
use crate::provider::ProviderConfig;
use crate::token::{CredentialState, TokenStatus};

/// Capacity of an attempt's callback channel; only the first event is consumed.
const CALLBACK_CHANNEL_CAPACITY: usize = 4;

/// Credential state plus flags that live only in memory.
#[derive(Debug, Clone)]
struct Slot {
    state: CredentialState,
    invalidated: bool,
    /// The cache holds `state`.
    persisted: bool,
}

/// Acquires, caches, refreshes and persists OAuth2 tokens.
pub struct AuthManager {
    config: AuthConfig,
    provider: ProviderConfig,
    exchange: Arc<dyn TokenExchange>,
    cache: TokenCache,
    states: RwLock<HashMap<IdentityId, Slot>>,
    gates: Mutex<HashMap<IdentityId, Arc<AsyncMutex<()>>>>,
    /// CSRF state of the newest authorization attempt per identity.
    pending: Mutex<HashMap<IdentityId, Secret>>,
}

impl AuthManager {
    /// Create a manager talking to the configured Microsoft token endpoint.
    pub fn new(config: AuthConfig, cache: TokenCache) -> Self {
        let exchange = OAuthTokenEndpoint::new(
            config.provider(),
            config.client_id.clone(),
            config.client_secret.clone(),
            config.request_timeout(),
        );
        Self::with_exchange(config, cache, Arc::new(exchange))
    }

    /// Create a manager with a custom token endpoint implementation.
    pub fn with_exchange(
        config: AuthConfig,
        cache: TokenCache,
        exchange: Arc<dyn TokenExchange>,
    ) -> Self {
        let states = cache
            .entries()
            .into_iter()
            .map(|(identity, state)| {
                (
                    identity,
                    Slot {
                        state,
                        invalidated: false,
                        persisted: true,
                    },
                )
            })
            .collect::<HashMap<_, _>>();

        tracing::debug!("Auth manager initialized with {} cached identities", states.len());

        Self {
            provider: config.provider(),
            config,
            exchange,
            cache,
            states: RwLock::new(states),
            gates: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Load the token cache named by the configuration and create a manager.
    pub fn from_config(config: AuthConfig) -> Result<Self, AuthError> {
        let path = config.resolved_cache_path()?;
        let cache = TokenCache::load_from_path(path)?;
        Ok(Self::new(config, cache))
    }

    /// Configuration in use.
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Token cache backing this manager.
    pub fn cache(&self) -> &TokenCache {
        &self.cache
    }

    /// Identities that currently hold a credential.
    pub fn identities(&self) -> Vec<IdentityId> {
        let mut ids: Vec<_> = self.states.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Get a usable access token for an identity, refreshing or acquiring one if needed.
    ///
    /// # Errors
    ///
    /// - [`AuthError::ReauthorizationRequired`] if no silent path exists
    /// - [`AuthError::InvalidGrant`] if the identity provider rejected the exchange
    /// - [`AuthError::NetworkFailure`] if the token endpoint could not be reached
    /// - [`AuthError::Cache`] if the credential could not be persisted
    /// - [`AuthError::LifetimeTooShort`] if the new token expires inside the skew margin
    pub async fn get_token(&self, identity: &IdentityId) -> Result<Secret, AuthError> {
        if let Some(token) = self.usable_token(identity) {
            tracing::debug!("Using cached access token for {}", identity);
            return Ok(token);
        }

        let gate = self.gate(identity);
        let _guard = gate.lock().await;

        // Another caller may have finished an exchange while we waited.
        if let Some(token) = self.usable_token(identity) {
            tracing::debug!("Access token for {} was refreshed concurrently", identity);
            return Ok(token);
        }

        if let Some(token) = self.persist_unsaved(identity)? {
            return Ok(token);
        }

        let current = self.states.read().get(identity).map(|slot| slot.state.clone());
        let state = self.acquire(identity, current).await?;
        Ok(state.access_token)
    }

    /// Mark the current access token of an identity unusable.
    ///
    /// The next [`get_token`](Self::get_token) performs a fresh exchange. The
    /// flag is not persisted.
    pub fn force_invalidate(&self, identity: &IdentityId) {
        if let Some(slot) = self.states.write().get_mut(identity) {
            slot.invalidated = true;
            tracing::warn!("Invalidated access token for {}", identity);
        }
    }

    /// Invalidate only if `rejected` is still the current access token.
    ///
    /// Returns `false` when the token has already been replaced, so concurrent
    /// requests rejected with the same stale token trigger a single refresh.
    pub fn invalidate_token(&self, identity: &IdentityId, rejected: &Secret) -> bool {
        let mut states = self.states.write();
        match states.get_mut(identity) {
            Some(slot) if slot.state.access_token == *rejected => {
                slot.invalidated = true;
                tracing::warn!("Invalidated rejected access token for {}", identity);
                true
            }
            _ => false,
        }
    }

    /// Start an interactive authorization for a delegated identity.
    ///
    /// With [`AuthorizationMode::Listen`] a loopback listener is bound on the
    /// redirect URI; with [`AuthorizationMode::Manual`] the redirect has to be
    /// supplied through [`AuthorizationAttempt::submitter`]. Starting a new
    /// attempt for the same identity supersedes the previous one.
    pub async fn begin_interactive_authorization(
        &self,
        identity: &IdentityId,
        mode: AuthorizationMode,
    ) -> Result<AuthorizationAttempt, AuthError> {
        let configured = self.config.redirect_url()?;
        let csrf_state = new_csrf_state();
        let (events_tx, events_rx) = mpsc::channel(CALLBACK_CHANNEL_CAPACITY);

        let (listener, redirect_uri) = match mode {
            AuthorizationMode::Listen => {
                let listener =
                    CallbackListener::bind(&configured, csrf_state.clone(), events_tx.clone())
                        .await?;
                let redirect_uri = listener.redirect_uri().clone();
                (Some(listener), redirect_uri)
            }
            AuthorizationMode::Manual => (None, configured),
        };

        let request = build_authorization_request(
            &self.provider,
            &self.config.client_id,
            &redirect_uri,
            &self.config.scopes,
            csrf_state,
        )?;

        if self
            .pending
            .lock()
            .insert(identity.clone(), request.csrf_state.clone())
            .is_some()
        {
            tracing::debug!("Superseded pending authorization for {}", identity);
        }
        tracing::info!("Started interactive authorization for {}", identity);

        Ok(AuthorizationAttempt::new(
            identity.clone(),
            request,
            redirect_uri,
            (events_tx, events_rx),
            listener,
        ))
    }

    /// Wait for the attempt's callback and exchange the authorization code.
    ///
    /// # Errors
    ///
    /// - [`AuthError::Timeout`] if nothing arrives within `callback_timeout`
    /// - [`AuthError::Cancelled`] if the attempt was cancelled or superseded
    /// - any error of [`complete_with_callback`](Self::complete_with_callback)
    pub async fn complete_interactive_authorization(
        &self,
        mut attempt: AuthorizationAttempt,
    ) -> Result<CredentialState, AuthError> {
        let waited = self.config.callback_timeout();

        let event = tokio::time::timeout(waited, attempt.events_rx.recv()).await;
        attempt.shutdown_listener();

        match event {
            Ok(Some(CallbackEvent::Received(data))) => self.complete_with_callback(attempt, data).await,
            Ok(Some(CallbackEvent::Cancelled)) | Ok(None) => {
                self.clear_pending(&attempt);
                tracing::info!("Authorization for {} was cancelled", attempt.identity());
                Err(AuthError::Cancelled)
            }
            Err(_) => {
                self.clear_pending(&attempt);
                tracing::warn!(
                    "No authorization callback for {} within {}s",
                    attempt.identity(),
                    waited.as_secs()
                );
                Err(AuthError::Timeout { waited })
            }
        }
    }

    /// Finish an attempt with callback data that was already received.
    ///
    /// The `state` is checked before anything is sent to the token endpoint.
    ///
    /// # Errors
    ///
    /// - [`AuthError::Cancelled`] if a newer attempt superseded this one
    /// - [`AuthError::CsrfMismatch`] if `state` does not match
    /// - [`AuthError::InvalidGrant`] for a provider error callback or a rejected code
    /// - [`AuthError::NetworkFailure`] if the token endpoint could not be reached
    pub async fn complete_with_callback(
        &self,
        attempt: AuthorizationAttempt,
        data: CallbackData,
    ) -> Result<CredentialState, AuthError> {
        let identity = attempt.identity().clone();

        {
            let mut pending = self.pending.lock();
            match pending.get(&identity) {
                Some(current) if *current == attempt.csrf_state => {
                    pending.remove(&identity);
                }
                _ => {
                    tracing::warn!("Ignoring callback for a superseded attempt on {}", identity);
                    return Err(AuthError::Cancelled);
                }
            }
        }

        if let Some(state) = data.state() {
            if state != attempt.csrf_state.expose() {
                tracing::warn!("Authorization callback state mismatch for {}", identity);
                return Err(AuthError::CsrfMismatch);
            }
        }

        let code = match data {
            CallbackData::Code { code, .. } => code,
            CallbackData::Error {
                error, description, ..
            } => {
                tracing::error!("Authorization for {} was refused: {}", identity, error);
                return Err(AuthError::InvalidGrant {
                    code: error,
                    description,
                });
            }
        };

        let gate = self.gate(&identity);
        let _guard = gate.lock().await;

        let received_at = Utc::now();
        let grant = self
            .exchange
            .exchange_code(&code, &attempt.pkce_verifier, attempt.redirect_uri().as_str())
            .await
            .inspect_err(|e| tracing::error!("Code exchange for {} failed: {}", identity, e))?;

        let state = CredentialState::from_grant(grant, FlowKind::Delegated, received_at, None);
        tracing::info!("Interactive authorization completed for {}", identity);
        let state = self.store(&identity, state)?;
        self.ensure_usable(received_at, state)
    }

    /// Acquire an app-only token for an identity, replacing any cached credential.
    pub async fn acquire_client_credentials(
        &self,
        identity: &IdentityId,
    ) -> Result<CredentialState, AuthError> {
        let gate = self.gate(identity);
        let _guard = gate.lock().await;
        self.client_credentials(identity).await
    }

    /// Diagnostic view of an identity's credential.
    pub fn status(&self, identity: &IdentityId) -> Option<TokenStatus> {
        let now = Utc::now();
        let skew = self.config.skew_margin();

        self.states.read().get(identity).map(|slot| TokenStatus {
            flow_kind: slot.state.flow_kind,
            usable: !slot.invalidated && slot.state.is_usable_at(now, skew),
            invalidated: slot.invalidated,
            persisted: slot.persisted,
            has_refresh_token: slot.state.refresh_token.is_some(),
            expires_at: slot.state.expires_at,
            scopes: slot.state.scopes.clone(),
        })
    }

    /// Forget an identity's credential in memory and in the cache.
    ///
    /// Returns `false` if nothing was stored for it.
    pub async fn sign_out(&self, identity: &IdentityId) -> Result<bool, AuthError> {
        let gate = self.gate(identity);
        let _guard = gate.lock().await;

        self.pending.lock().remove(identity);
        let in_memory = self.states.write().remove(identity).is_some();
        let on_disk = self.cache.remove(identity)?;

        if in_memory || on_disk {
            tracing::info!("Signed out {}", identity);
        }
        Ok(in_memory || on_disk)
    }

    fn usable_token(&self, identity: &IdentityId) -> Option<Secret> {
        let states = self.states.read();
        let slot = states.get(identity)?;
        if !slot.persisted || !self.is_live(slot) {
            return None;
        }
        Some(slot.state.access_token.clone())
    }

    fn is_live(&self, slot: &Slot) -> bool {
        !slot.invalidated && slot.state.is_usable_at(Utc::now(), self.config.skew_margin())
    }

    /// Retry the cache write for a live credential that only exists in memory.
    /// Caller holds the gate.
    fn persist_unsaved(&self, identity: &IdentityId) -> Result<Option<Secret>, AuthError> {
        let unsaved = self
            .states
            .read()
            .get(identity)
            .filter(|slot| !slot.persisted && self.is_live(slot))
            .map(|slot| slot.state.clone());
        let Some(state) = unsaved else {
            return Ok(None);
        };

        self.cache
            .put(identity, &state)
            .inspect_err(|e| tracing::error!("Token cache for {} still not writable: {}", identity, e))?;
        self.mark_persisted(identity, &state);
        tracing::info!("Persisted pending credential for {}", identity);
        Ok(Some(state.access_token))
    }

    fn mark_persisted(&self, identity: &IdentityId, state: &CredentialState) {
        if let Some(slot) = self.states.write().get_mut(identity) {
            if slot.state.access_token == state.access_token {
                slot.persisted = true;
            }
        }
    }

    /// Reject a fresh credential whose lifetime does not clear the skew margin.
    fn ensure_usable(
        &self,
        received_at: chrono::DateTime<Utc>,
        state: CredentialState,
    ) -> Result<CredentialState, AuthError> {
        let skew = self.config.skew_margin();
        if state.is_usable_at(Utc::now(), skew) {
            return Ok(state);
        }

        let lifetime_secs = (state.expires_at - received_at).num_seconds();
        tracing::error!(
            "Issued access token lives {}s, within the {}s skew margin",
            lifetime_secs,
            skew.num_seconds()
        );
        Err(AuthError::LifetimeTooShort {
            lifetime_secs,
            skew_secs: skew.num_seconds(),
        })
    }

    fn gate(&self, identity: &IdentityId) -> Arc<AsyncMutex<()>> {
        self.gates
            .lock()
            .entry(identity.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn clear_pending(&self, attempt: &AuthorizationAttempt) {
        let mut pending = self.pending.lock();
        if pending.get(attempt.identity()) == Some(&attempt.csrf_state) {
            pending.remove(attempt.identity());
        }
    }

    /// Pick and run the silent acquisition path. Caller holds the gate.
    async fn acquire(
        &self,
        identity: &IdentityId,
        current: Option<CredentialState>,
    ) -> Result<CredentialState, AuthError> {
        if let Some(state) = current.as_ref().filter(|s| s.can_refresh()) {
            return self.refresh(identity, state).await;
        }

        if identity.default_flow() == FlowKind::ClientCredentials
            || self.config.allow_client_credentials_fallback
        {
            return self.client_credentials(identity).await;
        }

        tracing::warn!("No silent token acquisition possible for {}", identity);
        Err(AuthError::ReauthorizationRequired {
            identity: identity.to_string(),
        })
    }

    async fn refresh(
        &self,
        identity: &IdentityId,
        state: &CredentialState,
    ) -> Result<CredentialState, AuthError> {
        let Some(refresh_token) = state.refresh_token.as_ref() else {
            return Err(AuthError::ReauthorizationRequired {
                identity: identity.to_string(),
            });
        };

        tracing::info!("Refreshing access token for {}", identity);

        let received_at = Utc::now();
        let grant = self
            .exchange
            .exchange_refresh_token(refresh_token, &self.config.scopes)
            .await
            .inspect_err(|e| tracing::error!("Token refresh for {} failed: {}", identity, e))?;

        let refreshed = CredentialState::from_grant(
            grant,
            FlowKind::Delegated,
            received_at,
            state.refresh_token.clone(),
        );
        let refreshed = self.store(identity, refreshed)?;
        self.ensure_usable(received_at, refreshed)
    }

    async fn client_credentials(&self, identity: &IdentityId) -> Result<CredentialState, AuthError> {
        tracing::info!("Acquiring app-only token for {}", identity);

        let received_at = Utc::now();
        let grant = self
            .exchange
            .exchange_client_credentials(&self.provider.app_scope)
            .await
            .inspect_err(|e| {
                tracing::error!("Client credentials grant for {} failed: {}", identity, e)
            })?;

        let state =
            CredentialState::from_grant(grant, FlowKind::ClientCredentials, received_at, None);
        let state = self.store(identity, state)?;
        self.ensure_usable(received_at, state)
    }

    /// Install a new credential in memory, then persist it.
    ///
    /// A failed write leaves the slot marked unpersisted; it is retried before
    /// the token is handed out.
    fn store(
        &self,
        identity: &IdentityId,
        state: CredentialState,
    ) -> Result<CredentialState, AuthError> {
        self.states.write().insert(
            identity.clone(),
            Slot {
                state: state.clone(),
                invalidated: false,
                persisted: false,
            },
        );
        self.cache
            .put(identity, &state)
            .inspect_err(|e| tracing::error!("Failed to persist credential for {}: {}", identity, e))?;
        self.mark_persisted(identity, &state);
        Ok(state)
    }
}

impl std::fmt::Debug for AuthManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthManager")
            .field("client_id", &self.config.client_id)
            .field("tenant_id", &self.config.tenant_id)
            .field("cache", &self.cache.path())
            .finish_non_exhaustive()
    }
}
