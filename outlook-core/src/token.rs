//! Credential state for a configured identity.
//!
//! This module provides:
//! - [`CredentialState`] - The access token, refresh token and expiry held for one identity
//! - [`TokenGrant`] - A successful token endpoint response, before it is pinned to a clock
//! - [`TokenStatus`] - Diagnostic view of a credential without its secrets

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::model::{FlowKind, Secret};

/// Lifetime assumed when the token endpoint omits `expires_in`.
const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;

/// The credential bundle held for one identity.
///
/// A state is only ever replaced whole: a refresh either produces a complete
/// new state or leaves the previous one untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialState {
    /// Bearer token attached to Graph requests.
    pub access_token: Secret,

    /// Refresh token, delegated flow only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<Secret>,

    /// Absolute expiry reported by the identity provider.
    pub expires_at: DateTime<Utc>,

    /// Granted scopes, informational.
    #[serde(default)]
    pub scopes: Vec<String>,

    /// Grant that produced this state.
    pub flow_kind: FlowKind,

    /// Fields written by newer versions, kept so a rewrite does not drop them.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CredentialState {
    /// Create a new credential state.
    pub fn new(
        access_token: impl Into<String>,
        expires_at: DateTime<Utc>,
        flow_kind: FlowKind,
    ) -> Self {
        Self {
            access_token: Secret::new(access_token),
            refresh_token: None,
            expires_at,
            scopes: Vec::new(),
            flow_kind,
            extra: Map::new(),
        }
    }

    /// Attach a refresh token.
    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(Secret::new(refresh_token));
        self
    }

    /// Attach granted scopes.
    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    /// Build a state from a token endpoint response received at `received_at`.
    ///
    /// When the response carries no refresh token, `previous_refresh` is kept
    /// (providers that do not rotate refresh tokens omit it).
    pub fn from_grant(
        grant: TokenGrant,
        flow_kind: FlowKind,
        received_at: DateTime<Utc>,
        previous_refresh: Option<Secret>,
    ) -> Self {
        let lifetime = grant
            .expires_in
            .unwrap_or(Duration::seconds(DEFAULT_TOKEN_LIFETIME_SECS));

        let refresh_token = match flow_kind {
            FlowKind::Delegated => grant.refresh_token.or(previous_refresh),
            FlowKind::ClientCredentials => None,
        };

        Self {
            access_token: grant.access_token,
            refresh_token,
            expires_at: received_at + lifetime,
            scopes: grant.scopes,
            flow_kind,
            extra: Map::new(),
        }
    }

    /// Whether the access token may be handed out at `now`.
    ///
    /// Usable only while `now < expires_at - skew_margin`.
    pub fn is_usable_at(&self, now: DateTime<Utc>, skew_margin: Duration) -> bool {
        now < self.expires_at - skew_margin
    }

    /// Whether a silent refresh-token exchange is possible.
    pub fn can_refresh(&self) -> bool {
        self.flow_kind == FlowKind::Delegated && self.refresh_token.is_some()
    }
}

/// A successful response from the token endpoint.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    /// The issued access token.
    pub access_token: Secret,

    /// A (possibly rotated) refresh token.
    pub refresh_token: Option<Secret>,

    /// Relative lifetime from `expires_in`.
    pub expires_in: Option<Duration>,

    /// Scopes from the space-delimited `scope` field.
    pub scopes: Vec<String>,
}

impl TokenGrant {
    /// Create a grant with only an access token.
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: Secret::new(access_token),
            refresh_token: None,
            expires_in: None,
            scopes: Vec::new(),
        }
    }

    /// Set the lifetime in seconds.
    pub fn with_expires_in(mut self, seconds: i64) -> Self {
        self.expires_in = Some(Duration::seconds(seconds));
        self
    }

    /// Set the refresh token.
    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(Secret::new(refresh_token));
        self
    }

    /// Set the granted scopes.
    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }
}

/// Diagnostic information about a cached credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenStatus {
    /// Grant that produced the credential.
    pub flow_kind: FlowKind,

    /// Whether `get_token` would return it without I/O.
    pub usable: bool,

    /// Whether it was invalidated after a rejected request.
    pub invalidated: bool,

    /// Whether the token cache holds this exact credential.
    pub persisted: bool,

    /// Whether a refresh token is held.
    pub has_refresh_token: bool,

    /// Absolute expiry.
    pub expires_at: DateTime<Utc>,

    /// Granted scopes.
    pub scopes: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usable_respects_skew_margin() {
        let now = Utc::now();
        let skew = Duration::seconds(60);

        let fresh = CredentialState::new("t", now + Duration::minutes(10), FlowKind::Delegated);
        assert!(fresh.is_usable_at(now, skew));

        let inside_margin =
            CredentialState::new("t", now + Duration::seconds(30), FlowKind::Delegated);
        assert!(!inside_margin.is_usable_at(now, skew));

        let on_boundary =
            CredentialState::new("t", now + Duration::seconds(60), FlowKind::Delegated);
        assert!(!on_boundary.is_usable_at(now, skew));

        let expired = CredentialState::new("t", now - Duration::seconds(10), FlowKind::Delegated);
        assert!(!expired.is_usable_at(now, skew));
    }

    #[test]
    fn test_from_grant_keeps_previous_refresh_token() {
        let now = Utc::now();
        let grant = TokenGrant::new("new-access").with_expires_in(3600);

        let state = CredentialState::from_grant(
            grant,
            FlowKind::Delegated,
            now,
            Some(Secret::new("old-refresh")),
        );

        assert_eq!(state.access_token.expose(), "new-access");
        assert_eq!(state.refresh_token.unwrap().expose(), "old-refresh");
        assert_eq!(state.expires_at, now + Duration::seconds(3600));
    }

    #[test]
    fn test_from_grant_prefers_rotated_refresh_token() {
        let grant = TokenGrant::new("a")
            .with_expires_in(60)
            .with_refresh_token("rotated");

        let state = CredentialState::from_grant(
            grant,
            FlowKind::Delegated,
            Utc::now(),
            Some(Secret::new("old")),
        );

        assert_eq!(state.refresh_token.unwrap().expose(), "rotated");
    }

    #[test]
    fn test_client_credentials_never_hold_refresh_token() {
        let grant = TokenGrant::new("a").with_refresh_token("unexpected");
        let state =
            CredentialState::from_grant(grant, FlowKind::ClientCredentials, Utc::now(), None);

        assert!(state.refresh_token.is_none());
        assert!(!state.can_refresh());
    }

    #[test]
    fn test_missing_expires_in_uses_default_lifetime() {
        let now = Utc::now();
        let state =
            CredentialState::from_grant(TokenGrant::new("a"), FlowKind::Delegated, now, None);
        assert_eq!(
            state.expires_at,
            now + Duration::seconds(DEFAULT_TOKEN_LIFETIME_SECS)
        );
    }

    #[test]
    fn test_unknown_fields_survive_round_trip() {
        let json = r#"{
            "access_token": "abc",
            "expires_at": "2030-01-01T00:00:00Z",
            "scopes": ["User.Read"],
            "flow_kind": "delegated",
            "home_account_id": "uid.tid"
        }"#;

        let state: CredentialState = serde_json::from_str(json).unwrap();
        assert_eq!(state.extra["home_account_id"], "uid.tid");

        let rewritten = serde_json::to_value(&state).unwrap();
        assert_eq!(rewritten["home_account_id"], "uid.tid");
        assert!(rewritten.get("refresh_token").is_none());
    }
}
