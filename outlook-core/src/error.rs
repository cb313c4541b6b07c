//! Error types for token acquisition and Graph requests.
//!
//! [`AuthError`] covers everything that can go wrong while producing a bearer
//! token; [`GraphError`] covers a single Graph call. Every terminal variant
//! carries enough structure for a presentation layer to pick a remediation
//! hint via [`AuthError::remediation`] / [`GraphError::remediation`].

use std::time::Duration;

use thiserror::Error;

use crate::cache::CacheError;

/// Hint shown when the user has to sign in again.
const REAUTHORIZE_HINT: &str =
    "Run `outlook-auth login` to authorize again, then retry the request.";

/// Error type for token acquisition and interactive authorization.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Transport failure or timeout while talking to the token endpoint.
    #[error("network failure during token exchange: {message}")]
    NetworkFailure { message: String },

    /// The identity provider rejected the grant (revoked token, bad code, tenant misconfiguration).
    #[error("identity provider rejected the grant ({code}){}", .description.as_ref().map(|d| format!(": {d}")).unwrap_or_default())]
    InvalidGrant {
        code: String,
        description: Option<String>,
    },

    /// The callback `state` did not match the one issued for the attempt.
    #[error("authorization callback state mismatch")]
    CsrfMismatch,

    /// No callback arrived within the wait window.
    #[error("no authorization callback received within {}s", .waited.as_secs())]
    Timeout { waited: Duration },

    /// The identity has no way to obtain a token without user interaction.
    #[error("interactive authorization required for identity {identity}")]
    ReauthorizationRequired { identity: String },

    /// The authorization attempt was cancelled or superseded.
    #[error("authorization attempt cancelled")]
    Cancelled,

    /// A callback request or pasted redirect URL could not be understood.
    #[error("invalid authorization callback: {message}")]
    InvalidCallback { message: String },

    /// The provider issued a token that expires inside the skew margin.
    #[error("issued access token lives {lifetime_secs}s, within the {skew_secs}s skew margin")]
    LifetimeTooShort { lifetime_secs: i64, skew_secs: i64 },

    /// The token cache could not be written.
    #[error("token cache error: {0}")]
    Cache(#[from] CacheError),

    /// Client configuration is missing or invalid.
    #[error("configuration error: {message}")]
    Config { message: String },
}

impl AuthError {
    /// Whether the user must run interactive authorization to recover.
    pub fn requires_reauthorization(&self) -> bool {
        matches!(
            self,
            Self::InvalidGrant { .. } | Self::ReauthorizationRequired { .. }
        )
    }

    /// Human-readable remediation hint for this error.
    pub fn remediation(&self) -> &'static str {
        match self {
            Self::NetworkFailure { .. } => {
                "Transient network issue while contacting the identity provider; retry later."
            }
            Self::InvalidGrant { .. } | Self::ReauthorizationRequired { .. } => REAUTHORIZE_HINT,
            Self::CsrfMismatch | Self::InvalidCallback { .. } | Self::Cancelled => {
                "Start the authorization again and use the newest sign-in link."
            }
            Self::Timeout { .. } => {
                "Sign-in was not completed in time; start the authorization again."
            }
            Self::LifetimeTooShort { .. } => {
                "Lower skew_margin_secs in the config file below the token lifetime the tenant issues."
            }
            Self::Cache(_) => "Check that the token cache location is writable.",
            Self::Config { .. } => {
                "Set OUTLOOK_CLIENT_ID, OUTLOOK_CLIENT_SECRET and OUTLOOK_TENANT_ID or edit the config file."
            }
        }
    }
}

/// Error type for a single Graph request.
#[derive(Debug, Error)]
pub enum GraphError {
    /// A bearer token could not be produced.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// The request was rejected with 401 even after a token refresh.
    #[error("Graph rejected the access token (401){}", fmt_detail(.code, .message))]
    Unauthorized {
        code: Option<String>,
        message: String,
    },

    /// The token is valid but lacks the permission for this resource (403).
    #[error("Graph denied access (403){}", fmt_detail(.code, .message))]
    Forbidden {
        code: Option<String>,
        message: String,
    },

    /// Throttled by Graph (429).
    #[error("rate limited by Graph{}", .retry_after.map(|d| format!(", retry after {}s", d.as_secs())).unwrap_or_default())]
    RateLimited { retry_after: Option<Duration> },

    /// Any other non-success status, or a transport failure with a synthetic status.
    #[error("Graph request failed with status {status}{}", fmt_detail(.code, .message))]
    RequestFailed {
        status: u16,
        code: Option<String>,
        message: String,
    },
}

impl GraphError {
    /// Synthetic status used when the request timed out.
    pub const TIMEOUT_STATUS: u16 = 408;

    /// Synthetic status used when no response was received.
    pub const TRANSPORT_STATUS: u16 = 0;

    /// Whether resubmitting the same request later may succeed.
    ///
    /// The client never retries on its own; this only informs the caller.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Auth(AuthError::NetworkFailure { .. }) => true,
            Self::RateLimited { .. } => true,
            Self::RequestFailed { status, .. } => {
                *status == Self::TIMEOUT_STATUS
                    || *status == Self::TRANSPORT_STATUS
                    || *status >= 500
            }
            _ => false,
        }
    }

    /// Whether the user must run interactive authorization to recover.
    pub fn requires_reauthorization(&self) -> bool {
        match self {
            Self::Auth(err) => err.requires_reauthorization(),
            Self::Unauthorized { .. } => true,
            _ => false,
        }
    }

    /// Human-readable remediation hint for this error.
    pub fn remediation(&self) -> &'static str {
        match self {
            Self::Auth(err) => err.remediation(),
            Self::Unauthorized { .. } => REAUTHORIZE_HINT,
            Self::Forbidden { .. } => {
                "The app registration lacks the API permission for this resource; grant it (and admin consent) in Entra ID."
            }
            Self::RateLimited { .. } => "Graph is throttling requests; wait for the retry-after period before resubmitting.",
            Self::RequestFailed { status: 404, .. } => "Resource not found; verify the ID is correct.",
            Self::RequestFailed { status, .. } if *status == Self::TIMEOUT_STATUS => {
                "The request timed out; Graph may be slow, retry later."
            }
            Self::RequestFailed { .. } => "The request failed; check the provider message for details.",
        }
    }
}

fn fmt_detail(code: &Option<String>, message: &str) -> String {
    match (code, message.is_empty()) {
        (Some(code), false) => format!(": {code}: {message}"),
        (Some(code), true) => format!(": {code}"),
        (None, false) => format!(": {message}"),
        (None, true) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_grant_display() {
        let err = AuthError::InvalidGrant {
            code: "invalid_grant".to_string(),
            description: Some("AADSTS70008: expired".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "identity provider rejected the grant (invalid_grant): AADSTS70008: expired"
        );
        assert!(err.requires_reauthorization());
    }

    #[test]
    fn test_lifetime_too_short_display() {
        let err = AuthError::LifetimeTooShort {
            lifetime_secs: 30,
            skew_secs: 60,
        };
        assert_eq!(
            err.to_string(),
            "issued access token lives 30s, within the 60s skew margin"
        );
        assert!(!err.requires_reauthorization());
        assert!(err.remediation().contains("skew_margin_secs"));
    }

    #[test]
    fn test_network_failure_is_not_reauthorization() {
        let err = AuthError::NetworkFailure {
            message: "connection refused".to_string(),
        };
        assert!(!err.requires_reauthorization());
        assert!(err.remediation().contains("retry later"));
    }

    #[test]
    fn test_rate_limited_display() {
        let err = GraphError::RateLimited {
            retry_after: Some(Duration::from_secs(30)),
        };
        assert_eq!(err.to_string(), "rate limited by Graph, retry after 30s");
        assert!(err.is_retryable());

        let err = GraphError::RateLimited { retry_after: None };
        assert_eq!(err.to_string(), "rate limited by Graph");
    }

    #[test]
    fn test_forbidden_is_distinct_from_unauthorized() {
        let forbidden = GraphError::Forbidden {
            code: Some("ErrorAccessDenied".to_string()),
            message: "Access is denied.".to_string(),
        };
        let unauthorized = GraphError::Unauthorized {
            code: Some("InvalidAuthenticationToken".to_string()),
            message: "Access token has expired.".to_string(),
        };

        assert!(!forbidden.requires_reauthorization());
        assert!(unauthorized.requires_reauthorization());
        assert_ne!(forbidden.remediation(), unauthorized.remediation());
        assert_eq!(
            forbidden.to_string(),
            "Graph denied access (403): ErrorAccessDenied: Access is denied."
        );
    }

    #[test]
    fn test_request_failed_retryable_classification() {
        let server = GraphError::RequestFailed {
            status: 503,
            code: None,
            message: String::new(),
        };
        assert!(server.is_retryable());
        assert_eq!(server.to_string(), "Graph request failed with status 503");

        let not_found = GraphError::RequestFailed {
            status: 404,
            code: Some("ErrorItemNotFound".to_string()),
            message: "not found".to_string(),
        };
        assert!(!not_found.is_retryable());
        assert!(not_found.remediation().contains("not found"));
    }

    #[test]
    fn test_auth_error_passes_through_graph_error() {
        let err: GraphError = AuthError::ReauthorizationRequired {
            identity: "delegated".to_string(),
        }
        .into();
        assert!(err.requires_reauthorization());
        assert_eq!(
            err.to_string(),
            "interactive authorization required for identity delegated"
        );
    }
}
