//! Integration tests for token acquisition against a mock token endpoint.
//!
//! These tests verify that the AuthManager:
//! - Refreshes expired delegated tokens and persists the result
//! - Reuses the persisted cache after a restart without network I/O
//! - Acquires app-only tokens with the client credentials grant
//! - Performs a single exchange for concurrent callers
//! - Surfaces provider rejections and transport failures as typed errors

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use outlook_core::{
    AuthConfig, AuthError, AuthManager, CredentialState, FlowKind, IdentityId, TokenCache,
};
use tempfile::TempDir;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{body_string_contains, method, path},
};

const TOKEN_PATH: &str = "/test-tenant/oauth2/v2.0/token";

/// Helper to create a configuration pointing at the mock server.
fn test_config(server_uri: &str, temp: &TempDir) -> AuthConfig {
    AuthConfig::new("test-client-id")
        .with_client_secret("test-client-secret")
        .with_tenant("test-tenant")
        .with_authority_host(server_uri)
        .with_cache_path(temp.path().join("token_cache.json"))
}

/// Helper to write a credential into the cache file before the manager starts.
fn seed_cache(temp: &TempDir, identity: &IdentityId, state: &CredentialState) {
    let cache = TokenCache::load_from_path(temp.path().join("token_cache.json")).unwrap();
    cache.put(identity, state).unwrap();
}

fn read_cache_file(temp: &TempDir) -> serde_json::Value {
    let contents = std::fs::read_to_string(temp.path().join("token_cache.json")).unwrap();
    serde_json::from_str(&contents).unwrap()
}

#[tokio::test]
async fn test_expired_token_is_refreshed_and_persisted() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=old-refresh-token"))
        .and(body_string_contains("client_id=test-client-id"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "new-access-token",
            "token_type": "Bearer",
            "expires_in": 3600,
            "refresh_token": "rotated-refresh-token",
            "scope": "https://graph.microsoft.com/Mail.Read offline_access"
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let temp = TempDir::new().unwrap();
    let identity = IdentityId::delegated();
    seed_cache(
        &temp,
        &identity,
        &CredentialState::new(
            "expired-access-token",
            Utc::now() - Duration::minutes(10),
            FlowKind::Delegated,
        )
        .with_refresh_token("old-refresh-token"),
    );

    let manager = AuthManager::from_config(test_config(&mock_server.uri(), &temp)).unwrap();
    let token = manager.get_token(&identity).await.unwrap();

    assert_eq!(token.expose(), "new-access-token");

    let file = read_cache_file(&temp);
    let entry = &file["identities"]["delegated"];
    assert_eq!(entry["access_token"], "new-access-token");
    assert_eq!(entry["refresh_token"], "rotated-refresh-token");
    assert_eq!(entry["flow_kind"], "delegated");

    let expires_at: DateTime<Utc> = entry["expires_at"].as_str().unwrap().parse().unwrap();
    let expected = Utc::now() + Duration::seconds(3600);
    assert!((expires_at - expected).num_seconds().abs() < 10);
}

#[tokio::test]
async fn test_cached_token_survives_restart_without_network() {
    // No mocks mounted: any token request would fail
    let mock_server = MockServer::start().await;
    let temp = TempDir::new().unwrap();
    let identity = IdentityId::delegated();
    seed_cache(
        &temp,
        &identity,
        &CredentialState::new(
            "persisted-access-token",
            Utc::now() + Duration::hours(1),
            FlowKind::Delegated,
        )
        .with_refresh_token("persisted-refresh-token"),
    );

    let manager = AuthManager::from_config(test_config(&mock_server.uri(), &temp)).unwrap();
    let token = manager.get_token(&identity).await.unwrap();

    assert_eq!(token.expose(), "persisted-access-token");
    assert!(mock_server.received_requests().await.unwrap().is_empty());

    let status = manager.status(&identity).unwrap();
    assert!(status.usable);
    assert!(status.has_refresh_token);
}

#[tokio::test]
async fn test_service_identity_uses_client_credentials_grant() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .and(body_string_contains("grant_type=client_credentials"))
        .and(body_string_contains(
            "scope=https%3A%2F%2Fgraph.microsoft.com%2F.default",
        ))
        .and(body_string_contains("client_secret=test-client-secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "app-only-token",
            "token_type": "Bearer",
            "expires_in": 3599
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let temp = TempDir::new().unwrap();
    let manager = AuthManager::from_config(test_config(&mock_server.uri(), &temp)).unwrap();
    let identity = IdentityId::service();

    let token = manager.get_token(&identity).await.unwrap();
    assert_eq!(token.expose(), "app-only-token");

    // Second call is served from memory
    let again = manager.get_token(&identity).await.unwrap();
    assert_eq!(again.expose(), "app-only-token");

    let file = read_cache_file(&temp);
    assert_eq!(file["identities"]["service"]["flow_kind"], "client_credentials");
    assert!(file["identities"]["service"].get("refresh_token").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_trigger_single_refresh() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .and(body_string_contains("grant_type=refresh_token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({
                    "access_token": "shared-access-token",
                    "token_type": "Bearer",
                    "expires_in": 3600
                }))
                .set_delay(std::time::Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let temp = TempDir::new().unwrap();
    let identity = IdentityId::delegated();
    seed_cache(
        &temp,
        &identity,
        &CredentialState::new("expired", Utc::now() - Duration::hours(1), FlowKind::Delegated)
            .with_refresh_token("refresh-token"),
    );

    let manager =
        Arc::new(AuthManager::from_config(test_config(&mock_server.uri(), &temp)).unwrap());

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..10 {
        let manager = manager.clone();
        let identity = identity.clone();
        tasks.spawn(async move { manager.get_token(&identity).await });
    }

    while let Some(result) = tasks.join_next().await {
        let token = result.unwrap().unwrap();
        assert_eq!(token.expose(), "shared-access-token");
    }
}

#[tokio::test]
async fn test_revoked_refresh_token_is_invalid_grant() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
            "error": "invalid_grant",
            "error_description": "AADSTS70008: The provided authorization code or refresh token has expired."
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let temp = TempDir::new().unwrap();
    let identity = IdentityId::delegated();
    seed_cache(
        &temp,
        &identity,
        &CredentialState::new("expired", Utc::now() - Duration::hours(1), FlowKind::Delegated)
            .with_refresh_token("revoked-refresh-token"),
    );

    let manager = AuthManager::from_config(test_config(&mock_server.uri(), &temp)).unwrap();
    let err = manager.get_token(&identity).await.unwrap_err();

    match &err {
        AuthError::InvalidGrant { code, description } => {
            assert_eq!(code, "invalid_grant");
            assert!(description.as_deref().unwrap().starts_with("AADSTS70008"));
        }
        other => panic!("expected InvalidGrant, got {:?}", other),
    }
    assert!(err.requires_reauthorization());

    // The previous credential is left in place
    let file = read_cache_file(&temp);
    assert_eq!(file["identities"]["delegated"]["access_token"], "expired");
}

#[tokio::test]
async fn test_slow_token_endpoint_is_network_failure() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({
                    "access_token": "too-late",
                    "token_type": "Bearer",
                    "expires_in": 3600
                }))
                .set_delay(std::time::Duration::from_secs(3)),
        )
        .mount(&mock_server)
        .await;

    let temp = TempDir::new().unwrap();
    let mut config = test_config(&mock_server.uri(), &temp);
    config.request_timeout_secs = 1;

    let manager = AuthManager::from_config(config).unwrap();
    let err = manager.get_token(&IdentityId::service()).await.unwrap_err();

    assert!(matches!(err, AuthError::NetworkFailure { .. }));
    assert!(!err.requires_reauthorization());
    assert!(manager.status(&IdentityId::service()).is_none());
}

#[tokio::test]
async fn test_token_expiring_inside_skew_margin_is_not_returned() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .and(body_string_contains("grant_type=client_credentials"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "short-lived-token",
            "token_type": "Bearer",
            "expires_in": 30
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let temp = TempDir::new().unwrap();
    let manager = AuthManager::from_config(test_config(&mock_server.uri(), &temp)).unwrap();

    let err = manager.get_token(&IdentityId::service()).await.unwrap_err();

    assert!(matches!(
        err,
        AuthError::LifetimeTooShort { lifetime_secs: 30, skew_secs: 60 }
    ));
}
