//! Microsoft Graph API client.
//!
//! [`GraphClient`] attaches a bearer token from the [`AuthManager`] to every
//! call, retries exactly once after a 401 with a freshly acquired token, and
//! turns every other failure into a typed [`GraphError`]. Throttling and
//! server errors are reported, never retried.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{ACCEPT, HeaderMap, RETRY_AFTER};
use reqwest::{Method, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use url::Url;

use crate::auth_manager::AuthManager;
use crate::error::GraphError;
use crate::model::{IdentityId, Secret};

/// HTTP connection timeout.
const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Normalized result of a successful Graph call.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphResponse {
    /// Response body. A body that is not JSON is returned as a JSON string.
    Json(Value),

    /// 202/204, or a success status with an empty body.
    Accepted,
}

impl GraphResponse {
    /// The JSON body, if there was one.
    pub fn json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            Self::Accepted => None,
        }
    }

    /// Consume into the JSON body, mapping [`Accepted`](Self::Accepted) to `{"status": "accepted"}`.
    pub fn into_value(self) -> Value {
        match self {
            Self::Json(value) => value,
            Self::Accepted => serde_json::json!({ "status": "accepted" }),
        }
    }
}

/// Graph error envelope: `{"error": {"code": "...", "message": "..."}}`.
#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: Option<String>,
    #[serde(default)]
    message: String,
}

/// Microsoft Graph API client.
#[derive(Debug, Clone)]
pub struct GraphClient {
    auth: Arc<AuthManager>,
    http: reqwest::Client,
    base_url: String,
    identity: IdentityId,
}

impl GraphClient {
    /// Create a client using the manager's configuration for the base URL and timeout.
    ///
    /// Requests are made on behalf of [`IdentityId::delegated`].
    pub fn new(auth: Arc<AuthManager>) -> Result<Self, GraphError> {
        let http = reqwest::Client::builder()
            .timeout(auth.config().request_timeout())
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .build()
            .map_err(|e| GraphError::RequestFailed {
                status: GraphError::TRANSPORT_STATUS,
                code: None,
                message: format!("failed to create HTTP client: {}", e),
            })?;
        let base_url = auth.config().graph_base_url.trim_end_matches('/').to_string();

        Ok(Self {
            auth,
            http,
            base_url,
            identity: IdentityId::delegated(),
        })
    }

    /// A client that uses another identity's token, sharing the same connection pool.
    pub fn for_identity(&self, identity: IdentityId) -> Self {
        Self {
            identity,
            ..self.clone()
        }
    }

    /// Identity whose token this client attaches.
    pub fn identity(&self) -> &IdentityId {
        &self.identity
    }

    /// `GET` a Graph resource.
    pub async fn get(&self, path: &str, query: &[(&str, &str)]) -> Result<GraphResponse, GraphError> {
        self.request(Method::GET, path, query, None).await
    }

    /// `POST` a JSON body.
    pub async fn post(&self, path: &str, body: &Value) -> Result<GraphResponse, GraphError> {
        self.request(Method::POST, path, &[], Some(body)).await
    }

    /// `PATCH` a JSON body.
    pub async fn patch(&self, path: &str, body: &Value) -> Result<GraphResponse, GraphError> {
        self.request(Method::PATCH, path, &[], Some(body)).await
    }

    /// `DELETE` a Graph resource.
    pub async fn delete(&self, path: &str) -> Result<GraphResponse, GraphError> {
        self.request(Method::DELETE, path, &[], None).await
    }

    /// Issue a Graph request.
    ///
    /// `path` is relative to the base URL (`/me/messages`), or an absolute URL
    /// such as an `@odata.nextLink`, which is used unchanged. An absolute URL
    /// must share the base URL's scheme, host and port; the bearer token is
    /// never sent anywhere else.
    ///
    /// # Errors
    ///
    /// - [`GraphError::Auth`] if no token could be obtained
    /// - [`GraphError::Unauthorized`] if the request is rejected again after a refresh
    /// - [`GraphError::Forbidden`] for 403
    /// - [`GraphError::RateLimited`] for 429
    /// - [`GraphError::RequestFailed`] for any other failure, including an
    ///   absolute URL outside the Graph base URL (status 400, code `invalid_url`)
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> Result<GraphResponse, GraphError> {
        let url = self.url_for(path)?;

        let token = self.auth.get_token(&self.identity).await?;
        let mut response = self.send(&method, &url, query, body, &token).await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            tracing::warn!(
                "Graph rejected the token for {} {}; refreshing and retrying once",
                method,
                path
            );
            self.auth.invalidate_token(&self.identity, &token);
            let token = self.auth.get_token(&self.identity).await?;
            response = self.send(&method, &url, query, body, &token).await?;
        }

        interpret(response).await
    }

    async fn send(
        &self,
        method: &Method,
        url: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
        token: &Secret,
    ) -> Result<Response, GraphError> {
        tracing::debug!("{} {}", method, url);

        let mut request = self
            .http
            .request(method.clone(), url)
            .bearer_auth(token.expose())
            .header(ACCEPT, "application/json");
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        request.send().await.map_err(transport_error)
    }

    fn url_for(&self, path: &str) -> Result<String, GraphError> {
        if !(path.starts_with("https://") || path.starts_with("http://")) {
            return Ok(format!("{}/{}", self.base_url, path.trim_start_matches('/')));
        }

        let same_origin = match (Url::parse(path), Url::parse(&self.base_url)) {
            (Ok(target), Ok(base)) => target.origin() == base.origin(),
            _ => false,
        };
        if !same_origin {
            tracing::warn!("Refusing to send a Graph token to {}", path);
            return Err(GraphError::RequestFailed {
                status: StatusCode::BAD_REQUEST.as_u16(),
                code: Some("invalid_url".to_string()),
                message: format!("{} is outside the Graph base URL {}", path, self.base_url),
            });
        }
        Ok(path.to_string())
    }
}

/// Normalize a response into a result.
async fn interpret(response: Response) -> Result<GraphResponse, GraphError> {
    let status = response.status();

    if status.is_success() {
        if status == StatusCode::NO_CONTENT || status == StatusCode::ACCEPTED {
            return Ok(GraphResponse::Accepted);
        }
        let text = response.text().await.map_err(transport_error)?;
        if text.trim().is_empty() {
            return Ok(GraphResponse::Accepted);
        }
        return Ok(match serde_json::from_str(&text) {
            Ok(value) => GraphResponse::Json(value),
            Err(_) => GraphResponse::Json(Value::String(text)),
        });
    }

    let retry_after = parse_retry_after(response.headers(), Utc::now());
    let text = response.text().await.unwrap_or_default();
    let (code, message) = parse_error_body(&text);

    tracing::debug!("Graph returned {} ({:?})", status, code);

    Err(match status {
        StatusCode::UNAUTHORIZED => GraphError::Unauthorized { code, message },
        StatusCode::FORBIDDEN => GraphError::Forbidden { code, message },
        StatusCode::TOO_MANY_REQUESTS => GraphError::RateLimited { retry_after },
        _ => GraphError::RequestFailed {
            status: status.as_u16(),
            code,
            message,
        },
    })
}

/// Extract `(code, message)` from a Graph error body, falling back to the raw text.
fn parse_error_body(text: &str) -> (Option<String>, String) {
    match serde_json::from_str::<ErrorEnvelope>(text) {
        Ok(envelope) => (envelope.error.code, envelope.error.message),
        Err(_) => (None, text.trim().to_string()),
    }
}

/// Parse `Retry-After` as delta-seconds or an HTTP-date relative to `now`.
fn parse_retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();

    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

fn transport_error(err: reqwest::Error) -> GraphError {
    if err.is_timeout() {
        GraphError::RequestFailed {
            status: GraphError::TIMEOUT_STATUS,
            code: Some("timeout".to_string()),
            message: err.to_string(),
        }
    } else {
        GraphError::RequestFailed {
            status: GraphError::TRANSPORT_STATUS,
            code: None,
            message: err.to_string(),
        }
    }
}
