//! Authorization redirect handling.
//!
//! The identity provider sends the browser back to the redirect URI with
//! either `code` + `state` or `error` (+ `error_description`) in the query.
//! [`CallbackData`] is the parsed form of that redirect; it can come from the
//! loopback [`CallbackListener`] or from a redirect URL the user pasted.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

use crate::error::AuthError;
use crate::model::Secret;

const READ_TIMEOUT: Duration = Duration::from_secs(10);

const SUCCESS_PAGE: &str = "<html><body><h1>Authentication Successful</h1>\
    <p>You can close this window and return to your application.</p></body></html>";

const FAILURE_PAGE: &str = "<html><body><h1>Authentication Failed</h1>\
    <p>The identity provider returned an error. Return to your application for details.</p></body></html>";

const STALE_PAGE: &str = "<html><body><h1>Unknown Sign-in Request</h1>\
    <p>This link does not belong to the sign-in in progress. Use the newest sign-in link.</p></body></html>";

/// Parameters delivered to the redirect URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackData {
    /// The user granted consent.
    Code { code: String, state: String },

    /// The provider reported an error (for example `access_denied`).
    Error {
        error: String,
        description: Option<String>,
        state: Option<String>,
    },
}

impl CallbackData {
    /// Successful callback with an authorization code.
    pub fn new(code: impl Into<String>, state: impl Into<String>) -> Self {
        Self::Code {
            code: code.into(),
            state: state.into(),
        }
    }

    /// The `state` echoed by the provider, if any.
    pub fn state(&self) -> Option<&str> {
        match self {
            Self::Code { state, .. } => Some(state),
            Self::Error { state, .. } => state.as_deref(),
        }
    }

    /// Parse a raw query string (without the leading `?`).
    pub fn from_query(query: &str) -> Result<Self, AuthError> {
        let mut code = None;
        let mut state = None;
        let mut error = None;
        let mut description = None;

        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "code" => code = Some(value.into_owned()),
                "state" => state = Some(value.into_owned()),
                "error" => error = Some(value.into_owned()),
                "error_description" => description = Some(value.into_owned()),
                _ => {}
            }
        }

        if let Some(error) = error {
            return Ok(Self::Error {
                error,
                description,
                state,
            });
        }

        match (code, state) {
            (Some(code), Some(state)) if !code.is_empty() => Ok(Self::Code { code, state }),
            (Some(_), None) => Err(AuthError::InvalidCallback {
                message: "callback is missing the state parameter".to_string(),
            }),
            _ => Err(AuthError::InvalidCallback {
                message: "callback contains neither an authorization code nor an error"
                    .to_string(),
            }),
        }
    }

    /// Parse what a user copied from the browser after sign-in.
    ///
    /// Accepts the full redirect URL, or just its query string with or
    /// without the leading `?`.
    pub fn from_redirect_url(input: &str) -> Result<Self, AuthError> {
        let input = input.trim();

        if let Ok(url) = Url::parse(input) {
            let query = url.query().ok_or_else(|| AuthError::InvalidCallback {
                message: "redirect URL has no query string".to_string(),
            })?;
            return Self::from_query(query);
        }

        let query = match input.split_once('?') {
            Some((_, query)) => query,
            None => input,
        };
        Self::from_query(query)
    }
}

/// Event delivered to a pending authorization attempt.
#[derive(Debug)]
pub(crate) enum CallbackEvent {
    Received(CallbackData),
    Cancelled,
}

/// Loopback HTTP listener bound to the redirect URI's host and port.
///
/// Serves until the first callback on the redirect path that carries the
/// expected `state` is received, then stops accepting connections. Callbacks
/// with any other `state` are answered with 400 and ignored. Dropping the
/// listener shuts it down.
#[derive(Debug)]
pub struct CallbackListener {
    local_addr: SocketAddr,
    redirect_uri: Url,
    task: JoinHandle<()>,
}

impl CallbackListener {
    /// Bind the listener.
    ///
    /// A redirect URI with port `0` binds an ephemeral port; the returned
    /// [`redirect_uri`](Self::redirect_uri) carries the real port.
    pub(crate) async fn bind(
        redirect_uri: &Url,
        expected_state: Secret,
        events: mpsc::Sender<CallbackEvent>,
    ) -> Result<Self, AuthError> {
        let host = match redirect_uri.host_str() {
            Some("localhost") | None => "127.0.0.1",
            Some(host) => host,
        };
        let port = redirect_uri.port_or_known_default().unwrap_or(80);
        let addr = format!("{}:{}", host, port);

        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| AuthError::Config {
                message: format!("failed to bind callback listener to {}: {}", addr, e),
            })?;
        let local_addr = listener.local_addr().map_err(|e| AuthError::Config {
            message: format!("failed to read callback listener address: {}", e),
        })?;

        let mut effective = redirect_uri.clone();
        if effective.port_or_known_default() != Some(local_addr.port()) {
            let _ = effective.set_port(Some(local_addr.port()));
        }

        tracing::info!("Listening for OAuth callback on {}", local_addr);

        let path = effective.path().to_string();
        let task = tokio::spawn(serve(listener, path, expected_state, events));

        Ok(Self {
            local_addr,
            redirect_uri: effective,
            task,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Redirect URI to send to the identity provider.
    pub fn redirect_uri(&self) -> &Url {
        &self.redirect_uri
    }

    /// Stop accepting connections.
    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for CallbackListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(
    listener: TcpListener,
    path: String,
    expected_state: Secret,
    events: mpsc::Sender<CallbackEvent>,
) {
    loop {
        let (mut socket, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!("Callback listener stopped accepting connections: {}", e);
                return;
            }
        };
        tracing::debug!("Callback connection from {}", peer);

        if let Some(data) = handle_connection(&mut socket, &path, &expected_state).await {
            let _ = events.send(CallbackEvent::Received(data)).await;
            return;
        }
    }
}

/// Answer one HTTP request; returns the callback data if it was the redirect.
async fn handle_connection(
    socket: &mut TcpStream,
    expected_path: &str,
    expected_state: &Secret,
) -> Option<CallbackData> {
    let mut buffer = [0u8; 8192];
    let n = match tokio::time::timeout(READ_TIMEOUT, socket.read(&mut buffer)).await {
        Ok(Ok(n)) if n > 0 => n,
        _ => return None,
    };
    let request = String::from_utf8_lossy(&buffer[..n]);

    let mut request_line = request.lines().next().unwrap_or_default().split_whitespace();
    let (method, target) = match (request_line.next(), request_line.next()) {
        (Some(method), Some(target)) => (method, target),
        _ => {
            respond(socket, 400, "Bad Request", "<html><body><h1>Bad Request</h1></body></html>")
                .await;
            return None;
        }
    };

    if method != "GET" {
        respond(
            socket,
            405,
            "Method Not Allowed",
            "<html><body><h1>Method Not Allowed</h1></body></html>",
        )
        .await;
        return None;
    }

    let (path, query) = target.split_once('?').unwrap_or((target, ""));
    if path != expected_path {
        respond(socket, 404, "Not Found", "<html><body><h1>Not Found</h1></body></html>").await;
        return None;
    }

    match CallbackData::from_query(query) {
        Ok(data) if data.state() != Some(expected_state.expose()) => {
            tracing::warn!("Ignoring callback with an unexpected state");
            respond(socket, 400, "Bad Request", STALE_PAGE).await;
            None
        }
        Ok(data @ CallbackData::Code { .. }) => {
            respond(socket, 200, "OK", SUCCESS_PAGE).await;
            Some(data)
        }
        Ok(data @ CallbackData::Error { .. }) => {
            respond(socket, 200, "OK", FAILURE_PAGE).await;
            Some(data)
        }
        Err(e) => {
            tracing::debug!("Ignoring malformed callback request: {}", e);
            respond(socket, 400, "Bad Request", "<html><body><h1>Bad Request</h1></body></html>")
                .await;
            None
        }
    }
}

async fn respond(socket: &mut TcpStream, status: u16, reason: &str, body: &str) {
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason,
        body.len(),
        body
    );
    let _ = socket.write_all(response.as_bytes()).await;
    let _ = socket.shutdown().await;
}
