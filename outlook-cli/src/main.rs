//! Outlook MCP authentication CLI
//!
//! One-time setup and diagnostics for the Outlook MCP server's credentials.
//!
//! # Usage
//!
//! ```bash
//! # Sign in interactively (opens a loopback listener for the redirect)
//! outlook-auth login
//!
//! # Sign in on a machine without a browser: paste the redirect URL back
//! outlook-auth login --headless
//!
//! # Show cached credentials
//! outlook-auth status
//!
//! # Call Graph with the cached credentials
//! outlook-auth request GET /me/messages --query '$top=5'
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use outlook_core::{
    AuthConfig, AuthError, AuthManager, AuthorizationMode, GraphClient, GraphError, IdentityId,
    Method,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser)]
#[command(name = "outlook-auth")]
#[command(about = "Sign in and manage credentials for the Outlook MCP server")]
#[command(version)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to a config file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Authorize access to the mailbox
    Login {
        /// Paste the redirect URL instead of listening for it
        #[arg(long)]
        headless: bool,

        /// Acquire an app-only token with the client secret instead
        #[arg(long, conflicts_with = "headless")]
        app_only: bool,

        /// Sign in again even if a usable credential is cached
        #[arg(short, long)]
        force: bool,
    },

    /// Show cached credentials
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print a fresh access token
    Token {
        /// Identity to use (delegated, service)
        #[arg(short, long, default_value = "delegated")]
        identity: String,
    },

    /// Send a request to Microsoft Graph
    Request {
        /// HTTP method (GET, POST, PATCH, DELETE)
        method: String,

        /// Path relative to the Graph base URL, or an absolute URL
        path: String,

        /// Query parameter, repeatable (e.g. --query '$top=5')
        #[arg(short, long = "query", value_parser = parse_key_val)]
        query: Vec<(String, String)>,

        /// JSON request body
        #[arg(short, long)]
        body: Option<String>,

        /// Identity to use (delegated, service)
        #[arg(short, long, default_value = "delegated")]
        identity: String,
    },

    /// Remove a cached credential
    Logout {
        /// Identity to sign out (delegated, service)
        #[arg(short, long, default_value = "delegated")]
        identity: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = load_config(cli.config.as_deref())?;
    let manager = Arc::new(AuthManager::from_config(config).map_err(auth_hint)?);

    match cli.command {
        Commands::Login {
            headless,
            app_only,
            force,
        } => {
            if app_only {
                login_app_only(&manager).await
            } else {
                login(&manager, headless, force).await
            }
        }
        Commands::Status { json } => status(&manager, json),
        Commands::Token { identity } => token(&manager, &IdentityId::new(identity)).await,
        Commands::Request {
            method,
            path,
            query,
            body,
            identity,
        } => {
            request(
                manager,
                &method,
                &path,
                &query,
                body.as_deref(),
                IdentityId::new(identity),
            )
            .await
        }
        Commands::Logout { identity } => logout(&manager, &IdentityId::new(identity)).await,
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<AuthConfig> {
    let config = match path {
        Some(path) => {
            let mut config = AuthConfig::load_from_path(path)
                .with_context(|| format!("Failed to load config from {:?}", path))?;
            config.apply_env();
            config.validate().map_err(|e| auth_hint(e.into()))?;
            config
        }
        None => AuthConfig::load().map_err(|e| auth_hint(e.into()))?,
    };

    info!("Using client {} in tenant {}", config.client_id, config.tenant_id);
    Ok(config)
}

async fn login(manager: &AuthManager, headless: bool, force: bool) -> Result<()> {
    let identity = IdentityId::delegated();

    if !force && manager.status(&identity).is_some() && manager.get_token(&identity).await.is_ok()
    {
        println!("Already authenticated. Use --force to sign in again.");
        return Ok(());
    }

    let mode = if headless {
        AuthorizationMode::Manual
    } else {
        AuthorizationMode::Listen
    };
    let attempt = manager
        .begin_interactive_authorization(&identity, mode)
        .await
        .map_err(auth_hint)?;

    println!("Open this URL in a browser to sign in:\n");
    println!("  {}\n", attempt.authorization_url());

    if headless {
        println!("After signing in, paste the full URL of the page you were redirected to:");
        let pasted = read_line().await?;
        attempt.submit_redirect_url(&pasted).map_err(auth_hint)?;
    } else {
        println!("Waiting for the redirect on {} ...", attempt.redirect_uri());
    }

    let credential = manager
        .complete_interactive_authorization(attempt)
        .await
        .map_err(auth_hint)?;

    println!(
        "Signed in. Access token {}; cached at {}",
        describe_expiry(credential.expires_at, Utc::now()),
        manager.cache().path().display()
    );
    Ok(())
}

async fn login_app_only(manager: &AuthManager) -> Result<()> {
    let credential = manager
        .acquire_client_credentials(&IdentityId::service())
        .await
        .map_err(auth_hint)?;

    println!(
        "Acquired app-only token; it {}",
        describe_expiry(credential.expires_at, Utc::now())
    );
    Ok(())
}

fn status(manager: &AuthManager, json: bool) -> Result<()> {
    let identities = manager.identities();

    if json {
        let mut report = serde_json::Map::new();
        for id in &identities {
            if let Some(status) = manager.status(id) {
                report.insert(id.to_string(), serde_json::to_value(status)?);
            }
        }
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    if identities.is_empty() {
        println!("Not signed in. Run `outlook-auth login`.");
        return Ok(());
    }

    let now = Utc::now();
    for id in identities {
        let Some(status) = manager.status(&id) else {
            continue;
        };
        println!("{}", id);
        println!("  Flow:          {}", status.flow_kind);
        println!(
            "  Access token:  {}{}",
            describe_expiry(status.expires_at, now),
            if status.usable { "" } else { " (needs refresh)" }
        );
        println!(
            "  Refresh token: {}",
            if status.has_refresh_token { "yes" } else { "no" }
        );
        if !status.persisted {
            println!("  Cache:         not saved (check that the cache file is writable)");
        }
        if !status.scopes.is_empty() {
            println!("  Scopes:        {}", status.scopes.join(" "));
        }
    }
    Ok(())
}

async fn token(manager: &AuthManager, identity: &IdentityId) -> Result<()> {
    let token = manager.get_token(identity).await.map_err(auth_hint)?;
    println!("{}", token.expose());
    Ok(())
}

async fn request(
    manager: Arc<AuthManager>,
    method: &str,
    path: &str,
    query: &[(String, String)],
    body: Option<&str>,
    identity: IdentityId,
) -> Result<()> {
    let method = Method::from_bytes(method.to_uppercase().as_bytes())
        .with_context(|| format!("Invalid HTTP method {:?}", method))?;
    let body = body
        .map(serde_json::from_str::<serde_json::Value>)
        .transpose()
        .context("--body is not valid JSON")?;
    let query: Vec<(&str, &str)> = query
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();

    let client = GraphClient::new(manager)?.for_identity(identity);
    let response = client
        .request(method, path, &query, body.as_ref())
        .await
        .map_err(graph_hint)?;

    println!("{}", serde_json::to_string_pretty(&response.into_value())?);
    Ok(())
}

async fn logout(manager: &AuthManager, identity: &IdentityId) -> Result<()> {
    if manager.sign_out(identity).await.map_err(auth_hint)? {
        println!("Signed out {}", identity);
    } else {
        println!("No cached credential for {}", identity);
    }
    Ok(())
}

async fn read_line() -> Result<String> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    match lines.next_line().await.context("Failed to read from stdin")? {
        Some(line) if !line.trim().is_empty() => Ok(line),
        _ => bail!("No redirect URL provided"),
    }
}

fn auth_hint(err: AuthError) -> anyhow::Error {
    anyhow!("{}\nhint: {}", err, err.remediation())
}

fn graph_hint(err: GraphError) -> anyhow::Error {
    anyhow!("{}\nhint: {}", err, err.remediation())
}

/// Parse a `key=value` query argument.
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid KEY=value: no `=` found in `{s}`"))?;
    if key.is_empty() {
        return Err(format!("invalid KEY=value: empty key in `{s}`"));
    }
    Ok((key.to_string(), value.to_string()))
}

/// Human-readable expiry relative to `now`.
fn describe_expiry(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let remaining = expires_at - now;
    let minutes = remaining.num_minutes();

    if remaining <= chrono::Duration::zero() {
        format!("expired {}m ago", -minutes)
    } else if minutes < 1 {
        "expires in under a minute".to_string()
    } else {
        format!("expires in {}m", minutes)
    }
}
