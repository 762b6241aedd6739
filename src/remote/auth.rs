// ABOUTME: OAuth access token acquisition and caching
// ABOUTME: Implements client-credentials and browser implicit grants with a shared token cache

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info};

use super::client::redact;
use crate::error::ToolkitError;

pub const ACCOUNT_MANAGER_HOST: &str = "account.demandware.com";
pub const IMPLICIT_GRANT_PORT: u16 = 8080;
const IMPLICIT_GRANT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Clone, PartialEq)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub scopes: BTreeSet<String>,
}

impl AccessToken {
    pub fn new(token: String, expires_in_secs: i64, scopes: BTreeSet<String>) -> Self {
        Self {
            token,
            expires_at: Utc::now() + ChronoDuration::seconds(expires_in_secs),
            scopes,
        }
    }

    /// Reusable only while unexpired and granted every requested scope.
    pub fn satisfies(&self, requested: &[String], now: DateTime<Utc>) -> bool {
        now < self.expires_at && requested.iter().all(|s| self.scopes.contains(s))
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &redact(&self.token))
            .field("expires_at", &self.expires_at)
            .field("scopes", &self.scopes)
            .finish()
    }
}

/// Access tokens keyed by client id. Clones share the same cache, so every
/// connection built from one cache reuses tokens for the same client.
#[derive(Clone, Default)]
pub struct TokenCache {
    tokens: Arc<Mutex<HashMap<String, AccessToken>>>,
}

impl fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.tokens.lock() {
            Ok(tokens) => f.debug_map().entries(tokens.iter()).finish(),
            Err(_) => f.write_str("TokenCache(<poisoned>)"),
        }
    }
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a reusable token, discarding the cached one if it no longer qualifies.
    pub fn get(&self, client_id: &str, scopes: &[String]) -> Option<AccessToken> {
        let mut tokens = self.tokens.lock().ok()?;
        let usable = tokens.get(client_id)?.satisfies(scopes, Utc::now());
        if usable {
            tokens.get(client_id).cloned()
        } else {
            debug!("Discarding cached token for {}", client_id);
            tokens.remove(client_id);
            None
        }
    }

    pub fn insert(&self, client_id: &str, token: AccessToken) {
        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.insert(client_id.to_string(), token);
        }
    }

    pub fn invalidate(&self, client_id: &str) {
        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.remove(client_id);
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
    scope: Option<String>,
}

fn default_expires_in() -> i64 {
    1799
}

fn granted_scopes(scope: Option<&str>, requested: &[String]) -> BTreeSet<String> {
    match scope {
        Some(scope) => scope.split_whitespace().map(str::to_string).collect(),
        None => requested.iter().cloned().collect(),
    }
}

/// Client credentials grant against the account manager token endpoint.
pub async fn client_credentials_grant(
    http: &reqwest::Client,
    url: &str,
    client_id: &str,
    client_secret: &str,
    scopes: &[String],
) -> Result<AccessToken> {
    let mut form = vec![("grant_type", "client_credentials".to_string())];
    if !scopes.is_empty() {
        form.push(("scope", scopes.join(" ")));
    }

    debug!("Requesting client credentials token for {}", client_id);
    let response = http
        .post(url)
        .basic_auth(client_id, Some(client_secret))
        .form(&form)
        .send()
        .await
        .context("Failed to reach the account manager for an access token")?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(ToolkitError::Permission(format!(
            "token request for client {} failed with status {}: {}. Check the client id and secret",
            client_id, status, body
        ))
        .into());
    }

    let token: TokenResponse = response
        .json()
        .await
        .context("Failed to parse access token response")?;
    Ok(AccessToken::new(
        token.access_token,
        token.expires_in,
        granted_scopes(token.scope.as_deref(), scopes),
    ))
}

pub fn authorize_url(client_id: &str, scopes: &[String]) -> String {
    let mut url = format!(
        "https://{}/dwsso/oauth2/authorize?client_id={}&redirect_uri=http%3A%2F%2Flocalhost%3A{}&response_type=token",
        ACCOUNT_MANAGER_HOST, client_id, IMPLICIT_GRANT_PORT
    );
    if !scopes.is_empty() {
        url.push_str("&scope=");
        url.push_str(&scopes.join("%20"));
    }
    url
}

const CALLBACK_PAGE: &str = "<html><body><script>\
window.location.replace('/token?' + window.location.hash.substring(1));\
</script></body></html>";

const DONE_PAGE: &str = "<html><body>Authenticated. You may close this window.</body></html>";

/// Interactive implicit grant: the operator opens the authorize URL and the
/// browser is redirected to a short-lived local listener that receives the token.
pub async fn implicit_grant(client_id: &str, scopes: &[String]) -> Result<AccessToken> {
    let listener = TcpListener::bind(("127.0.0.1", IMPLICIT_GRANT_PORT))
        .await
        .with_context(|| {
            format!(
                "Failed to listen on port {} for the implicit grant callback",
                IMPLICIT_GRANT_PORT
            )
        })?;
    info!(
        "Open the following URL in a browser to log in: {}",
        authorize_url(client_id, scopes)
    );

    tokio::time::timeout(IMPLICIT_GRANT_TIMEOUT, accept_token(&listener, scopes))
        .await
        .map_err(|_| {
            ToolkitError::Permission("timed out waiting for the browser login".to_string())
        })?
}

async fn accept_token(listener: &TcpListener, scopes: &[String]) -> Result<AccessToken> {
    loop {
        let (mut stream, _) = listener.accept().await?;
        let mut buf = vec![0u8; 8192];
        let n = stream.read(&mut buf).await?;
        let request = String::from_utf8_lossy(&buf[..n]);
        let target = request.split_whitespace().nth(1).unwrap_or("/").to_string();

        if let Some(token) = parse_callback(&target, scopes)? {
            write_page(&mut stream, DONE_PAGE).await?;
            return Ok(token);
        }
        write_page(&mut stream, CALLBACK_PAGE).await?;
    }
}

async fn write_page(stream: &mut tokio::net::TcpStream, page: &str) -> Result<()> {
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        page.len(),
        page
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Extracts a token from the `/token?...` callback target.
fn parse_callback(target: &str, scopes: &[String]) -> Result<Option<AccessToken>> {
    if !target.starts_with("/token") {
        return Ok(None);
    }
    let url = reqwest::Url::parse(&format!("http://localhost{}", target))
        .context("Invalid implicit grant callback")?;
    let mut token = None;
    let mut expires_in = default_expires_in();
    let mut scope = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "access_token" => token = Some(value.into_owned()),
            "expires_in" => expires_in = value.parse().unwrap_or(expires_in),
            "scope" => scope = Some(value.into_owned()),
            "error" => {
                return Err(ToolkitError::Permission(format!("login failed: {}", value)).into())
            }
            _ => {}
        }
    }
    Ok(token.map(|t| AccessToken::new(t, expires_in, granted_scopes(scope.as_deref(), scopes))))
}
