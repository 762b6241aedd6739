// ABOUTME: Connection to a remote instance and its protocol-scoped HTTP clients
// ABOUTME: Handles base addresses, timeouts, authentication and redacted request logging

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method, Request, Response};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use super::auth::{self, TokenCache, ACCOUNT_MANAGER_HOST};
use super::models::ApiResponse;
use super::{DataApi, Instance};
use crate::config::InstanceConfig;
use crate::error::ToolkitError;

pub const DATA_API_VERSION: &str = "v23_2";
pub const HTTP_LOG_TARGET: &str = "b2c_toolkit::http";
const REDACTED_PREFIX_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    DataApi,
    WebDav,
    AccountManager,
    ShortCode,
    ManagedRuntime,
}

impl Protocol {
    pub const ALL: [Protocol; 5] = [
        Protocol::DataApi,
        Protocol::WebDav,
        Protocol::AccountManager,
        Protocol::ShortCode,
        Protocol::ManagedRuntime,
    ];

    pub fn timeout(self) -> Duration {
        match self {
            Protocol::DataApi => Duration::from_secs(60),
            Protocol::WebDav => Duration::from_secs(300),
            Protocol::AccountManager => Duration::from_secs(30),
            Protocol::ShortCode => Duration::from_secs(60),
            Protocol::ManagedRuntime => Duration::from_secs(60),
        }
    }
}

/// Request payloads the protocol clients send.
#[derive(Debug, Clone)]
pub enum RequestBody {
    Empty,
    Json(Value),
    Bytes(Vec<u8>),
    Form(Vec<(String, String)>),
}

#[derive(Debug, Clone, PartialEq)]
enum AuthMode {
    None,
    Basic(String, String),
    Bearer,
    ApiKey(String),
}

/// Credentials, endpoints and one HTTP client per protocol for a single instance.
pub struct Connection {
    config: InstanceConfig,
    tokens: TokenCache,
    clients: HashMap<Protocol, Client>,
    base_urls: HashMap<Protocol, String>,
}

impl Connection {
    pub fn new(config: InstanceConfig) -> Result<Self> {
        Self::with_token_cache(config, TokenCache::new())
    }

    /// Builds a connection sharing `tokens` with any other connection that uses it.
    pub fn with_token_cache(config: InstanceConfig, tokens: TokenCache) -> Result<Self> {
        let has_server_credentials = config.hostname.is_some() && config.has_basic_credentials();
        if config.client_id.is_none() && !has_server_credentials {
            return Err(ToolkitError::Config(
                "a client id, or a server with username and password, is required".to_string(),
            )
            .into());
        }

        let mut clients = HashMap::new();
        for protocol in Protocol::ALL {
            clients.insert(protocol, build_http_client(&config, protocol)?);
        }

        Ok(Self {
            config,
            tokens,
            clients,
            base_urls: HashMap::new(),
        })
    }

    /// Points `protocol` at another base address, e.g. a proxy.
    pub fn with_base_url(mut self, protocol: Protocol, base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        self.base_urls.insert(protocol, base_url);
        self
    }

    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    pub fn tokens(&self) -> &TokenCache {
        &self.tokens
    }

    pub fn client(&self, protocol: Protocol) -> Result<ProtocolClient<'_>> {
        let base_url = self.base_url(protocol)?;
        let http = self
            .clients
            .get(&protocol)
            .ok_or_else(|| ToolkitError::Config(format!("no HTTP client for {:?}", protocol)))?;
        Ok(ProtocolClient {
            connection: self,
            protocol,
            http,
            base_url,
        })
    }

    fn base_url(&self, protocol: Protocol) -> Result<String> {
        if let Some(url) = self.base_urls.get(&protocol) {
            return Ok(url.clone());
        }
        let missing = |what: &str| ToolkitError::Config(format!("{} is not configured", what));
        Ok(match protocol {
            Protocol::DataApi => {
                let host = self.config.hostname.as_deref().ok_or_else(|| missing("hostname"))?;
                format!("https://{}/s/-/dw/data/{}/", host, DATA_API_VERSION)
            }
            Protocol::WebDav => {
                let host = self.config.webdav_host().ok_or_else(|| missing("hostname"))?;
                format!("https://{}/on/demandware.servlet/webdav/Sites/", host)
            }
            Protocol::AccountManager => format!("https://{}/dwsso/oauth2/", ACCOUNT_MANAGER_HOST),
            Protocol::ShortCode => {
                let code = self
                    .config
                    .short_code
                    .as_deref()
                    .ok_or_else(|| missing("short code"))?;
                format!("https://{}.api.commercecloud.salesforce.com/", code)
            }
            Protocol::ManagedRuntime => "https://cloud.mobify.com/api/".to_string(),
        })
    }

    fn auth_mode(&self, protocol: Protocol) -> Result<AuthMode> {
        Ok(match protocol {
            Protocol::AccountManager => AuthMode::None,
            Protocol::WebDav => match (&self.config.username, &self.config.password) {
                (Some(user), Some(pass)) if !self.config.webdav_bearer => {
                    AuthMode::Basic(user.clone(), pass.clone())
                }
                _ => AuthMode::Bearer,
            },
            Protocol::DataApi | Protocol::ShortCode => AuthMode::Bearer,
            Protocol::ManagedRuntime => {
                let key = self.config.mrt_api_key.clone().ok_or_else(|| {
                    ToolkitError::Config("managed runtime API key is not configured".to_string())
                })?;
                AuthMode::ApiKey(key)
            }
        })
    }

    /// Returns a cached bearer token or acquires a new one.
    pub async fn access_token(&self) -> Result<String> {
        let client_id = self.config.client_id.as_deref().ok_or_else(|| {
            ToolkitError::Config("a client id is required for bearer authentication".to_string())
        })?;
        let scopes = &self.config.scopes;
        if let Some(token) = self.tokens.get(client_id, scopes) {
            return Ok(token.token);
        }

        let token = match &self.config.client_secret {
            Some(secret) => {
                let account_manager = self.client(Protocol::AccountManager)?;
                auth::client_credentials_grant(
                    account_manager.http,
                    &account_manager.url("access_token"),
                    client_id,
                    secret,
                    scopes,
                )
                .await?
            }
            None => auth::implicit_grant(client_id, scopes).await?,
        };
        self.tokens.insert(client_id, token.clone());
        Ok(token.token)
    }

    fn invalidate_token(&self) {
        if let Some(client_id) = &self.config.client_id {
            self.tokens.invalidate(client_id);
        }
    }
}

fn build_http_client(config: &InstanceConfig, protocol: Protocol) -> Result<Client> {
    let mut builder = Client::builder().timeout(protocol.timeout());
    if matches!(protocol, Protocol::DataApi | Protocol::WebDav) {
        if config.self_signed {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(path) = &config.certificate {
            let der = std::fs::read(path)
                .with_context(|| format!("Failed to read client certificate {}", path.display()))?;
            let identity =
                reqwest::Identity::from_pkcs12_der(&der, config.passphrase.as_deref().unwrap_or(""))
                    .context("Failed to load client certificate")?;
            builder = builder.identity(identity);
        }
    }
    builder.build().context("Failed to create HTTP client")
}

/// HTTP client bound to one protocol's base address and authentication.
pub struct ProtocolClient<'a> {
    connection: &'a Connection,
    protocol: Protocol,
    http: &'a Client,
    base_url: String,
}

impl ProtocolClient<'_> {
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Sends a request. A bearer request rejected with 401 drops the cached
    /// token and is retried once with a fresh one.
    pub async fn send(&self, method: Method, path: &str, body: &RequestBody) -> Result<Response> {
        let auth = self.connection.auth_mode(self.protocol)?;
        let mut retried = false;
        loop {
            let request = self.build(method.clone(), path, body, &auth).await?;
            log_request(&request);
            let response = self
                .http
                .execute(request)
                .await
                .with_context(|| format!("Failed to send {} {}", method, self.url(path)))?;
            debug!(
                target: HTTP_LOG_TARGET,
                status = response.status().as_u16(),
                url = %response.url(),
                "response"
            );

            if response.status() == reqwest::StatusCode::UNAUTHORIZED
                && auth == AuthMode::Bearer
                && !retried
            {
                debug!("Access token rejected, requesting a new one");
                self.connection.invalidate_token();
                retried = true;
                continue;
            }
            return Ok(response);
        }
    }

    async fn build(
        &self,
        method: Method,
        path: &str,
        body: &RequestBody,
        auth: &AuthMode,
    ) -> Result<Request> {
        let mut builder = self.http.request(method, self.url(path));
        builder = match auth {
            AuthMode::None => builder,
            AuthMode::Basic(user, pass) => builder.basic_auth(user, Some(pass)),
            AuthMode::Bearer => builder.bearer_auth(self.connection.access_token().await?),
            AuthMode::ApiKey(key) => builder.bearer_auth(key),
        };
        builder = match body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(value),
            RequestBody::Bytes(bytes) => builder.body(bytes.clone()),
            RequestBody::Form(pairs) => builder.form(pairs),
        };
        builder.build().context("Failed to build request")
    }
}

fn log_request(request: &Request) {
    let headers: Vec<(String, String)> = request
        .headers()
        .iter()
        .map(|(name, value)| {
            let value = value.to_str().unwrap_or("<binary>");
            let value = if *name == reqwest::header::AUTHORIZATION {
                redact(value)
            } else {
                value.to_string()
            };
            (name.to_string(), value)
        })
        .collect();
    let body_len = request
        .body()
        .and_then(|b| b.as_bytes())
        .map(|b| b.len())
        .unwrap_or(0);
    debug!(
        target: HTTP_LOG_TARGET,
        method = %request.method(),
        url = %request.url(),
        headers = ?headers,
        body_len,
        "request"
    );
}

/// Keeps a fixed prefix of a credential-bearing header value.
pub fn redact(value: &str) -> String {
    if value.chars().count() <= REDACTED_PREFIX_LEN {
        return value.to_string();
    }
    let prefix: String = value.chars().take(REDACTED_PREFIX_LEN).collect();
    format!("{}...<redacted>", prefix)
}

#[async_trait]
impl DataApi for Connection {
    async fn data_request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<ApiResponse> {
        let client = self.client(Protocol::DataApi)?;
        let body = body
            .map(|b| RequestBody::Json(b.clone()))
            .unwrap_or(RequestBody::Empty);
        let response = client.send(method, path, &body).await?;
        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .context("Failed to read data API response")?;
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        Ok(ApiResponse::new(status, body))
    }
}

impl Instance for Connection {
    fn client_id(&self) -> Option<&str> {
        self.config.client_id.as_deref()
    }

    fn code_version(&self) -> Option<&str> {
        self.config.code_version.as_deref()
    }
}
