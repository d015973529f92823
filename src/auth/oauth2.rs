//! OAuth 2.0 bearer-token authorizer.
//!
//! The consent flow happens elsewhere; this authorizer is handed an access
//! token and, optionally, a refresh token and keeps the former fresh.

use std::collections::HashSet;
use std::fmt;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use reqwest::header::{HeaderValue, AUTHORIZATION};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::{AuthorizationDomain, Authorizer};
use crate::error::{GDataError, Result};

/// Google's token endpoint.
pub const DEFAULT_TOKEN_URI: &str = "https://accounts.google.com/o/oauth2/token";

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

/// Client registration used for refreshing tokens.
#[derive(Clone, Deserialize)]
pub struct OAuth2Config {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

impl OAuth2Config {
    #[must_use]
    pub fn new(client_id: &str, client_secret: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            token_uri: default_token_uri(),
        }
    }

    #[must_use]
    pub fn with_token_uri(mut self, token_uri: &str) -> Self {
        self.token_uri = token_uri.to_string();
        self
    }
}

impl fmt::Debug for OAuth2Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuth2Config")
            .field("client_id", &self.client_id)
            .field("token_uri", &self.token_uri)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct TokenState {
    access_token: Option<String>,
    refresh_token: Option<String>,
    version: u64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Stamps requests with `Authorization: Bearer <token>` and refreshes the
/// token with the `refresh_token` grant.
///
/// The access token is replaced atomically. Refreshes are serialised, and a
/// request that failed with a token that has since been replaced retries
/// with the new one instead of refreshing again.
pub struct OAuth2Authorizer {
    config: OAuth2Config,
    http: reqwest::Client,
    domains: RwLock<HashSet<AuthorizationDomain>>,
    tokens: Mutex<TokenState>,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl fmt::Debug for OAuth2Authorizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuth2Authorizer")
            .field("config", &self.config)
            .field("domains", &self.domains.read().len())
            .field("version", &self.tokens.lock().version)
            .finish_non_exhaustive()
    }
}

impl OAuth2Authorizer {
    /// Create an authorizer covering `domains`, without tokens yet.
    #[must_use]
    pub fn new(
        config: OAuth2Config,
        domains: impl IntoIterator<Item = AuthorizationDomain>,
    ) -> Self {
        Self::with_http_client(config, domains, reqwest::Client::new())
    }

    #[must_use]
    pub fn with_http_client(
        config: OAuth2Config,
        domains: impl IntoIterator<Item = AuthorizationDomain>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            config,
            http,
            domains: RwLock::new(domains.into_iter().collect()),
            tokens: Mutex::new(TokenState::default()),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Builder-style variant of [`set_tokens`](Self::set_tokens).
    #[must_use]
    pub fn with_tokens(self, access_token: Option<&str>, refresh_token: Option<&str>) -> Self {
        self.set_tokens(access_token, refresh_token);
        self
    }

    /// Replace both tokens, e.g. after a consent flow.
    pub fn set_tokens(&self, access_token: Option<&str>, refresh_token: Option<&str>) {
        let mut tokens = self.tokens.lock();
        tokens.access_token = access_token.map(str::to_string);
        tokens.refresh_token = refresh_token.map(str::to_string);
        tokens.version += 1;
    }

    #[must_use]
    pub fn access_token(&self) -> Option<String> {
        self.tokens.lock().access_token.clone()
    }

    #[must_use]
    pub fn refresh_token(&self) -> Option<String> {
        self.tokens.lock().refresh_token.clone()
    }

    pub fn add_domain(&self, domain: AuthorizationDomain) {
        self.domains.write().insert(domain);
    }

    fn covers(&self, domain: Option<AuthorizationDomain>) -> bool {
        domain.map_or(true, |d| self.domains.read().contains(&d))
    }

    async fn request_token(&self, refresh_token: &str) -> Result<TokenResponse> {
        let params = [
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ];
        let response = self
            .http
            .post(&self.config.token_uri)
            .form(&params)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            let message = match serde_json::from_str::<TokenErrorResponse>(&body) {
                Ok(e) => match e.error_description {
                    Some(description) => format!("{}: {description}", e.error),
                    None => e.error,
                },
                Err(_) => format!("token endpoint returned HTTP {status}"),
            };
            return Err(if status.is_server_error() {
                GDataError::Server {
                    status: status.as_u16(),
                    message,
                }
            } else {
                GDataError::AuthenticationRequired(message)
            });
        }

        serde_json::from_str(&body)
            .map_err(|e| GDataError::Protocol(format!("invalid token response: {e}")))
    }
}

#[async_trait]
impl Authorizer for OAuth2Authorizer {
    fn process_request(&self, domain: Option<AuthorizationDomain>, request: &mut reqwest::Request) {
        if !self.covers(domain) {
            return;
        }
        let Some(token) = self.access_token() else {
            return;
        };
        match HeaderValue::from_str(&format!("Bearer {token}")) {
            Ok(mut value) => {
                value.set_sensitive(true);
                request.headers_mut().insert(AUTHORIZATION, value);
            }
            Err(_) => tracing::warn!("access token is not a valid header value"),
        }
    }

    fn is_authorized_for_domain(&self, domain: AuthorizationDomain) -> bool {
        self.covers(Some(domain)) && self.tokens.lock().access_token.is_some()
    }

    fn credential_version(&self) -> u64 {
        self.tokens.lock().version
    }

    async fn refresh_authorization(&self, cancel: &CancellationToken) -> Result<bool> {
        let version = self.credential_version();
        self.refresh_authorization_since(version, cancel).await
    }

    #[tracing::instrument(skip(self, cancel))]
    async fn refresh_authorization_since(
        &self,
        seen_version: u64,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let _guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(GDataError::Cancelled),
            guard = self.refresh_lock.lock() => guard,
        };

        let refresh_token = {
            let tokens = self.tokens.lock();
            if tokens.version != seen_version {
                tracing::debug!("credentials already refreshed by a concurrent request");
                return Ok(true);
            }
            match &tokens.refresh_token {
                Some(token) => token.clone(),
                None => return Ok(false),
            }
        };

        let token = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(GDataError::Cancelled),
            token = self.request_token(&refresh_token) => token?,
        };

        let mut tokens = self.tokens.lock();
        tokens.access_token = Some(token.access_token);
        if let Some(rotated) = token.refresh_token {
            tokens.refresh_token = Some(rotated);
        }
        tokens.version += 1;
        tracing::debug!(version = tokens.version, "access token refreshed");
        Ok(true)
    }
}
