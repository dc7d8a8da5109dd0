//! YouTube API credentials.
//!
//! Credentials are looked up in this order:
//!
//! 1. `YT_ACCESS_TOKEN` (a ready bearer token, used as is)
//! 2. `YT_CLIENT_ID`, `YT_CLIENT_SECRET` and `YT_REFRESH_TOKEN`
//! 3. the cached token file at `~/.config/stream-tools/token.json`
//!
//! Obtaining a refresh token in the first place (the browser consent flow) is
//! left to other tooling.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::util;

pub const ACCESS_TOKEN_ENV: &str = "YT_ACCESS_TOKEN";
pub const CLIENT_ID_ENV: &str = "YT_CLIENT_ID";
pub const CLIENT_SECRET_ENV: &str = "YT_CLIENT_SECRET";
pub const REFRESH_TOKEN_ENV: &str = "YT_REFRESH_TOKEN";

pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

// Refresh a little before Google says the token expires.
const EXPIRY_MARGIN_SECS: i64 = 60;

#[derive(thiserror::Error, Debug)]
pub enum AuthError {
    #[error("no YouTube credentials found (set YT_ACCESS_TOKEN, or YT_CLIENT_ID/YT_CLIENT_SECRET/YT_REFRESH_TOKEN, or provide {0})")]
    MissingCredentials(String),
    #[error("could not read token file {0}: {1}")]
    TokenFile(PathBuf, #[source] std::io::Error),
    #[error("could not parse token file {0}: {1}")]
    TokenFileFormat(PathBuf, #[source] serde_json::Error),
    #[error("token refresh failed: {0}")]
    Refresh(#[from] util::HttpError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Credentials {
    AccessToken(String),
    RefreshToken {
        client_id: String,
        client_secret: String,
        refresh_token: String,
        token_uri: String,
    },
}

/// The authorized-user JSON written by Google's client libraries.
#[derive(Debug, Clone, Deserialize)]
struct TokenFile {
    token: Option<String>,
    refresh_token: Option<String>,
    token_uri: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
    expiry: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: Option<DateTime<Utc>>,
}

impl CachedToken {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|t| now < t).unwrap_or(true)
    }
}

pub fn default_token_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".config").join("stream-tools").join("token.json"))
}

impl Credentials {
    /// Reads credentials from variables resolved by `lookup`. Empty values
    /// count as unset.
    pub fn from_vars<F>(lookup: F) -> Option<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(token) = var(ACCESS_TOKEN_ENV) {
            return Some(Credentials::AccessToken(token));
        }

        match (
            var(CLIENT_ID_ENV),
            var(CLIENT_SECRET_ENV),
            var(REFRESH_TOKEN_ENV),
        ) {
            (Some(client_id), Some(client_secret), Some(refresh_token)) => {
                Some(Credentials::RefreshToken {
                    client_id,
                    client_secret,
                    refresh_token,
                    token_uri: DEFAULT_TOKEN_URI.to_string(),
                })
            }
            _ => None,
        }
    }

    pub fn from_env() -> Option<Self> {
        Self::from_vars(|name| std::env::var(name).ok())
    }
}

fn read_token_file(path: &Path) -> Result<Option<TokenFile>, AuthError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(AuthError::TokenFile(path.to_path_buf(), e)),
    };

    serde_json::from_str(&contents)
        .map(Some)
        .map_err(|e| AuthError::TokenFileFormat(path.to_path_buf(), e))
}

/// Source of bearer tokens for the YouTube API.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn access_token(&self) -> Result<String, AuthError>;
}

pub struct OAuthTokenSource {
    http: util::HttpClient,
    credentials: Credentials,
    cached: Mutex<Option<CachedToken>>,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    expires_in: Option<i64>,
}

impl OAuthTokenSource {
    pub fn new(http: util::HttpClient, credentials: Credentials) -> Self {
        Self {
            http,
            credentials,
            cached: Mutex::new(None),
        }
    }

    /// Environment first, then the token file at `token_path`.
    pub fn discover(http: util::HttpClient, token_path: Option<&Path>) -> Result<Self, AuthError> {
        if let Some(credentials) = Credentials::from_env() {
            debug!("Using YouTube credentials from environment");
            return Ok(Self::new(http, credentials));
        }

        let missing = || {
            AuthError::MissingCredentials(
                token_path
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "a token file".to_string()),
            )
        };

        let path = token_path.ok_or_else(missing)?;
        let file = read_token_file(path)?.ok_or_else(missing)?;
        debug!("Using YouTube credentials from {}", path.display());

        Self::from_token_file(http, file).ok_or_else(missing)
    }

    fn from_token_file(http: util::HttpClient, file: TokenFile) -> Option<Self> {
        let cached = file.token.clone().map(|token| CachedToken {
            token,
            expires_at: file.expiry,
        });

        let credentials = match (file.client_id, file.client_secret, file.refresh_token) {
            (Some(client_id), Some(client_secret), Some(refresh_token)) => {
                Credentials::RefreshToken {
                    client_id,
                    client_secret,
                    refresh_token,
                    token_uri: file
                        .token_uri
                        .unwrap_or_else(|| DEFAULT_TOKEN_URI.to_string()),
                }
            }
            _ => Credentials::AccessToken(file.token?),
        };

        Some(Self {
            http,
            credentials,
            cached: Mutex::new(cached),
        })
    }

    async fn refresh(
        &self,
        client_id: &str,
        client_secret: &str,
        refresh_token: &str,
        token_uri: &str,
    ) -> Result<CachedToken, AuthError> {
        let params = [
            ("grant_type", "refresh_token"),
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("refresh_token", refresh_token),
        ];

        let resp = self
            .http
            .client
            .post(token_uri)
            .form(&params)
            .send()
            .await
            .map_err(util::HttpError::from)?;
        let body: RefreshResponse = util::read_json(resp).await?;

        let expires_at = body
            .expires_in
            .map(|secs| Utc::now() + Duration::seconds(secs - EXPIRY_MARGIN_SECS));
        debug!("Refreshed YouTube access token (expires {:?})", expires_at);

        Ok(CachedToken {
            token: body.access_token,
            expires_at,
        })
    }
}

#[async_trait]
impl TokenProvider for OAuthTokenSource {
    async fn access_token(&self) -> Result<String, AuthError> {
        let (client_id, client_secret, refresh_token, token_uri) = match &self.credentials {
            Credentials::AccessToken(token) => return Ok(token.clone()),
            Credentials::RefreshToken {
                client_id,
                client_secret,
                refresh_token,
                token_uri,
            } => (client_id, client_secret, refresh_token, token_uri),
        };

        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref().filter(|t| t.is_fresh(Utc::now())) {
            return Ok(token.token.clone());
        }

        let fresh = self
            .refresh(client_id, client_secret, refresh_token, token_uri)
            .await?;
        let token = fresh.token.clone();
        *cached = Some(fresh);

        Ok(token)
    }
}
