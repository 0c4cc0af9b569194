//! Azure AD client-credentials token source, cached until near-expiry and
//! shared by the Key Vault and Blob Storage clients (each with its own
//! resource scope).

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::sync::Mutex;

const TOKEN_ENDPOINT_TEMPLATE: &str =
    "https://login.microsoftonline.com/{tenant}/oauth2/v2.0/token";

/// Resource scope for Key Vault data-plane calls.
pub const VAULT_SCOPE: &str = "https://vault.azure.net/.default";
/// Resource scope for Blob Storage data-plane calls.
pub const STORAGE_SCOPE: &str = "https://storage.azure.com/.default";

#[derive(Clone, Debug)]
pub struct AadAuthConfig {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
    pub scope: String,
}

impl AadAuthConfig {
    pub fn from_env(scope: &str) -> Result<Self> {
        let tenant_id =
            std::env::var("AZURE_TENANT_ID").context("missing AZURE_TENANT_ID for Azure auth")?;
        let client_id =
            std::env::var("AZURE_CLIENT_ID").context("missing AZURE_CLIENT_ID for Azure auth")?;
        let client_secret = std::env::var("AZURE_CLIENT_SECRET")
            .context("missing AZURE_CLIENT_SECRET for Azure auth")?;

        Ok(Self {
            tenant_id,
            client_id,
            client_secret,
            scope: scope.to_string(),
        })
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthError {
    #[error("token endpoint rejected the request: {status} {body}")]
    Unauthorized {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("failed to request token: {0}")]
    Request(String),
    #[error("failed to parse token response: {0}")]
    Parse(String),
}

#[derive(Debug)]
struct TokenCache {
    header: String,
    expires_at: Instant,
}

/// Lazily fetches bearer tokens for one scope and reuses them until they are
/// about to expire.
#[derive(Debug)]
pub struct TokenSource {
    http: reqwest::Client,
    config: AadAuthConfig,
    cache: Mutex<Option<TokenCache>>,
}

impl TokenSource {
    pub fn new(http: reqwest::Client, config: AadAuthConfig) -> Self {
        tracing::info!(
            tenant_id = %config.tenant_id,
            scope = %config.scope,
            "azure credential: client credentials flow"
        );
        Self {
            http,
            config,
            cache: Mutex::new(None),
        }
    }

    /// An `Authorization` header value, refreshed when the cached token is
    /// within a minute of expiry. The lock is held across the refresh so
    /// concurrent callers coalesce onto one token request.
    pub async fn bearer(&self) -> Result<String, AuthError> {
        let mut guard = self.cache.lock().await;
        if let Some(cache) = guard.as_ref() {
            if Instant::now() < cache.expires_at {
                return Ok(cache.header.clone());
            }
        }

        let token = request_access_token(&self.http, &self.config).await?;
        let entry = TokenCache {
            header: format!("Bearer {}", token.token),
            expires_at: Instant::now() + token.expires_in,
        };
        let header = entry.header.clone();
        *guard = Some(entry);
        Ok(header)
    }

    pub fn scope(&self) -> &str {
        &self.config.scope
    }
}

#[derive(Debug)]
struct AccessToken {
    token: String,
    expires_in: Duration,
}

async fn request_access_token(
    client: &reqwest::Client,
    cfg: &AadAuthConfig,
) -> Result<AccessToken, AuthError> {
    let url = TOKEN_ENDPOINT_TEMPLATE.replace("{tenant}", &cfg.tenant_id);
    let params = [
        ("client_id", cfg.client_id.as_str()),
        ("client_secret", cfg.client_secret.as_str()),
        ("scope", cfg.scope.as_str()),
        ("grant_type", "client_credentials"),
    ];

    let response = client
        .post(url)
        .form(&params)
        .send()
        .await
        .map_err(|err| AuthError::Request(err.to_string()))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(AuthError::Unauthorized { status, body });
    }

    let payload: TokenResponse = response
        .json()
        .await
        .map_err(|err| AuthError::Parse(err.to_string()))?;

    // shave a minute off the reported lifetime, but never go below one
    let expires_in = payload
        .expires_in
        .unwrap_or(3600)
        .saturating_sub(60)
        .max(60);

    Ok(AccessToken {
        token: payload.access_token,
        expires_in: Duration::from_secs(expires_in as u64),
    })
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u32>,
}
