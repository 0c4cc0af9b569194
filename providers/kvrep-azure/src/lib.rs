//! Azure providers backed by the live REST APIs: the Key Vault source store
//! and the Blob Storage dedupe gate. Authentication uses the OAuth2 client
//! credentials flow with values supplied through environment variables.

pub mod auth;
pub mod blob;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use kvrep_core::{Error, SecretRecord, SourceStore};
use reqwest::StatusCode;
use serde::Deserialize;

use auth::{AadAuthConfig, AuthError, TokenSource, VAULT_SCOPE};
pub use blob::BlobDedupeGate;

const SECRETS_API_VERSION: &str = "7.4";
const DEFAULT_TIMEOUT_SECS: u64 = 15;

/// Shared HTTP client with the provider-wide request timeout.
pub fn http_client() -> Result<reqwest::Client> {
    let timeout = std::env::var("AZURE_HTTP_TIMEOUT_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .unwrap_or(DEFAULT_TIMEOUT_SECS);
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout))
        .build()
        .context("failed to build reqwest client for azure providers")
}

/// Key Vault source store.
#[derive(Debug)]
pub struct KeyVaultSource {
    vault_uri: String,
    client: reqwest::Client,
    auth: Arc<TokenSource>,
}

impl KeyVaultSource {
    /// Build from `KEY_VAULT_URI` and the `AZURE_*` credential variables.
    pub fn from_env(client: reqwest::Client) -> Result<Self> {
        let vault_uri = std::env::var("KEY_VAULT_URI")
            .context("set KEY_VAULT_URI with your Key Vault URL")?;
        let auth = AadAuthConfig::from_env(VAULT_SCOPE)?;
        Ok(Self::new(
            vault_uri,
            client.clone(),
            Arc::new(TokenSource::new(client, auth)),
        ))
    }

    pub fn new(vault_uri: String, client: reqwest::Client, auth: Arc<TokenSource>) -> Self {
        Self {
            vault_uri: vault_uri.trim_end_matches('/').to_string(),
            client,
            auth,
        }
    }

    fn secret_url(&self, name: &str, version: Option<&str>) -> String {
        match version {
            Some(version) => format!(
                "{}/secrets/{}/{}?api-version={}",
                self.vault_uri, name, version, SECRETS_API_VERSION
            ),
            None => format!(
                "{}/secrets/{}?api-version={}",
                self.vault_uri, name, SECRETS_API_VERSION
            ),
        }
    }

    async fn bearer(&self) -> kvrep_core::Result<String> {
        self.auth.bearer().await.map_err(|err| match err {
            AuthError::Unauthorized { status, body } => Error::Source(format!(
                "Azure AAD rejected client credentials ({status}); scope {}: {body}",
                self.auth.scope()
            )),
            other => Error::Source(format!("failed to request azure token: {other}")),
        })
    }
}

#[async_trait]
impl SourceStore for KeyVaultSource {
    async fn get_secret(
        &self,
        name: &str,
        version: Option<&str>,
    ) -> kvrep_core::Result<Option<SecretRecord>> {
        let token = self.bearer().await?;
        let url = self.secret_url(name, version);
        let response = self
            .client
            .get(url)
            .header("Authorization", token)
            .send()
            .await
            .map_err(|err| Error::Source(format!("key vault request failed: {err}")))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(Error::Source(unauthorized_hint(
                status,
                VAULT_SCOPE,
                &self.vault_uri,
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Source(format!(
                "get secret {name} failed: {status} {body}"
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|err| Error::Source(format!("key vault response read failed: {err}")))?;
        let bundle = parse_secret_bundle(&body)?;
        Ok(bundle_to_record(name, version, bundle))
    }
}

#[derive(Deserialize)]
struct SecretBundle {
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    id: Option<String>,
}

fn parse_secret_bundle(body: &str) -> kvrep_core::Result<SecretBundle> {
    serde_json::from_str(body)
        .map_err(|err| Error::Source(format!("failed to parse secret bundle: {err}; body={body}")))
}

fn bundle_to_record(
    name: &str,
    requested_version: Option<&str>,
    bundle: SecretBundle,
) -> Option<SecretRecord> {
    let value = bundle.value?;
    let version = requested_version
        .map(str::to_string)
        .or_else(|| bundle.id.as_deref().and_then(version_from_bundle_id))
        .unwrap_or_default();
    Some(SecretRecord {
        name: name.to_string(),
        value,
        version,
    })
}

/// The trailing segment of a bundle id such as
/// `https://vault.example.net/secrets/foo/4387e9f3d6e14c459867679a90fd0f79`.
fn version_from_bundle_id(id: &str) -> Option<String> {
    id.rsplit('/').next().map(str::to_string)
}

/// UNAUTHORIZED responses from storage APIs get a configuration hint; used by
/// both the vault and the blob clients.
pub(crate) fn unauthorized_hint(status: StatusCode, scope: &str, endpoint: &str) -> String {
    format!(
        "azure endpoint {endpoint} returned {status}. Hint: ensure AZURE_TENANT_ID, \
         AZURE_CLIENT_ID, and AZURE_CLIENT_SECRET are configured and the principal has \
         access for scope {scope}."
    )
}
