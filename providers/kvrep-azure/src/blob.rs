//! Blob Storage dedupe gate.
//!
//! A zero-byte marker blob per (name, version) pair, written with
//! `If-None-Match: *` so only the first writer ever succeeds. Markers are
//! never deleted; replaying an old event after the target has moved on must
//! not re-push a stale value.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use kvrep_core::{DedupeGate, Error};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::StatusCode;

use crate::auth::{AadAuthConfig, AuthError, STORAGE_SCOPE, TokenSource};
use crate::unauthorized_hint;

const DEFAULT_CONTAINER: &str = "kvrep-dedupe";
/// Minimum service version that accepts bearer-token authentication.
const STORAGE_API_VERSION: &str = "2021-08-06";

/// Everything `encodeURIComponent` escapes, leaving its unreserved marks
/// (`-_.!~*'()`) intact; versions are URL-safe already and are appended
/// verbatim.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'!')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

pub struct BlobDedupeGate {
    endpoint: String,
    container: String,
    client: reqwest::Client,
    auth: Arc<TokenSource>,
}

impl BlobDedupeGate {
    /// Build from `DEDUPE_STORAGE_ENDPOINT`, `DEDUPE_CONTAINER`, and the
    /// `AZURE_*` credential variables.
    pub fn from_env(client: reqwest::Client) -> Result<Self> {
        let endpoint = std::env::var("DEDUPE_STORAGE_ENDPOINT")
            .context("set DEDUPE_STORAGE_ENDPOINT with your storage account blob endpoint")?;
        let container =
            std::env::var("DEDUPE_CONTAINER").unwrap_or_else(|_| DEFAULT_CONTAINER.to_string());
        let auth = AadAuthConfig::from_env(STORAGE_SCOPE)?;
        Ok(Self::new(
            endpoint,
            container,
            client.clone(),
            Arc::new(TokenSource::new(client, auth)),
        ))
    }

    pub fn new(
        endpoint: String,
        container: String,
        client: reqwest::Client,
        auth: Arc<TokenSource>,
    ) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            container,
            client,
            auth,
        }
    }

    async fn bearer(&self) -> kvrep_core::Result<String> {
        self.auth.bearer().await.map_err(|err| match err {
            AuthError::Unauthorized { status, body } => Error::Dedupe(format!(
                "Azure AAD rejected client credentials ({status}): {body}"
            )),
            other => Error::Dedupe(format!("failed to request azure token: {other}")),
        })
    }

    /// Idempotent container creation; 409 means it is already there.
    async fn ensure_container(&self) -> kvrep_core::Result<()> {
        let token = self.bearer().await?;
        let url = format!(
            "{}/{}?restype=container",
            self.endpoint, self.container
        );
        let response = self
            .client
            .put(&url)
            .header("Authorization", token)
            .header("x-ms-version", STORAGE_API_VERSION)
            .header("Content-Length", "0")
            .send()
            .await
            .map_err(|err| Error::Dedupe(format!("create container request failed: {err}")))?;

        match response.status() {
            StatusCode::CREATED | StatusCode::CONFLICT => Ok(()),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(Error::Dedupe(
                unauthorized_hint(response.status(), STORAGE_SCOPE, &self.endpoint),
            )),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(Error::Dedupe(format!(
                    "create container {container} failed: {status} {body}",
                    container = self.container
                )))
            }
        }
    }
}

/// Marker key for a (name, version) pair. The name may contain characters
/// that collide with the `/` separator, so it is percent-encoded.
pub fn marker_key(name: &str, version: &str) -> String {
    format!("{}/{}", utf8_percent_encode(name, COMPONENT), version)
}

#[async_trait]
impl DedupeGate for BlobDedupeGate {
    async fn try_claim(&self, name: &str, version: &str) -> kvrep_core::Result<bool> {
        self.ensure_container().await?;

        let key = marker_key(name, version);
        let token = self.bearer().await?;
        let url = format!("{}/{}/{}", self.endpoint, self.container, key);
        tracing::debug!(%key, "writing dedupe marker");

        let response = self
            .client
            .put(&url)
            .header("Authorization", token)
            .header("x-ms-version", STORAGE_API_VERSION)
            .header("x-ms-blob-type", "BlockBlob")
            .header("If-None-Match", "*")
            .header("Content-Length", "0")
            .body(Vec::new())
            .send()
            .await
            .map_err(|err| Error::Dedupe(format!("marker upload request failed: {err}")))?;

        match response.status() {
            StatusCode::CREATED => Ok(true),
            // conflict or failed precondition: the marker already exists
            StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => Ok(false),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(Error::Dedupe(
                unauthorized_hint(response.status(), STORAGE_SCOPE, &self.endpoint),
            )),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(Error::Dedupe(format!(
                    "marker upload for {key} failed: {status} {body}"
                )))
            }
        }
    }
}
