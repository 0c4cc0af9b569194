//! Interfaces at the trust boundaries of the pipeline.
//!
//! Providers implement these against the live store APIs; tests wire in
//! in-memory fakes.

use async_trait::async_trait;

use crate::errors::Result;
use crate::types::{SecretRecord, SessionCredentials};

/// Read side: the store the changed secret is fetched from.
#[async_trait]
pub trait SourceStore: Send + Sync {
    /// Fetch a secret, pinned to `version` when given, latest otherwise.
    ///
    /// `Ok(None)` means the secret exists but carries no value (a skip for
    /// the pipeline). A secret that cannot be found at all is an error: the
    /// event announced that version, so its absence is an infrastructure
    /// problem worth a redelivery.
    async fn get_secret(&self, name: &str, version: Option<&str>) -> Result<Option<SecretRecord>>;
}

/// Durable first-writer-ever-wins claim per (name, version) pair.
#[async_trait]
pub trait DedupeGate: Send + Sync {
    /// Claim `(name, version)`. Returns `true` when this caller is the first
    /// claimant ever, `false` when the marker already existed.
    async fn try_claim(&self, name: &str, version: &str) -> Result<bool>;
}

/// Issues short-lived cross-domain credentials, cached until near-expiry.
#[async_trait]
pub trait CredentialBroker: Send + Sync {
    async fn credentials(&self) -> Result<SessionCredentials>;
}

/// Write side: the independently administered store in the other trust domain.
#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Create `name` with `value`, or replace its value when it already
    /// exists. The target assigns its own version either way.
    async fn upsert(
        &self,
        name: &str,
        value: &str,
        credentials: &SessionCredentials,
    ) -> Result<()>;
}
