use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure surface of the replication pipeline.
///
/// Every variant is fatal for the invocation that raised it; redelivery is
/// owned by the triggering platform. Outcomes that are expected traffic
/// (missing event fields, losing the dedupe claim, a value-less secret) are
/// modelled as skips on [`crate::ReplicationOutcome`], not as errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("source store error: {0}")]
    Source(String),
    #[error("dedupe storage error: {0}")]
    Dedupe(String),
    #[error("credential exchange error: {0}")]
    Credentials(String),
    #[error("target store error: {0}")]
    Target(String),
}
