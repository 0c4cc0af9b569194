//! Notification payload decoding.
//!
//! Push deliveries arrive with inconsistent field casing depending on the
//! schema the subscription was created with, and not every delivery carries
//! every field. The name and the version each resolve through an ordered
//! fallback chain; an event that yields neither is expected traffic and maps
//! to a skip, never an error.

use serde::Deserialize;
use url::Url;

/// Path segment that precedes the secret name in a resource identifier URL.
const SECRETS_COLLECTION: &str = "secrets";

/// Notification payload as delivered by the eventing platform.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawEvent {
    #[serde(default, alias = "Subject")]
    pub subject: Option<String>,
    #[serde(default, rename = "eventType", alias = "EventType")]
    pub event_type: Option<String>,
    #[serde(default, alias = "Data")]
    pub data: Option<EventData>,
}

/// The `data` envelope of a notification.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventData {
    #[serde(default, alias = "Id")]
    pub id: Option<String>,
    #[serde(default, rename = "objectName", alias = "ObjectName")]
    pub object_name: Option<String>,
    #[serde(default, alias = "Version")]
    pub version: Option<String>,
    #[serde(default, rename = "validationCode", alias = "ValidationCode")]
    pub validation_code: Option<String>,
}

/// A fully resolved notification, ready for the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationEvent {
    pub secret_name: String,
    pub version: String,
    pub event_type: String,
}

/// Why an event terminated without reaching the target store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No field of the payload yielded a secret name.
    MissingName,
    /// No field of the payload yielded a version.
    MissingVersion,
    /// Another invocation already claimed this (name, version) pair.
    AlreadyClaimed,
    /// The source store holds no value for this secret version.
    MissingValue,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            SkipReason::MissingName => "event carries no secret name",
            SkipReason::MissingVersion => "event carries no version",
            SkipReason::AlreadyClaimed => "version already claimed by another invocation",
            SkipReason::MissingValue => "source secret has no value",
        };
        f.write_str(text)
    }
}

/// Resolve the (name, version) pair of a notification.
///
/// Name: direct `objectName` field, then the identifier URL when it carries
/// both a name and a version segment after the `secrets` collection segment,
/// then the trailing path segment of `subject`. Version: direct `version`
/// field, then the identifier URL. The subject never yields a version.
pub fn parse_event(event: &RawEvent) -> Result<ReplicationEvent, SkipReason> {
    let data = event.data.clone().unwrap_or_default();
    let id_pair = data.id.as_deref().and_then(name_version_from_id);

    let secret_name = non_empty(data.object_name)
        .or_else(|| id_pair.as_ref().map(|(name, _)| name.clone()))
        .or_else(|| event.subject.as_deref().and_then(name_from_subject))
        .ok_or(SkipReason::MissingName)?;
    let version = non_empty(data.version)
        .or_else(|| id_pair.map(|(_, version)| version))
        .ok_or(SkipReason::MissingVersion)?;

    Ok(ReplicationEvent {
        secret_name,
        version,
        event_type: event.event_type.clone().unwrap_or_else(|| "unknown".into()),
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|text| !text.trim().is_empty())
}

/// Extract `(name, version)` from a resource identifier URL such as
/// `https://vault.example.net/secrets/foo/bar`. A partial identifier with
/// only a name segment contributes nothing, so the subject fallback decides.
fn name_version_from_id(id: &str) -> Option<(String, String)> {
    let url = Url::parse(id).ok()?;
    let segments: Vec<&str> = url
        .path_segments()?
        .filter(|segment| !segment.is_empty())
        .collect();
    let index = segments
        .iter()
        .rposition(|segment| *segment == SECRETS_COLLECTION)?;

    let name = segments.get(index + 1)?;
    let version = segments.get(index + 2)?;
    Some((name.to_string(), version.to_string()))
}

/// The trailing path segment of a bare subject, or the subject itself when it
/// contains no separators.
fn name_from_subject(subject: &str) -> Option<String> {
    let trimmed = subject.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed
        .split('/')
        .filter(|segment| !segment.is_empty())
        .next_back()
        .map(str::to_string)
}
