//! The per-event pipeline: parse, claim, read, authenticate, write.

use std::sync::Arc;

use tracing::{Instrument, info, info_span};

use crate::errors::Result;
use crate::event::{RawEvent, SkipReason, parse_event};
use crate::stores::{CredentialBroker, DedupeGate, SourceStore, TargetStore};

/// How a single event left the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationOutcome {
    /// The value was written to the target store.
    Replicated { name: String, version: String },
    /// The event terminated early without touching the target store.
    Skipped(SkipReason),
}

/// Wires the stores into the per-event pipeline. Stateless across events;
/// shared by every concurrent invocation of the delivery surface.
pub struct Replicator {
    source: Arc<dyn SourceStore>,
    dedupe: Arc<dyn DedupeGate>,
    credentials: Arc<dyn CredentialBroker>,
    target: Arc<dyn TargetStore>,
}

impl Replicator {
    pub fn new(
        source: Arc<dyn SourceStore>,
        dedupe: Arc<dyn DedupeGate>,
        credentials: Arc<dyn CredentialBroker>,
        target: Arc<dyn TargetStore>,
    ) -> Self {
        Self {
            source,
            dedupe,
            credentials,
            target,
        }
    }

    /// Run one notification through the pipeline.
    ///
    /// Skips terminate successfully; any error is fatal for this invocation
    /// and is left to the caller's redelivery policy. A failure inside
    /// `try_claim` leaves no marker behind, so a redelivered event
    /// legitimately re-attempts the claim.
    pub async fn handle(&self, event: &RawEvent) -> Result<ReplicationOutcome> {
        let parsed = match parse_event(event) {
            Ok(parsed) => parsed,
            Err(reason) => {
                info!(
                    subject = event.subject.as_deref().unwrap_or("n/a"),
                    event_type = event.event_type.as_deref().unwrap_or("unknown"),
                    %reason,
                    "skipping event"
                );
                return Ok(ReplicationOutcome::Skipped(reason));
            }
        };

        let span = info_span!(
            "replicate",
            name = %parsed.secret_name,
            version = %parsed.version,
            event_type = %parsed.event_type
        );
        async move {
            if !self
                .dedupe
                .try_claim(&parsed.secret_name, &parsed.version)
                .await?
            {
                info!("marker already present; not the first claimant");
                return Ok(ReplicationOutcome::Skipped(SkipReason::AlreadyClaimed));
            }

            let Some(record) = self
                .source
                .get_secret(&parsed.secret_name, Some(&parsed.version))
                .await?
            else {
                info!("source secret has no value");
                return Ok(ReplicationOutcome::Skipped(SkipReason::MissingValue));
            };

            let credentials = self.credentials.credentials().await?;
            self.target
                .upsert(&record.name, &record.value, &credentials)
                .await?;

            info!("replicated to target store");
            Ok(ReplicationOutcome::Replicated {
                name: parsed.secret_name,
                version: parsed.version,
            })
        }
        .instrument(span)
        .await
    }
}
