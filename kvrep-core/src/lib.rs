//! Core domain primitives and the replication pipeline shared across
//! providers and the delivery surface.

pub mod errors;
pub mod event;
pub mod replicator;
pub mod stores;
pub mod types;

pub use errors::{Error, Result};
pub use event::{EventData, RawEvent, ReplicationEvent, SkipReason, parse_event};
pub use replicator::{ReplicationOutcome, Replicator};
pub use stores::{CredentialBroker, DedupeGate, SourceStore, TargetStore};
pub use types::{Clock, SecretRecord, SessionCredentials, SystemClock};
