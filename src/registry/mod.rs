//! Producer and consumer registries.
//!
//! Each registry maps opaque handles to broker-facing records and shares one
//! broker instance between handles with identical connection parameters.
//! A canonical-key map points each connection identity at one live handle;
//! the record's reference count equals the number of handles aliasing it,
//! and the broker instance is torn down when the count reaches zero.

use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

use crate::broker::BrokerError;

pub mod consumer;
pub mod producer;

pub use consumer::{ConsumerRegistry, ConsumerRegistrySettings, ConsumerSpec};
pub use producer::{ProducerRegistry, ProducerSpec};

/// Result type for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Errors surfaced by registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("handle not found: {0}")]
    HandleNotFound(Uuid),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Outcome of a create call.
#[derive(Debug, Clone, Copy)]
pub struct CreateOutcome {
    /// Handle allocated for this caller.
    pub handle: Uuid,
    /// Whether an existing broker instance was reused.
    pub reused: bool,
    /// Reference count after the call.
    pub refs: usize,
}

/// Connection identity shared by producer handles.
///
/// Two requests with equal keys share one broker producer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProducerKey {
    pub endpoint: String,
    pub access_key_id: String,
    pub instance_id: String,
    pub topic: String,
}

/// Connection identity shared by consumer handles.
///
/// Topic is deliberately absent: one broker consumer multiplexes the topics
/// of a group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsumerKey {
    pub endpoint: String,
    pub access_key_id: String,
    pub instance_id: String,
    pub group_id: String,
}

/// Current time as unix epoch milliseconds.
pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Current time as unix epoch nanoseconds, for unique group-name synthesis.
pub(crate) fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}
