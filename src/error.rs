//! Error types for the control plane.
//!
//! Failures that steer behavior are modelled as data: a pick failure becomes
//! the error class on an emitted FAILED record, a denied claim is a plain
//! `false`, and an undetermined working set aborts the current round so the
//! next tick can retry.

use std::time::Duration;

/// Why a message could not be picked from the bus for republishing.
///
/// Carried on the FAILED status record emitted in place of the republished
/// event; never unwinds out of a batch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PickError {
    /// The state record carries no partition/offset to read from.
    #[error("message carries no partition/offset coordinates")]
    MissingCoordinates,
    /// The bus returned no record at the exact coordinates within the timeout.
    #[error("no record at {topic}[{partition}]@{offset}")]
    NotFound { topic: String, partition: i32, offset: i64 },
    /// A record was read but could not be decoded as a subscription event.
    #[error("record at {topic}[{partition}]@{offset} could not be decoded: {reason}")]
    Decode { topic: String, partition: i32, offset: i64, reason: String },
    /// The bus read itself failed.
    #[error("bus read failed: {0}")]
    Transport(String),
}

impl PickError {
    /// Short class name recorded on the emitted FAILED record.
    pub fn class(&self) -> &'static str {
        match self {
            Self::MissingCoordinates => "MissingCoordinates",
            Self::NotFound { .. } => "RecordNotFound",
            Self::Decode { .. } => "DecodeFailure",
            Self::Transport(_) => "TransportFailure",
        }
    }
}

/// Errors surfaced by a cluster coordination backend.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("cluster backend unavailable: {0}")]
    Unavailable(String),
}

/// Errors surfaced by a breaker registry backend.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("breaker registry unavailable: {0}")]
    Unavailable(String),
}

/// Errors surfaced by the message state store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("state store query failed: {0}")]
    Query(String),
}

/// Errors surfaced by the event bus.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },
    #[error("bus read failed: {0}")]
    Read(String),
}

/// Errors acquiring an access token for probe requests.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TokenError {
    #[error("token endpoint request failed: {0}")]
    Request(String),
    #[error("token endpoint returned status {0}")]
    Status(u16),
    #[error("token response could not be decoded: {0}")]
    Decode(String),
}

/// Why a scan round was abandoned. Rounds are self-healing: the next
/// scheduled tick retries from scratch.
#[derive(Debug, thiserror::Error)]
pub enum RoundError {
    /// Cluster registry unreachable, no known members, or self not listed.
    #[error("working set undetermined: {0}")]
    WorkingSetUndetermined(String),
    /// The global lock was not acquired within the bounded wait.
    #[error("global lock not acquired within {0:?}")]
    LockTimeout(Duration),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Cluster(#[from] ClusterError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors reading or parsing the configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}
