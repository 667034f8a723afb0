use thiserror::Error;

use crate::types::{DestinationId, EventId, MarkerKind};

/// Failure touching the marker directory
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to list marker directory {dir}: {source}")]
    List {
        dir: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read {kind} marker for {event}: {source}")]
    Read {
        event: EventId,
        kind: MarkerKind,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {kind} marker for {event}: {source}")]
    Write {
        event: EventId,
        kind: MarkerKind,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to delete {kind} marker for {event}: {source}")]
    Delete {
        event: EventId,
        kind: MarkerKind,
        #[source]
        source: std::io::Error,
    },

    #[error("no {kind} marker for {event}")]
    Missing { event: EventId, kind: MarkerKind },

    #[error("{kind} markers cannot be written directly")]
    NotWritable { kind: MarkerKind },
}

/// Failure delivering a notification to one destination
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("unexpected response: {0}")]
    Parse(String),
}

impl From<reqwest::Error> for DeliveryError {
    fn from(err: reqwest::Error) -> Self {
        DeliveryError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for DeliveryError {
    fn from(err: serde_json::Error) -> Self {
        DeliveryError::Parse(err.to_string())
    }
}

/// Outcome of a transition that could not be fully applied
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{failed} of {attempted} deliveries failed, first to {destination}: {source}")]
    Delivery {
        destination: DestinationId,
        attempted: usize,
        failed: usize,
        #[source]
        source: DeliveryError,
    },
}
