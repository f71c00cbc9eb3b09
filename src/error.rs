//! Error types for the worker/server training protocol.

use crate::models::{ItemId, UserId};
use std::time::Duration;
use thiserror::Error;

/// An upstream contract breach. Fatal for the worker partition that observes it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolViolation {
    #[error("rating ({user_id}, {item_id}) arrived after the end-of-input barrier")]
    RatingAfterBarrier { user_id: UserId, item_id: ItemId },

    #[error("user {user_id} belongs to worker {expected}, not this one")]
    MisroutedRating { user_id: UserId, expected: usize },

    #[error("duplicate end marker from source partition {source_partition}")]
    DuplicateEndMarker { source_partition: usize },

    #[error("end marker from unknown source partition {source_partition} (read parallelism {read_parallelism})")]
    UnknownSource {
        source_partition: usize,
        read_parallelism: usize,
    },

    #[error("end marker addressed to worker {target_worker}")]
    MisroutedEndMarker { target_worker: usize },

    #[error("pull answer for item {item_id} has no pending request")]
    UnmatchedPullAnswer { item_id: ItemId },

    #[error("pull answer for item {item_id} carries ticket {actual}, expected {expected}")]
    OutOfOrderPullAnswer {
        item_id: ItemId,
        expected: u64,
        actual: u64,
    },

    #[error("factor dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("server partition {0} is no longer accepting requests")]
    ServerClosed(usize),

    #[error("worker {0} is no longer accepting pull answers")]
    WorkerClosed(usize),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServerError {
    #[error("delta for item {item_id} has {actual} factors, expected {expected}")]
    DimensionMismatch {
        item_id: ItemId,
        expected: usize,
        actual: usize,
    },
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("protocol violation on worker {worker_id}: {violation}")]
    Protocol {
        worker_id: usize,
        violation: ProtocolViolation,
    },

    #[error("transport error on worker {worker_id}: {source}")]
    Transport {
        worker_id: usize,
        #[source]
        source: TransportError,
    },

    #[error("worker {0} was cancelled")]
    Cancelled(usize),

    #[error("worker {worker_id} still had {outstanding} pulls in flight after {waited:?}")]
    DrainTimeout {
        worker_id: usize,
        outstanding: usize,
        waited: Duration,
    },

    #[error("worker {worker_id} failed to spawn its training thread: {source}")]
    Spawn {
        worker_id: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("worker {0} has not launched its training thread")]
    NotLaunched(usize),

    #[error("training thread of worker {0} panicked")]
    Panicked(usize),
}

impl WorkerError {
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, WorkerError::Protocol { .. })
    }

    pub fn violation(&self) -> Option<&ProtocolViolation> {
        match self {
            WorkerError::Protocol { violation, .. } => Some(violation),
            _ => None,
        }
    }
}
