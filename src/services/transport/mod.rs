//! Pull/push plumbing between worker partitions and server partitions.
//!
//! A worker never calls its client concurrently: the client lives inside the
//! worker's mutex-guarded state, so implementations only need to be `Send`.

use crate::error::TransportError;
use crate::models::{PullAnswer, PullRequest, PushRequest, UserVectorUpdate};
use crate::utils::partition_for;
use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;

pub trait ParameterServerClient: Send {
    /// Requests the current vector of `request.item_id`. The answer arrives
    /// later through the worker's pull-answer handler.
    fn pull(&mut self, request: PullRequest) -> Result<(), TransportError>;

    /// Adds `request.delta` to the server's vector. No reply.
    fn push(&mut self, request: PushRequest) -> Result<(), TransportError>;
}

/// Downstream consumer of per-update user vectors.
pub trait ResultSink: Send {
    fn emit(&mut self, update: UserVectorUpdate);
}

#[derive(Debug)]
pub enum ServerMessage {
    Pull(PullRequest),
    Push(PushRequest),
    Shutdown,
}

/// Client routing requests over in-process channels to `|item mod n|`.
#[derive(Debug, Clone)]
pub struct LocalClient {
    worker_id: usize,
    partitions: Vec<UnboundedSender<ServerMessage>>,
}

impl LocalClient {
    pub fn new(worker_id: usize, partitions: Vec<UnboundedSender<ServerMessage>>) -> Self {
        Self {
            worker_id,
            partitions,
        }
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    fn send(&self, item_id: i64, message: ServerMessage) -> Result<(), TransportError> {
        let partition = partition_for(item_id, self.partitions.len());
        self.partitions[partition]
            .send(message)
            .map_err(|_| TransportError::ServerClosed(partition))
    }
}

impl ParameterServerClient for LocalClient {
    fn pull(&mut self, request: PullRequest) -> Result<(), TransportError> {
        self.send(request.item_id, ServerMessage::Pull(request))
    }

    fn push(&mut self, request: PushRequest) -> Result<(), TransportError> {
        self.send(request.item_id, ServerMessage::Push(request))
    }
}

/// Routes pull answers back to the worker that issued the pull.
#[derive(Debug, Clone)]
pub struct AnswerRouter {
    workers: Vec<UnboundedSender<PullAnswer>>,
}

impl AnswerRouter {
    pub fn new(workers: Vec<UnboundedSender<PullAnswer>>) -> Self {
        Self { workers }
    }

    pub fn deliver(&self, answer: PullAnswer) -> Result<(), TransportError> {
        let worker_id = answer.worker_id;
        self.workers
            .get(worker_id)
            .ok_or(TransportError::WorkerClosed(worker_id))?
            .send(answer)
            .map_err(|_| TransportError::WorkerClosed(worker_id))
    }
}

impl ResultSink for UnboundedSender<UserVectorUpdate> {
    fn emit(&mut self, update: UserVectorUpdate) {
        if self.send(update).is_err() {
            warn!("Result receiver dropped, discarding user vector update");
        }
    }
}

/// Sink that discards everything, for callers that only want final vectors.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ResultSink for NullSink {
    fn emit(&mut self, _update: UserVectorUpdate) {}
}
