//! Server side of the parameter server: item vectors, lazily initialized and
//! updated only by adding deltas.

use crate::algorithms::FactorInitializer;
use crate::error::ServerError;
use crate::models::{FactorVector, ItemId, PullAnswer};
use crate::services::transport::{AnswerRouter, LocalClient, ServerMessage};
use anyhow::{anyhow, Result};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Item vectors held by one server partition.
pub struct ServerStore {
    partition: usize,
    vectors: DashMap<ItemId, FactorVector>,
    initializer: Arc<dyn FactorInitializer>,
    pulls: AtomicU64,
    pushes: AtomicU64,
}

impl ServerStore {
    pub fn new(partition: usize, initializer: Arc<dyn FactorInitializer>) -> Self {
        Self {
            partition,
            vectors: DashMap::new(),
            initializer,
            pulls: AtomicU64::new(0),
            pushes: AtomicU64::new(0),
        }
    }

    pub fn partition(&self) -> usize {
        self.partition
    }

    pub fn dimension(&self) -> usize {
        self.initializer.dimension()
    }

    /// Current vector for `key`, created through the initializer on first access.
    pub fn pull(&self, key: ItemId) -> FactorVector {
        self.pulls.fetch_add(1, Ordering::Relaxed);
        self.vectors
            .entry(key)
            .or_insert_with(|| self.initializer.init(key))
            .value()
            .clone()
    }

    /// `store[key] += delta`, initializing the entry first if it is absent.
    pub fn push(&self, key: ItemId, delta: &FactorVector) -> Result<(), ServerError> {
        let expected = self.dimension();
        if delta.len() != expected {
            return Err(ServerError::DimensionMismatch {
                item_id: key,
                expected,
                actual: delta.len(),
            });
        }

        let mut entry = self
            .vectors
            .entry(key)
            .or_insert_with(|| self.initializer.init(key));
        *entry += delta;
        self.pushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn get(&self, key: ItemId) -> Option<FactorVector> {
        self.vectors.get(&key).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    pub fn snapshot(&self) -> HashMap<ItemId, FactorVector> {
        self.vectors
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            partition: self.partition,
            items: self.len(),
            pulls: self.pulls.load(Ordering::Relaxed),
            pushes: self.pushes.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ServerStats {
    pub partition: usize,
    pub items: usize,
    pub pulls: u64,
    pub pushes: u64,
}

/// In-process server cluster: one task per partition, each draining its inbox in order.
///
/// A key always maps to the same partition and a partition handles its inbox
/// strictly sequentially, so answers for one key leave in the order the pulls
/// arrived.
pub struct ParameterServer {
    partitions: Vec<UnboundedSender<ServerMessage>>,
    stores: Vec<Arc<ServerStore>>,
    tasks: Vec<JoinHandle<()>>,
}

impl ParameterServer {
    pub fn start(
        server_parallelism: usize,
        initializer: Arc<dyn FactorInitializer>,
        answers: AnswerRouter,
    ) -> Self {
        let mut partitions = Vec::with_capacity(server_parallelism);
        let mut stores = Vec::with_capacity(server_parallelism);
        let mut tasks = Vec::with_capacity(server_parallelism);

        for partition in 0..server_parallelism {
            let (tx, rx) = mpsc::unbounded_channel();
            let store = Arc::new(ServerStore::new(partition, initializer.clone()));
            let task_store = store.clone();
            let task_answers = answers.clone();
            tasks.push(tokio::spawn(async move {
                serve_partition(task_store, rx, task_answers).await;
            }));
            partitions.push(tx);
            stores.push(store);
        }

        info!("Started {} server partitions", server_parallelism);

        Self {
            partitions,
            stores,
            tasks,
        }
    }

    pub fn client(&self, worker_id: usize) -> LocalClient {
        LocalClient::new(worker_id, self.partitions.clone())
    }

    pub fn stores(&self) -> &[Arc<ServerStore>] {
        &self.stores
    }

    /// Stops every partition after the messages already queued ahead of the
    /// shutdown request have been applied, and returns the stores.
    pub async fn shutdown(self) -> Result<Vec<Arc<ServerStore>>> {
        for partition in &self.partitions {
            // a partition that already stopped has nothing left to apply
            let _ = partition.send(ServerMessage::Shutdown);
        }

        for (partition, task) in self.tasks.into_iter().enumerate() {
            task.await
                .map_err(|e| anyhow!("Server partition {} task failed: {}", partition, e))?;
        }

        Ok(self.stores)
    }
}

async fn serve_partition(
    store: Arc<ServerStore>,
    mut inbox: UnboundedReceiver<ServerMessage>,
    answers: AnswerRouter,
) {
    while let Some(message) = inbox.recv().await {
        match message {
            ServerMessage::Pull(request) => {
                let vector = store.pull(request.item_id);
                if let Err(e) = answers.deliver(PullAnswer::new(&request, vector)) {
                    error!(partition = store.partition(), "Failed to deliver pull answer: {}", e);
                }
            }
            ServerMessage::Push(request) => {
                if let Err(e) = store.push(request.item_id, &request.delta) {
                    error!(partition = store.partition(), "Rejected push: {}", e);
                }
            }
            ServerMessage::Shutdown => break,
        }
    }

    debug!(
        partition = store.partition(),
        items = store.len(),
        "Server partition stopped"
    );
}
