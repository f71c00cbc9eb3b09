//! Wires sources, worker partitions and the server cluster into one run.

use crate::algorithms::{FactorInitializer, KeyedInitializer};
use crate::config::Config;
use crate::error::WorkerError;
use crate::models::{ItemId, PullAnswer, Rating, UserId, UserVectorUpdate};
use crate::services::ingestion::SourcePartition;
use crate::services::server::{ParameterServer, ServerStats};
use crate::services::transport::AnswerRouter;
use crate::services::worker::{CancellationToken, WorkerPartition, WorkerSettings, WorkerSummary};
use crate::utils::metrics::{fit_metrics, FitMetrics};
use crate::utils::to_plain_vectors;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use futures::future::{join_all, try_join_all};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub workers: Vec<WorkerSummary>,
    pub servers: Vec<ServerStats>,
    /// User vector updates that reached the output channel.
    pub results_emitted: u64,
    pub user_vectors: HashMap<UserId, Vec<f64>>,
    pub item_vectors: HashMap<ItemId, Vec<f64>>,
    pub metrics: FitMetrics,
}

impl JobReport {
    pub fn rmse(&self) -> f64 {
        self.metrics.rmse
    }
}

#[derive(Debug)]
pub struct TrainingJob {
    config: Arc<Config>,
    cancel: CancellationToken,
}

impl TrainingJob {
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("Invalid training configuration")?;
        Ok(Self {
            config: Arc::new(config),
            cancel: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Token shared by every worker of this job; cancelling it stops training.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run(&self, ratings: Vec<Rating>) -> Result<JobReport> {
        let job_id = Uuid::new_v4();
        let started_at = Utc::now();
        let started = Instant::now();
        let cluster = &self.config.cluster;
        let dimension = self.config.training.num_factors;
        let seed = self.config.initializer.seed;

        info!(
            %job_id,
            ratings = ratings.len(),
            sources = cluster.read_parallelism,
            workers = cluster.worker_parallelism,
            servers = cluster.server_parallelism,
            "Starting training job"
        );

        let user_init: Arc<dyn FactorInitializer> = Arc::new(KeyedInitializer::new(
            self.config.initializer.method.clone(),
            dimension,
            seed,
        ));
        let item_init: Arc<dyn FactorInitializer> = Arc::new(KeyedInitializer::new(
            self.config.initializer.method.clone(),
            dimension,
            seed.wrapping_add(1),
        ));

        let mut answer_txs = Vec::with_capacity(cluster.worker_parallelism);
        let mut answer_rxs = Vec::with_capacity(cluster.worker_parallelism);
        for _ in 0..cluster.worker_parallelism {
            let (tx, rx) = mpsc::unbounded_channel::<PullAnswer>();
            answer_txs.push(tx);
            answer_rxs.push(rx);
        }
        let server = ParameterServer::start(
            cluster.server_parallelism,
            item_init,
            AnswerRouter::new(answer_txs),
        );

        let (result_tx, result_rx) = mpsc::unbounded_channel::<UserVectorUpdate>();
        let collector = tokio::spawn(count_results(result_rx));

        let settings = WorkerSettings::from_config(&self.config);
        let workers: Vec<Arc<WorkerPartition>> = (0..cluster.worker_parallelism)
            .map(|id| {
                WorkerPartition::new(
                    id,
                    settings.clone(),
                    user_init.clone(),
                    Box::new(server.client(id)),
                    Box::new(result_tx.clone()),
                    self.cancel.clone(),
                )
            })
            .collect();
        drop(result_tx);

        let answer_loops: Vec<JoinHandle<()>> = workers
            .iter()
            .cloned()
            .zip(answer_rxs)
            .map(|(worker, rx)| tokio::task::spawn_blocking(move || dispatch_answers(worker, rx)))
            .collect();

        let ingested = self.ingest(&ratings, &workers).await;
        if let Err(e) = &ingested {
            error!(%job_id, "Ingestion failed: {:#}", e);
            for worker in &workers {
                worker.cancel();
            }
        }

        let outcomes = join_all(workers.iter().cloned().map(|worker| {
            tokio::task::spawn_blocking(move || worker.join())
        }))
        .await;

        let stores = server.shutdown().await?;
        try_join_all(answer_loops)
            .await
            .map_err(|e| anyhow!("Answer dispatch task failed: {}", e))?;

        let mut user_vectors = HashMap::new();
        for worker in &workers {
            user_vectors.extend(to_plain_vectors(&worker.user_vectors()));
        }
        drop(workers);
        let results_emitted = collector
            .await
            .map_err(|e| anyhow!("Result collector task failed: {}", e))?;

        ingested?;
        let mut summaries = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            let summary: Result<WorkerSummary, WorkerError> =
                outcome.map_err(|e| anyhow!("Worker join task failed: {}", e))?;
            summaries.push(summary?);
        }

        let mut item_vectors = HashMap::new();
        for store in &stores {
            item_vectors.extend(to_plain_vectors(&store.snapshot()));
        }
        let servers = stores.iter().map(|store| store.stats()).collect();
        let metrics = fit_metrics(&ratings, &user_vectors, &item_vectors);

        info!(
            %job_id,
            users = user_vectors.len(),
            items = item_vectors.len(),
            results_emitted,
            rmse = metrics.rmse,
            elapsed = ?started.elapsed(),
            "Training job finished"
        );

        Ok(JobReport {
            job_id,
            started_at,
            finished_at: Utc::now(),
            workers: summaries,
            servers,
            results_emitted,
            user_vectors,
            item_vectors,
            metrics,
        })
    }

    async fn ingest(&self, ratings: &[Rating], workers: &[Arc<WorkerPartition>]) -> Result<usize> {
        let sources = SourcePartition::split(ratings.to_vec(), self.config.cluster.read_parallelism);
        let handles: Vec<JoinHandle<Result<usize>>> = sources
            .into_iter()
            .map(|source| {
                let workers = workers.to_vec();
                tokio::task::spawn_blocking(move || source.run(&workers))
            })
            .collect();

        let delivered = try_join_all(handles)
            .await
            .map_err(|e| anyhow!("Source task failed: {}", e))?
            .into_iter()
            .sum::<Result<usize>>()?;

        debug!(delivered, "All sources exhausted");
        Ok(delivered)
    }
}

/// Feeds one worker's pull answers until the server side closes the channel.
fn dispatch_answers(worker: Arc<WorkerPartition>, mut answers: UnboundedReceiver<PullAnswer>) {
    let mut failed = false;
    while let Some(answer) = answers.blocking_recv() {
        if let Err(e) = worker.on_pull_answer(answer) {
            if !failed {
                warn!(worker = worker.id(), "Dropping pull answers after failure: {}", e);
                failed = true;
            }
        }
    }
}

async fn count_results(mut results: UnboundedReceiver<UserVectorUpdate>) -> u64 {
    let mut count = 0;
    while results.recv().await.is_some() {
        count += 1;
    }
    count
}
