use crate::algorithms::InitializationMethod;
use crate::models::WorkerPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub training: TrainingConfig,
    pub cluster: ClusterConfig,
    pub initializer: InitializerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub num_factors: usize,
    pub learning_rate: f64,
    pub iterations: usize,
    /// Maximum number of unanswered pulls per worker partition.
    pub pull_limit: usize,
    pub policy: WorkerPolicy,
    /// Grace period for outstanding pulls to be answered once dispatch is over.
    pub iteration_wait_time_ms: u64,
    /// Seeds the per-iteration shuffles; `None` draws fresh entropy.
    pub shuffle_seed: Option<u64>,
}

impl TrainingConfig {
    pub fn iteration_wait_time(&self) -> Duration {
        Duration::from_millis(self.iteration_wait_time_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Number of source partitions feeding every worker.
    pub read_parallelism: usize,
    pub worker_parallelism: usize,
    pub server_parallelism: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InitializerConfig {
    pub method: InitializationMethod,
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            num_factors: 10,
            learning_rate: 0.01,
            iterations: 10,
            pull_limit: 1000,
            policy: WorkerPolicy::PerRating,
            iteration_wait_time_ms: 20_000,
            shuffle_seed: None,
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            read_parallelism: 1,
            worker_parallelism: num_cpus::get(),
            server_parallelism: 1,
        }
    }
}

impl Default for InitializerConfig {
    fn default() -> Self {
        Self {
            method: InitializationMethod::default(),
            seed: 0x5eed,
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("PSMF").separator("__"))
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        crate::utils::validation::validate_config(self)
    }
}
