pub mod algorithms;
pub mod config;
pub mod error;
pub mod models;
pub mod services;
pub mod utils;

pub use config::Config;
pub use error::{ProtocolViolation, ServerError, TransportError, WorkerError};
pub use models::*;
pub use services::job::{JobReport, TrainingJob};
pub use services::worker::{CancellationToken, WorkerPartition, WorkerPhase, WorkerSummary};

use tracing_subscriber::EnvFilter;

/// Installs the fmt subscriber. `RUST_LOG` wins over `default_level`; a
/// second call is a no-op.
pub fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
