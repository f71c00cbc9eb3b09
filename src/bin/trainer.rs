use anyhow::{Context, Result};
use clap::Parser;
use psmf::services::ingestion::read_ratings;
use psmf::{init_tracing, Config, TrainingJob, WorkerPolicy};
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Trains user and item factors against a parameter server", long_about = None)]
struct Args {
    #[arg(short, long, default_value = "config/default.toml")]
    config: String,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Ratings file, one `user,item,value` per line
    #[arg(short, long)]
    ratings: PathBuf,

    /// Where to write the JSON report; stdout when absent
    #[arg(short, long)]
    output: Option<PathBuf>,

    #[arg(long)]
    iterations: Option<usize>,

    #[arg(long)]
    pull_limit: Option<usize>,

    #[arg(long)]
    workers: Option<usize>,

    #[arg(long)]
    servers: Option<usize>,

    #[arg(long)]
    sources: Option<usize>,

    #[arg(long, value_parser = parse_policy)]
    policy: Option<WorkerPolicy>,
}

fn parse_policy(value: &str) -> Result<WorkerPolicy, String> {
    match value {
        "per_rating" | "per-rating" => Ok(WorkerPolicy::PerRating),
        "per_item" | "per-item" => Ok(WorkerPolicy::PerItem),
        other => Err(format!("unknown policy {:?}, expected per_rating or per_item", other)),
    }
}

impl Args {
    fn apply_overrides(&self, config: &mut Config) {
        if let Some(iterations) = self.iterations {
            config.training.iterations = iterations;
        }
        if let Some(pull_limit) = self.pull_limit {
            config.training.pull_limit = pull_limit;
        }
        if let Some(policy) = self.policy {
            config.training.policy = policy;
        }
        if let Some(workers) = self.workers {
            config.cluster.worker_parallelism = workers;
        }
        if let Some(servers) = self.servers {
            config.cluster.server_parallelism = servers;
        }
        if let Some(sources) = self.sources {
            config.cluster.read_parallelism = sources;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level);

    info!("Starting psmf trainer");

    let mut config = if std::path::Path::new(&args.config).exists() {
        Config::from_file(&args.config)?
    } else {
        info!("Config file not found, using default configuration");
        Config::default()
    };
    args.apply_overrides(&mut config);
    info!("Training configuration: {:?}", config.training);

    let ratings = read_ratings(&args.ratings)?;
    let job = TrainingJob::new(config)?;

    let cancel = job.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling training");
            cancel.cancel();
        }
    });

    let report = job.run(ratings).await?;
    info!(
        "Trained {} users and {} items, rmse {:.4}",
        report.user_vectors.len(),
        report.item_vectors.len(),
        report.rmse()
    );

    let json = serde_json::to_string_pretty(&report)?;
    match &args.output {
        Some(path) => std::fs::write(path, json)
            .with_context(|| format!("Failed to write report to {}", path.display()))?,
        None => println!("{}", json),
    }

    Ok(())
}
