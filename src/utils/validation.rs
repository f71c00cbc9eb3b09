use crate::algorithms::InitializationMethod;
use crate::config::Config;
use crate::models::Rating;
use anyhow::{anyhow, Result};

pub fn validate_config(config: &Config) -> Result<()> {
    let training = &config.training;
    if training.num_factors == 0 {
        return Err(anyhow!("Number of factors must be greater than 0"));
    }

    if !training.learning_rate.is_finite() || training.learning_rate <= 0.0 {
        return Err(anyhow!("Learning rate must be a positive finite number"));
    }

    if training.pull_limit == 0 {
        return Err(anyhow!("Pull limit must be greater than 0"));
    }

    let cluster = &config.cluster;
    if cluster.read_parallelism == 0 {
        return Err(anyhow!("Read parallelism must be greater than 0"));
    }

    if cluster.worker_parallelism == 0 {
        return Err(anyhow!("Worker parallelism must be greater than 0"));
    }

    if cluster.server_parallelism == 0 {
        return Err(anyhow!("Server parallelism must be greater than 0"));
    }

    validate_initialization_method(&config.initializer.method)
}

pub fn validate_initialization_method(method: &InitializationMethod) -> Result<()> {
    match *method {
        InitializationMethod::Uniform { low, high } => {
            if !low.is_finite() || !high.is_finite() || low >= high {
                return Err(anyhow!(
                    "Uniform initializer needs finite bounds with low < high (got {low}..{high})"
                ));
            }
        }
        InitializationMethod::Normal { mean, std_dev } => {
            if !mean.is_finite() || !std_dev.is_finite() || std_dev < 0.0 {
                return Err(anyhow!(
                    "Normal initializer needs a finite mean and a non-negative std_dev"
                ));
            }
        }
        InitializationMethod::Constant { value } => {
            if !value.is_finite() {
                return Err(anyhow!("Constant initializer value must be finite"));
            }
        }
        InitializationMethod::XavierUniform | InitializationMethod::Zeros => {}
    }

    Ok(())
}

pub fn validate_rating(rating: &Rating) -> Result<()> {
    if !rating.value.is_finite() {
        return Err(anyhow!(
            "Rating value for ({}, {}) is not finite",
            rating.user_id,
            rating.item_id
        ));
    }

    Ok(())
}
