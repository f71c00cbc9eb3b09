use crate::models::FactorVector;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Produces the initial latent vector for a key the first time it is seen.
///
/// Shared between threads, so implementations must be `Send + Sync`.
pub trait FactorInitializer: Send + Sync {
    fn init(&self, key: i64) -> FactorVector;

    fn dimension(&self) -> usize;
}

pub fn xavier_uniform<R: Rng + ?Sized>(rng: &mut R, size: usize) -> Vec<f64> {
    let limit = (6.0 / size as f64).sqrt();
    (0..size).map(|_| rng.gen_range(-limit..limit)).collect()
}

pub fn uniform<R: Rng + ?Sized>(rng: &mut R, size: usize, low: f64, high: f64) -> Vec<f64> {
    (0..size).map(|_| rng.gen_range(low..high)).collect()
}

pub fn normal<R: Rng + ?Sized>(rng: &mut R, size: usize, mean: f64, std_dev: f64) -> Vec<f64> {
    (0..size)
        .map(|_| {
            // Box-Muller; 1 - u keeps the log argument in (0, 1].
            let u1: f64 = 1.0 - rng.gen::<f64>();
            let u2: f64 = rng.gen();
            let z0 = (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos();
            z0 * std_dev + mean
        })
        .collect()
}

pub fn zeros(size: usize) -> Vec<f64> {
    vec![0.0; size]
}

pub fn constant(size: usize, value: f64) -> Vec<f64> {
    vec![value; size]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InitializationMethod {
    XavierUniform,
    Uniform { low: f64, high: f64 },
    Normal { mean: f64, std_dev: f64 },
    Zeros,
    Constant { value: f64 },
}

impl Default for InitializationMethod {
    fn default() -> Self {
        InitializationMethod::Uniform {
            low: -0.01,
            high: 0.01,
        }
    }
}

impl InitializationMethod {
    pub fn initialize<R: Rng + ?Sized>(&self, rng: &mut R, size: usize) -> Vec<f64> {
        match self {
            InitializationMethod::XavierUniform => xavier_uniform(rng, size),
            InitializationMethod::Uniform { low, high } => uniform(rng, size, *low, *high),
            InitializationMethod::Normal { mean, std_dev } => normal(rng, size, *mean, *std_dev),
            InitializationMethod::Zeros => zeros(size),
            InitializationMethod::Constant { value } => constant(size, *value),
        }
    }
}

/// Deterministic per-key initializer: the same `(seed, key)` always yields the same vector.
#[derive(Debug, Clone)]
pub struct KeyedInitializer {
    method: InitializationMethod,
    dimension: usize,
    seed: u64,
}

impl KeyedInitializer {
    pub fn new(method: InitializationMethod, dimension: usize, seed: u64) -> Self {
        Self {
            method,
            dimension,
            seed,
        }
    }

    pub fn zeros(dimension: usize) -> Self {
        Self::new(InitializationMethod::Zeros, dimension, 0)
    }

    pub fn method(&self) -> &InitializationMethod {
        &self.method
    }

    fn rng_for(&self, key: i64) -> StdRng {
        // splitmix64 finalizer so neighbouring keys get unrelated streams
        let mut z = self.seed ^ (key as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        StdRng::seed_from_u64(z ^ (z >> 31))
    }
}

impl FactorInitializer for KeyedInitializer {
    fn init(&self, key: i64) -> FactorVector {
        let mut rng = self.rng_for(key);
        FactorVector::from_vec(self.method.initialize(&mut rng, self.dimension))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
