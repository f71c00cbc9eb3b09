pub mod metrics;
pub mod validation;

use crate::models::FactorVector;
use std::collections::HashMap;

/// Partition owning `key` among `parallelism` instances: `|key mod parallelism|`.
pub fn partition_for(key: i64, parallelism: usize) -> usize {
    debug_assert!(parallelism > 0);
    (key % parallelism as i64).unsigned_abs() as usize
}

pub fn to_plain_vectors(vectors: &HashMap<i64, FactorVector>) -> HashMap<i64, Vec<f64>> {
    vectors
        .iter()
        .map(|(key, vector)| (*key, vector.as_slice().to_vec()))
        .collect()
}
