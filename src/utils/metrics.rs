use crate::models::{ItemId, Rating, UserId};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FitMetrics {
    pub rmse: f64,
    pub mae: f64,
    /// Ratings for which both factor vectors were available.
    pub evaluated: usize,
}

/// Error metrics of `dot(user, item)` against the observed ratings.
///
/// Ratings whose user or item vector is missing are skipped; with nothing to
/// evaluate both errors are zero.
pub fn fit_metrics(
    ratings: &[Rating],
    users: &HashMap<UserId, Vec<f64>>,
    items: &HashMap<ItemId, Vec<f64>>,
) -> FitMetrics {
    let (squared, absolute, evaluated) = ratings
        .par_iter()
        .filter_map(|rating| {
            let user = users.get(&rating.user_id)?;
            let item = items.get(&rating.item_id)?;
            let prediction: f64 = user.iter().zip(item.iter()).map(|(u, v)| u * v).sum();
            let error = rating.value - prediction;
            Some((error * error, error.abs(), 1usize))
        })
        .reduce(|| (0.0, 0.0, 0), |a, b| (a.0 + b.0, a.1 + b.1, a.2 + b.2));

    if evaluated == 0 {
        return FitMetrics {
            rmse: 0.0,
            mae: 0.0,
            evaluated,
        };
    }

    FitMetrics {
        rmse: (squared / evaluated as f64).sqrt(),
        mae: absolute / evaluated as f64,
        evaluated,
    }
}

pub fn rmse(
    ratings: &[Rating],
    users: &HashMap<UserId, Vec<f64>>,
    items: &HashMap<ItemId, Vec<f64>>,
) -> f64 {
    fit_metrics(ratings, users, items).rmse
}
