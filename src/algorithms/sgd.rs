use crate::models::FactorVector;

/// Outcome of one SGD step on a single rating.
#[derive(Debug, Clone, PartialEq)]
pub struct SgdDeltas {
    pub prediction: f64,
    pub error: f64,
    /// Applied by the worker to its own user vector.
    pub user: FactorVector,
    /// Shipped to the server and added to the item vector there.
    pub item: FactorVector,
}

/// Plain SGD on the squared error of `dot(user, item)` against the rating.
#[derive(Debug, Clone, Copy)]
pub struct SgdUpdate {
    learning_rate: f64,
}

impl SgdUpdate {
    pub fn new(learning_rate: f64) -> Self {
        Self { learning_rate }
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    /// Both deltas are computed from the vectors as they were before the step.
    pub fn compute(&self, rating: f64, user: &FactorVector, item: &FactorVector) -> SgdDeltas {
        let prediction = predict(user, item);
        let error = rating - prediction;
        let step = self.learning_rate * error;

        SgdDeltas {
            prediction,
            error,
            user: item * step,
            item: user * step,
        }
    }
}

pub fn predict(user: &FactorVector, item: &FactorVector) -> f64 {
    user.dot(item)
}
