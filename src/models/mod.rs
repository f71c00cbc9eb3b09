use nalgebra::DVector;
use serde::{Deserialize, Serialize};

pub type UserId = i64;
pub type ItemId = i64;

/// Latent factor vector of length `num_factors`.
pub type FactorVector = DVector<f64>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rating {
    pub user_id: UserId,
    pub item_id: ItemId,
    pub value: f64,
}

/// Sent by a source partition once it has no more ratings for `target_worker`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndMarker {
    pub target_worker: usize,
    pub source_partition: usize,
}

/// Element delivered to a worker partition by the ingestion runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Record {
    Rating(Rating),
    EndOfInput(EndMarker),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPolicy {
    /// One pull per rating, answers matched to the oldest pending rating of the item.
    #[default]
    PerRating,
    /// One pull per distinct item per iteration, answer applies every rating of the item.
    PerItem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PullTicket(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub worker_id: usize,
    pub item_id: ItemId,
    pub ticket: PullTicket,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PullAnswer {
    pub worker_id: usize,
    pub item_id: ItemId,
    pub ticket: PullTicket,
    pub vector: FactorVector,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PushRequest {
    pub item_id: ItemId,
    pub delta: FactorVector,
}

/// Output record: a user's vector right after an update was applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserVectorUpdate {
    pub user_id: UserId,
    pub vector: Vec<f64>,
}

impl Rating {
    pub fn new(user_id: UserId, item_id: ItemId, value: f64) -> Self {
        Self {
            user_id,
            item_id,
            value,
        }
    }
}

impl EndMarker {
    pub fn new(target_worker: usize, source_partition: usize) -> Self {
        Self {
            target_worker,
            source_partition,
        }
    }
}

impl From<Rating> for Record {
    fn from(rating: Rating) -> Self {
        Record::Rating(rating)
    }
}

impl From<EndMarker> for Record {
    fn from(marker: EndMarker) -> Self {
        Record::EndOfInput(marker)
    }
}

impl PullAnswer {
    pub fn new(request: &PullRequest, vector: FactorVector) -> Self {
        Self {
            worker_id: request.worker_id,
            item_id: request.item_id,
            ticket: request.ticket,
            vector,
        }
    }
}

impl UserVectorUpdate {
    pub fn new(user_id: UserId, vector: &FactorVector) -> Self {
        Self {
            user_id,
            vector: vector.as_slice().to_vec(),
        }
    }
}
