//! Record routing and the end-of-input barrier.
//!
//! Ratings reach the worker that owns their user (`|user mod workers|`). A
//! source partition that runs dry sends one end marker to every worker; a
//! worker's input is complete once it holds one marker from each source.

use crate::error::ProtocolViolation;
use crate::models::{EndMarker, Rating, Record, UserId};
use crate::services::worker::WorkerPartition;
use crate::utils::partition_for;
use crate::utils::validation::validate_rating;
use anyhow::{anyhow, Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Counts end markers, one per source partition.
#[derive(Debug, Clone)]
pub struct EndOfInputBarrier {
    seen: Vec<bool>,
    received: usize,
}

impl EndOfInputBarrier {
    pub fn new(read_parallelism: usize) -> Self {
        Self {
            seen: vec![false; read_parallelism],
            received: 0,
        }
    }

    /// Registers a marker from `source_partition`; returns `true` when this
    /// marker completes the barrier.
    pub fn register(&mut self, source_partition: usize) -> Result<bool, ProtocolViolation> {
        let read_parallelism = self.seen.len();
        let seen = self
            .seen
            .get_mut(source_partition)
            .ok_or(ProtocolViolation::UnknownSource {
                source_partition,
                read_parallelism,
            })?;

        if *seen {
            return Err(ProtocolViolation::DuplicateEndMarker { source_partition });
        }

        *seen = true;
        self.received += 1;
        Ok(self.is_complete())
    }

    pub fn is_complete(&self) -> bool {
        self.received == self.seen.len()
    }

    pub fn received(&self) -> usize {
        self.received
    }

    pub fn expected(&self) -> usize {
        self.seen.len()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Partitioner {
    worker_parallelism: usize,
}

impl Partitioner {
    pub fn new(worker_parallelism: usize) -> Self {
        Self { worker_parallelism }
    }

    pub fn worker_for(&self, user_id: UserId) -> usize {
        partition_for(user_id, self.worker_parallelism)
    }

    pub fn worker_parallelism(&self) -> usize {
        self.worker_parallelism
    }
}

/// One upstream partition of the rating stream.
pub struct SourcePartition {
    id: usize,
    ratings: Vec<Rating>,
}

impl SourcePartition {
    pub fn new(id: usize, ratings: Vec<Rating>) -> Self {
        Self { id, ratings }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn len(&self) -> usize {
        self.ratings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ratings.is_empty()
    }

    /// Deals `ratings` round-robin into `read_parallelism` sources.
    pub fn split(ratings: Vec<Rating>, read_parallelism: usize) -> Vec<SourcePartition> {
        let mut buckets: Vec<Vec<Rating>> = (0..read_parallelism)
            .map(|_| Vec::with_capacity(ratings.len() / read_parallelism + 1))
            .collect();
        for (i, rating) in ratings.into_iter().enumerate() {
            buckets[i % read_parallelism].push(rating);
        }

        buckets
            .into_iter()
            .enumerate()
            .map(|(id, ratings)| SourcePartition::new(id, ratings))
            .collect()
    }

    /// Delivers every rating to its owning worker, then an end marker to every
    /// worker.
    pub fn run(self, workers: &[Arc<WorkerPartition>]) -> Result<usize> {
        let partitioner = Partitioner::new(workers.len());
        let delivered = self.ratings.len();

        for rating in self.ratings {
            let worker = &workers[partitioner.worker_for(rating.user_id)];
            worker
                .on_record(Record::Rating(rating))
                .with_context(|| format!("Source {} failed to deliver a rating", self.id))?;
        }

        for (target_worker, worker) in workers.iter().enumerate() {
            worker
                .on_record(Record::EndOfInput(EndMarker::new(target_worker, self.id)))
                .with_context(|| format!("Source {} failed to deliver its end marker", self.id))?;
        }

        debug!(source = self.id, delivered, "Source partition exhausted");
        Ok(delivered)
    }
}

/// Reads `user,item,value` lines. Tabs or whitespace also separate fields;
/// blank lines and `#` comments are skipped.
pub fn parse_ratings(contents: &str) -> Result<Vec<Rating>> {
    let mut ratings = Vec::new();

    for (index, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let line_number = index + 1;
        let fields: Vec<&str> = line
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|field| !field.is_empty())
            .collect();
        if fields.len() < 3 {
            return Err(anyhow!(
                "Line {}: expected user, item and value, got {:?}",
                line_number,
                line
            ));
        }

        let user_id = fields[0]
            .parse()
            .with_context(|| format!("Line {}: invalid user id {:?}", line_number, fields[0]))?;
        let item_id = fields[1]
            .parse()
            .with_context(|| format!("Line {}: invalid item id {:?}", line_number, fields[1]))?;
        let value = fields[2]
            .parse()
            .with_context(|| format!("Line {}: invalid rating {:?}", line_number, fields[2]))?;

        let rating = Rating::new(user_id, item_id, value);
        validate_rating(&rating).with_context(|| format!("Line {}", line_number))?;
        ratings.push(rating);
    }

    Ok(ratings)
}

pub fn read_ratings(path: impl AsRef<Path>) -> Result<Vec<Rating>> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read ratings from {}", path.display()))?;
    let ratings = parse_ratings(&contents)?;
    info!("Loaded {} ratings from {}", ratings.len(), path.display());
    Ok(ratings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_barrier_completes_after_every_source() {
        let mut barrier = EndOfInputBarrier::new(3);
        assert_eq!(barrier.register(2), Ok(false));
        assert_eq!(barrier.register(0), Ok(false));
        assert!(!barrier.is_complete());
        assert_eq!(barrier.register(1), Ok(true));
        assert!(barrier.is_complete());
        assert_eq!(barrier.received(), 3);
    }

    #[test]
    fn test_barrier_rejects_duplicates() {
        let mut barrier = EndOfInputBarrier::new(2);
        barrier.register(1).unwrap();
        assert_eq!(
            barrier.register(1),
            Err(ProtocolViolation::DuplicateEndMarker {
                source_partition: 1
            })
        );
        assert_eq!(barrier.received(), 1);
    }

    #[test]
    fn test_barrier_rejects_unknown_source() {
        let mut barrier = EndOfInputBarrier::new(2);
        assert_eq!(
            barrier.register(2),
            Err(ProtocolViolation::UnknownSource {
                source_partition: 2,
                read_parallelism: 2
            })
        );
    }

    #[test]
    fn test_partitioner_routes_negative_users() {
        let partitioner = Partitioner::new(4);
        assert_eq!(partitioner.worker_for(6), 2);
        assert_eq!(partitioner.worker_for(-6), 2);
    }

    #[test]
    fn test_split_round_robin() {
        let ratings: Vec<Rating> = (0..5).map(|i| Rating::new(i, i, 1.0)).collect();
        let sources = SourcePartition::split(ratings, 2);
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].len(), 3);
        assert_eq!(sources[1].len(), 2);
        assert_eq!(sources[1].id(), 1);
    }

    #[test]
    fn test_split_more_sources_than_ratings() {
        let sources = SourcePartition::split(vec![Rating::new(1, 1, 1.0)], 3);
        assert_eq!(sources.len(), 3);
        assert!(sources[2].is_empty());
    }

    #[test]
    fn test_parse_ratings_formats() {
        let contents = "# user item rating\n1,10,5.0\n\n2\t10\t3.5\n-3 11 1\n";
        let ratings = parse_ratings(contents).unwrap();
        assert_eq!(
            ratings,
            vec![
                Rating::new(1, 10, 5.0),
                Rating::new(2, 10, 3.5),
                Rating::new(-3, 11, 1.0),
            ]
        );
    }

    #[test]
    fn test_parse_ratings_reports_line() {
        let err = parse_ratings("1,2,3\n1,x,3\n").unwrap_err();
        assert!(format!("{:#}", err).contains("Line 2"));

        let err = parse_ratings("1,2\n").unwrap_err();
        assert!(err.to_string().contains("Line 1"));

        assert!(parse_ratings("1,2,NaN\n").is_err());
    }
}
