//! Worker partition: buffers its users' ratings until every source has
//! finished, then trains them against the parameter server from a dedicated
//! thread while pull answers arrive on other threads.
//!
//! All mutable state sits behind one mutex. The condition variable paired with
//! it carries two signals: "a pull slot freed up" for the training thread
//! blocked on the pull limit, and "nothing is in flight any more" for the
//! drain at the end of an iteration or of the run.

use crate::algorithms::{FactorInitializer, SgdUpdate};
use crate::config::Config;
use crate::error::{ProtocolViolation, TransportError, WorkerError};
use crate::models::{
    EndMarker, FactorVector, ItemId, PullAnswer, PullRequest, PullTicket, PushRequest, Rating,
    Record, UserId, UserVectorUpdate, WorkerPolicy,
};
use crate::services::ingestion::{EndOfInputBarrier, Partitioner};
use crate::services::transport::{ParameterServerClient, ResultSink};
use parking_lot::{Condvar, Mutex, MutexGuard};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Upper bound on how long a blocked wait goes without re-checking the
/// cancellation token.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPhase {
    Buffering,
    Training,
    Draining,
    Done,
    Failed,
    Cancelled,
}

/// Shared cancellation flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub num_factors: usize,
    pub learning_rate: f64,
    pub iterations: usize,
    pub pull_limit: usize,
    pub policy: WorkerPolicy,
    pub read_parallelism: usize,
    pub worker_parallelism: usize,
    pub drain_timeout: Duration,
    pub shuffle_seed: Option<u64>,
}

impl WorkerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            num_factors: config.training.num_factors,
            learning_rate: config.training.learning_rate,
            iterations: config.training.iterations,
            pull_limit: config.training.pull_limit,
            policy: config.training.policy,
            read_parallelism: config.cluster.read_parallelism,
            worker_parallelism: config.cluster.worker_parallelism,
            drain_timeout: config.training.iteration_wait_time(),
            shuffle_seed: config.training.shuffle_seed,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSummary {
    pub worker_id: usize,
    pub ratings: usize,
    pub users: usize,
    pub iterations_completed: usize,
    pub pulls_issued: u64,
    pub answers_processed: u64,
    pub pushes_sent: u64,
    pub results_emitted: u64,
    pub max_in_flight: usize,
}

/// What a pull was issued for; dequeued by the matching answer.
#[derive(Debug, Clone, Copy)]
enum PendingWork {
    Rating { user_id: UserId, value: f64 },
    Batch,
}

#[derive(Debug, Clone, Copy)]
struct PendingPull {
    ticket: PullTicket,
    work: PendingWork,
}

#[derive(Debug, Clone)]
enum Failure {
    Protocol(ProtocolViolation),
    Transport(TransportError),
}

struct WorkerState {
    phase: WorkerPhase,
    barrier: EndOfInputBarrier,
    ratings: Vec<Rating>,
    /// Ratings grouped by item for the per-item policy, fixed once training starts.
    batches: BTreeMap<ItemId, Vec<(UserId, f64)>>,
    pending: HashMap<ItemId, VecDeque<PendingPull>>,
    user_vectors: HashMap<UserId, FactorVector>,
    in_flight: usize,
    next_ticket: u64,
    client: Box<dyn ParameterServerClient>,
    sink: Box<dyn ResultSink>,
    rng: StdRng,
    failure: Option<Failure>,
    summary: WorkerSummary,
}

/// Shuffle stream of worker `id`; every shuffle the worker makes draws from it.
fn worker_rng(shuffle_seed: Option<u64>, id: usize) -> StdRng {
    match shuffle_seed {
        Some(seed) => StdRng::seed_from_u64(seed ^ ((id as u64) << 32) ^ 0xA5A5),
        None => StdRng::from_entropy(),
    }
}

pub struct WorkerPartition {
    id: usize,
    settings: WorkerSettings,
    sgd: SgdUpdate,
    initializer: Arc<dyn FactorInitializer>,
    partitioner: Partitioner,
    cancel: CancellationToken,
    state: Mutex<WorkerState>,
    changed: Condvar,
    training: Mutex<Option<JoinHandle<Result<WorkerSummary, WorkerError>>>>,
}

impl WorkerPartition {
    pub fn new(
        id: usize,
        settings: WorkerSettings,
        initializer: Arc<dyn FactorInitializer>,
        client: Box<dyn ParameterServerClient>,
        sink: Box<dyn ResultSink>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            sgd: SgdUpdate::new(settings.learning_rate),
            partitioner: Partitioner::new(settings.worker_parallelism),
            state: Mutex::new(WorkerState {
                phase: WorkerPhase::Buffering,
                barrier: EndOfInputBarrier::new(settings.read_parallelism),
                ratings: Vec::new(),
                batches: BTreeMap::new(),
                pending: HashMap::new(),
                user_vectors: HashMap::new(),
                in_flight: 0,
                next_ticket: 0,
                client,
                sink,
                rng: worker_rng(settings.shuffle_seed, id),
                failure: None,
                summary: WorkerSummary {
                    worker_id: id,
                    ..WorkerSummary::default()
                },
            }),
            settings,
            initializer,
            cancel,
            changed: Condvar::new(),
            training: Mutex::new(None),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn phase(&self) -> WorkerPhase {
        self.state.lock().phase
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }

    pub fn summary(&self) -> WorkerSummary {
        let state = self.state.lock();
        let mut summary = state.summary.clone();
        summary.users = state.user_vectors.len();
        summary
    }

    pub fn user_vectors(&self) -> HashMap<UserId, FactorVector> {
        self.state.lock().user_vectors.clone()
    }

    /// Ingestion callback. Never blocks beyond the state lock; launches the
    /// training thread when the last expected end marker arrives.
    pub fn on_record(self: &Arc<Self>, record: Record) -> Result<(), WorkerError> {
        let launch = {
            let mut state = self.state.lock();
            self.check_failed(&state)?;
            match record {
                Record::Rating(rating) => {
                    self.buffer_rating(&mut state, rating)?;
                    false
                }
                Record::EndOfInput(marker) => self.register_end_marker(&mut state, marker)?,
            }
        };

        if launch {
            self.launch_training()?;
        }
        Ok(())
    }

    /// Pull-answer callback, invoked by the transport on any thread.
    pub fn on_pull_answer(&self, answer: PullAnswer) -> Result<(), WorkerError> {
        let mut state = self.state.lock();
        self.check_failed(&state)?;

        let result = self.apply_answer(&mut state, answer);
        state.in_flight = state.in_flight.saturating_sub(1);
        self.changed.notify_all();

        result.map_err(|failure| self.fail(&mut state, failure))
    }

    /// Cancels this worker and wakes its training thread if it is blocked.
    pub fn cancel(&self) {
        self.cancel.cancel();
        let _state = self.state.lock();
        self.changed.notify_all();
    }

    /// Waits for the training thread and returns its outcome.
    pub fn join(&self) -> Result<WorkerSummary, WorkerError> {
        let handle = self
            .training
            .lock()
            .take()
            .ok_or(WorkerError::NotLaunched(self.id))?;
        handle.join().map_err(|_| WorkerError::Panicked(self.id))?
    }

    fn buffer_rating(&self, state: &mut WorkerState, rating: Rating) -> Result<(), WorkerError> {
        if state.phase != WorkerPhase::Buffering {
            let violation = ProtocolViolation::RatingAfterBarrier {
                user_id: rating.user_id,
                item_id: rating.item_id,
            };
            return Err(self.fail(state, Failure::Protocol(violation)));
        }

        let expected = self.partitioner.worker_for(rating.user_id);
        if expected != self.id {
            let violation = ProtocolViolation::MisroutedRating {
                user_id: rating.user_id,
                expected,
            };
            return Err(self.fail(state, Failure::Protocol(violation)));
        }

        state.ratings.push(rating);
        Ok(())
    }

    fn register_end_marker(
        &self,
        state: &mut WorkerState,
        marker: EndMarker,
    ) -> Result<bool, WorkerError> {
        if marker.target_worker != self.id {
            let violation = ProtocolViolation::MisroutedEndMarker {
                target_worker: marker.target_worker,
            };
            return Err(self.fail(state, Failure::Protocol(violation)));
        }

        let complete = match state.barrier.register(marker.source_partition) {
            Ok(complete) => complete,
            Err(violation) => return Err(self.fail(state, Failure::Protocol(violation))),
        };

        if complete {
            info!(
                worker = self.id,
                ratings = state.ratings.len(),
                sources = state.barrier.expected(),
                "End of input reached, starting training"
            );
            state.phase = WorkerPhase::Training;
            state.summary.ratings = state.ratings.len();
            if self.settings.policy == WorkerPolicy::PerItem {
                let mut batches: BTreeMap<ItemId, Vec<(UserId, f64)>> = BTreeMap::new();
                for rating in &state.ratings {
                    batches
                        .entry(rating.item_id)
                        .or_default()
                        .push((rating.user_id, rating.value));
                }
                state.batches = batches;
            }
        } else {
            debug!(
                worker = self.id,
                received = state.barrier.received(),
                expected = state.barrier.expected(),
                "End marker received"
            );
        }

        Ok(complete)
    }

    fn launch_training(self: &Arc<Self>) -> Result<(), WorkerError> {
        let worker = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("psmf-train-{}", self.id))
            .spawn(move || worker.run_training())
            .map_err(|source| WorkerError::Spawn {
                worker_id: self.id,
                source,
            })?;

        *self.training.lock() = Some(handle);
        Ok(())
    }

    fn run_training(&self) -> Result<WorkerSummary, WorkerError> {
        let started = Instant::now();
        let outcome = self.train();

        match &outcome {
            Ok(summary) => info!(
                worker = self.id,
                pulls = summary.pulls_issued,
                results = summary.results_emitted,
                elapsed = ?started.elapsed(),
                "Training finished"
            ),
            Err(WorkerError::Cancelled(_)) => {
                warn!(worker = self.id, "Training cancelled");
                self.state.lock().phase = WorkerPhase::Cancelled;
            }
            Err(e) => {
                error!(worker = self.id, "Training aborted: {}", e);
                self.state.lock().phase = WorkerPhase::Failed;
            }
        }

        outcome
    }

    fn train(&self) -> Result<WorkerSummary, WorkerError> {
        let (mut order, items): (Vec<Rating>, Vec<ItemId>) = {
            let state = self.state.lock();
            (state.ratings.clone(), state.batches.keys().copied().collect())
        };

        for iteration in 0..self.settings.iterations {
            self.check_cancelled()?;
            debug!(worker = self.id, iteration, "Starting iteration");

            match self.settings.policy {
                WorkerPolicy::PerRating => {
                    order.shuffle(&mut self.state.lock().rng);
                    for rating in &order {
                        self.dispatch(
                            rating.item_id,
                            PendingWork::Rating {
                                user_id: rating.user_id,
                                value: rating.value,
                            },
                        )?;
                    }
                }
                WorkerPolicy::PerItem => {
                    for item_id in &items {
                        self.dispatch(*item_id, PendingWork::Batch)?;
                    }
                    self.wait_until_idle()?;
                }
            }

            self.state.lock().summary.iterations_completed = iteration + 1;
        }

        self.state.lock().phase = WorkerPhase::Draining;
        self.wait_until_idle()?;
        Ok(self.finish())
    }

    /// Blocks while the pull limit is reached, then registers and issues one pull.
    fn dispatch(&self, item_id: ItemId, work: PendingWork) -> Result<(), WorkerError> {
        let mut state = self.state.lock();
        while state.in_flight >= self.settings.pull_limit {
            self.check_failed(&state)?;
            self.check_cancelled()?;
            self.changed.wait_for(&mut state, CANCEL_POLL_INTERVAL);
        }
        self.check_failed(&state)?;
        self.check_cancelled()?;

        let ticket = PullTicket(state.next_ticket);
        state.next_ticket += 1;
        state
            .pending
            .entry(item_id)
            .or_default()
            .push_back(PendingPull { ticket, work });
        state.in_flight += 1;
        state.summary.pulls_issued += 1;
        state.summary.max_in_flight = state.summary.max_in_flight.max(state.in_flight);

        let request = PullRequest {
            worker_id: self.id,
            item_id,
            ticket,
        };
        if let Err(e) = state.client.pull(request) {
            return Err(self.fail(&mut state, Failure::Transport(e)));
        }
        Ok(())
    }

    /// Blocks until every issued pull has been answered.
    fn wait_until_idle(&self) -> Result<(), WorkerError> {
        let deadline = Instant::now() + self.settings.drain_timeout;
        let mut state = self.state.lock();

        while state.in_flight > 0 {
            self.check_failed(&state)?;
            self.check_cancelled()?;

            let now = Instant::now();
            if now >= deadline {
                return Err(WorkerError::DrainTimeout {
                    worker_id: self.id,
                    outstanding: state.in_flight,
                    waited: self.settings.drain_timeout,
                });
            }
            let wait = (deadline - now).min(CANCEL_POLL_INTERVAL);
            self.changed.wait_for(&mut state, wait);
        }

        self.check_failed(&state)
    }

    fn finish(&self) -> WorkerSummary {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if self.settings.policy == WorkerPolicy::PerItem {
            let mut users: Vec<_> = state.user_vectors.iter().collect();
            users.sort_by_key(|(user_id, _)| **user_id);
            for (user_id, vector) in users {
                state.sink.emit(UserVectorUpdate::new(*user_id, vector));
                state.summary.results_emitted += 1;
            }
        }

        state.phase = WorkerPhase::Done;
        state.summary.users = state.user_vectors.len();
        state.summary.clone()
    }

    fn apply_answer(&self, state: &mut WorkerState, answer: PullAnswer) -> Result<(), Failure> {
        let item_id = answer.item_id;
        let pending = state
            .pending
            .get_mut(&item_id)
            .and_then(|queue| queue.pop_front())
            .ok_or(Failure::Protocol(ProtocolViolation::UnmatchedPullAnswer {
                item_id,
            }))?;

        if pending.ticket != answer.ticket {
            return Err(Failure::Protocol(ProtocolViolation::OutOfOrderPullAnswer {
                item_id,
                expected: pending.ticket.0,
                actual: answer.ticket.0,
            }));
        }

        if answer.vector.len() != self.settings.num_factors {
            return Err(Failure::Protocol(ProtocolViolation::DimensionMismatch {
                expected: self.settings.num_factors,
                actual: answer.vector.len(),
            }));
        }

        if state.pending.get(&item_id).is_some_and(VecDeque::is_empty) {
            state.pending.remove(&item_id);
        }
        state.summary.answers_processed += 1;

        match pending.work {
            PendingWork::Rating { user_id, value } => {
                self.apply_rating(state, user_id, item_id, value, &answer.vector, true)?;
            }
            PendingWork::Batch => {
                let mut batch = state.batches.get(&item_id).cloned().unwrap_or_default();
                batch.shuffle(&mut state.rng);
                let mut item = answer.vector;
                for (user_id, value) in batch {
                    let delta = self.apply_rating(state, user_id, item_id, value, &item, false)?;
                    item += &delta;
                }
            }
        }

        Ok(())
    }

    /// One SGD step: updates the local user vector, optionally emits it, and
    /// pushes the item delta. Returns the item delta.
    fn apply_rating(
        &self,
        state: &mut WorkerState,
        user_id: UserId,
        item_id: ItemId,
        value: f64,
        item: &FactorVector,
        emit: bool,
    ) -> Result<FactorVector, Failure> {
        let WorkerState {
            user_vectors,
            client,
            sink,
            summary,
            ..
        } = state;

        let user = user_vectors
            .entry(user_id)
            .or_insert_with(|| self.initializer.init(user_id));
        let deltas = self.sgd.compute(value, user, item);
        *user += &deltas.user;

        if emit {
            sink.emit(UserVectorUpdate::new(user_id, user));
            summary.results_emitted += 1;
        }

        client
            .push(PushRequest {
                item_id,
                delta: deltas.item.clone(),
            })
            .map_err(Failure::Transport)?;
        summary.pushes_sent += 1;

        Ok(deltas.item)
    }

    /// Records the first failure, moves to `Failed` and wakes every waiter.
    fn fail(&self, state: &mut WorkerState, failure: Failure) -> WorkerError {
        error!(worker = self.id, "Worker partition failed: {:?}", failure);
        if state.failure.is_none() {
            state.failure = Some(failure.clone());
        }
        state.phase = WorkerPhase::Failed;
        self.changed.notify_all();
        self.to_error(failure)
    }

    fn check_failed(&self, state: &MutexGuard<'_, WorkerState>) -> Result<(), WorkerError> {
        match &state.failure {
            Some(failure) => Err(self.to_error(failure.clone())),
            None => Ok(()),
        }
    }

    fn check_cancelled(&self) -> Result<(), WorkerError> {
        if self.cancel.is_cancelled() {
            Err(WorkerError::Cancelled(self.id))
        } else {
            Ok(())
        }
    }

    fn to_error(&self, failure: Failure) -> WorkerError {
        match failure {
            Failure::Protocol(violation) => WorkerError::Protocol {
                worker_id: self.id,
                violation,
            },
            Failure::Transport(source) => WorkerError::Transport {
                worker_id: self.id,
                source,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::{InitializationMethod, KeyedInitializer};
    use crate::services::server::ServerStore;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    #[derive(Clone, Default)]
    struct RecordingClient {
        pulls: Arc<Mutex<Vec<PullRequest>>>,
        pushes: Arc<Mutex<Vec<PushRequest>>>,
    }

    impl ParameterServerClient for RecordingClient {
        fn pull(&mut self, request: PullRequest) -> Result<(), TransportError> {
            self.pulls.lock().push(request);
            Ok(())
        }

        fn push(&mut self, request: PushRequest) -> Result<(), TransportError> {
            self.pushes.lock().push(request);
            Ok(())
        }
    }

    struct Harness {
        worker: Arc<WorkerPartition>,
        client: RecordingClient,
        results: UnboundedReceiver<UserVectorUpdate>,
        answered: usize,
        pushed: usize,
    }

    impl Harness {
        fn new(settings: WorkerSettings) -> Self {
            Self::with_initializer(settings, Arc::new(KeyedInitializer::zeros(2)))
        }

        fn with_initializer(settings: WorkerSettings, init: Arc<dyn FactorInitializer>) -> Self {
            let client = RecordingClient::default();
            let (tx, results) = mpsc::unbounded_channel();
            let worker = WorkerPartition::new(
                0,
                settings,
                init,
                Box::new(client.clone()),
                Box::new(tx),
                CancellationToken::new(),
            );
            Self {
                worker,
                client,
                results,
                answered: 0,
                pushed: 0,
            }
        }

        fn pulls(&self) -> Vec<PullRequest> {
            self.client.pulls.lock().clone()
        }

        fn feed(&self, ratings: &[Rating]) {
            for rating in ratings {
                self.worker.on_record(Record::Rating(*rating)).unwrap();
            }
        }

        fn end(&self, source: usize) -> Result<(), WorkerError> {
            self.worker
                .on_record(Record::EndOfInput(EndMarker::new(0, source)))
        }

        /// Answers every pull issued so far from `store` and applies the pushes.
        fn pump(&mut self, store: &ServerStore) {
            let pulls = self.pulls();
            for request in &pulls[self.answered..] {
                let vector = store.pull(request.item_id);
                self.worker
                    .on_pull_answer(PullAnswer::new(request, vector))
                    .unwrap();
            }
            self.answered = pulls.len();

            let pushes = self.client.pushes.lock().clone();
            for push in &pushes[self.pushed..] {
                store.push(push.item_id, &push.delta).unwrap();
            }
            self.pushed = pushes.len();
        }

        fn run_to_completion(&mut self, store: &ServerStore) -> WorkerSummary {
            let deadline = Instant::now() + Duration::from_secs(10);
            while self.worker.phase() != WorkerPhase::Done {
                assert!(Instant::now() < deadline, "worker did not finish");
                self.pump(store);
                thread::sleep(Duration::from_millis(1));
            }
            self.pump(store);
            self.worker.join().unwrap()
        }

        fn drain_results(&mut self) -> Vec<UserVectorUpdate> {
            let mut out = Vec::new();
            while let Ok(update) = self.results.try_recv() {
                out.push(update);
            }
            out
        }
    }

    fn settings(read_parallelism: usize, pull_limit: usize, policy: WorkerPolicy) -> WorkerSettings {
        WorkerSettings {
            num_factors: 2,
            learning_rate: 0.1,
            iterations: 1,
            pull_limit,
            policy,
            read_parallelism,
            worker_parallelism: 1,
            drain_timeout: Duration::from_secs(5),
            shuffle_seed: Some(17),
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        condition()
    }

    fn constant_store(value: f64) -> ServerStore {
        let init = KeyedInitializer::new(InitializationMethod::Constant { value }, 2, 0);
        ServerStore::new(0, Arc::new(init))
    }

    #[test]
    fn test_no_pull_before_every_source_finished() {
        let harness = Harness::new(settings(3, 10, WorkerPolicy::PerRating));
        harness.feed(&[Rating::new(1, 1, 5.0), Rating::new(2, 1, 3.0)]);

        harness.end(0).unwrap();
        harness.end(2).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(harness.worker.phase(), WorkerPhase::Buffering);
        assert!(harness.pulls().is_empty());
        assert!(matches!(
            harness.worker.join(),
            Err(WorkerError::NotLaunched(0))
        ));

        harness.end(1).unwrap();
        assert!(wait_until(|| harness.pulls().len() == 2));
    }

    #[test]
    fn test_duplicate_end_marker_is_fatal() {
        let harness = Harness::new(settings(2, 10, WorkerPolicy::PerRating));
        harness.end(1).unwrap();

        let err = harness.end(1).unwrap_err();
        assert_eq!(
            err.violation(),
            Some(&ProtocolViolation::DuplicateEndMarker {
                source_partition: 1
            })
        );
        assert_eq!(harness.worker.phase(), WorkerPhase::Failed);

        // later records keep failing with the recorded violation
        assert!(harness.end(0).unwrap_err().is_protocol_violation());
        assert!(harness.pulls().is_empty());
    }

    #[test]
    fn test_misrouted_end_marker_is_fatal() {
        let harness = Harness::new(settings(1, 10, WorkerPolicy::PerRating));
        let err = harness
            .worker
            .on_record(Record::EndOfInput(EndMarker::new(3, 0)))
            .unwrap_err();
        assert_eq!(
            err.violation(),
            Some(&ProtocolViolation::MisroutedEndMarker { target_worker: 3 })
        );
    }

    #[test]
    fn test_misrouted_rating_is_fatal() {
        let mut s = settings(1, 10, WorkerPolicy::PerRating);
        s.worker_parallelism = 2;
        let harness = Harness::new(s);

        let err = harness
            .worker
            .on_record(Record::Rating(Rating::new(3, 1, 1.0)))
            .unwrap_err();
        assert_eq!(
            err.violation(),
            Some(&ProtocolViolation::MisroutedRating {
                user_id: 3,
                expected: 1
            })
        );
    }

    #[test]
    fn test_rating_after_barrier_is_fatal() {
        let harness = Harness::new(settings(1, 10, WorkerPolicy::PerRating));
        harness.feed(&[Rating::new(1, 1, 5.0)]);
        harness.end(0).unwrap();

        let err = harness
            .worker
            .on_record(Record::Rating(Rating::new(2, 1, 1.0)))
            .unwrap_err();
        assert_eq!(
            err.violation(),
            Some(&ProtocolViolation::RatingAfterBarrier {
                user_id: 2,
                item_id: 1
            })
        );

        // the training thread observes the failure
        assert!(harness.worker.join().unwrap_err().is_protocol_violation());
        assert_eq!(harness.worker.phase(), WorkerPhase::Failed);
    }

    #[test]
    fn test_in_flight_pulls_never_exceed_limit() {
        let mut harness = Harness::new(settings(1, 3, WorkerPolicy::PerRating));
        let ratings: Vec<Rating> = (0..20).map(|i| Rating::new(i % 4, i % 5, 1.0)).collect();
        harness.feed(&ratings);
        harness.end(0).unwrap();

        assert!(wait_until(|| harness.pulls().len() == 3));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(harness.pulls().len(), 3);
        assert_eq!(harness.worker.in_flight(), 3);

        // one answer frees exactly one slot
        let first = harness.pulls()[0];
        harness
            .worker
            .on_pull_answer(PullAnswer::new(&first, FactorVector::from_vec(vec![0.1, 0.1])))
            .unwrap();
        harness.answered = 1;
        assert!(wait_until(|| harness.pulls().len() == 4));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(harness.pulls().len(), 4);

        let store = constant_store(0.1);
        let summary = harness.run_to_completion(&store);
        assert_eq!(summary.pulls_issued, 20);
        assert_eq!(summary.answers_processed, 20);
        assert!(summary.max_in_flight <= 3);
        assert_eq!(harness.worker.in_flight(), 0);
    }

    #[test]
    fn test_answers_match_oldest_pending_rating() {
        let mut harness = Harness::new(settings(1, 2, WorkerPolicy::PerRating));
        harness.feed(&[Rating::new(1, 7, 5.0), Rating::new(2, 7, 3.0)]);
        harness.end(0).unwrap();
        assert!(wait_until(|| harness.pulls().len() == 2));

        let pulls = harness.pulls();
        assert_eq!(pulls[0].item_id, 7);
        assert_eq!(pulls[1].item_id, 7);
        assert!(pulls[0].ticket < pulls[1].ticket);

        let store = constant_store(1.0);
        harness.run_to_completion(&store);

        // zero user vectors: the update is learning_rate * rating * item
        let users = harness.worker.user_vectors();
        assert!((users[&1][0] - 0.5).abs() < 1e-12);
        assert!((users[&2][0] - 0.3).abs() < 1e-12);

        let results = harness.drain_results();
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn test_out_of_order_answer_is_detected() {
        let harness = Harness::new(settings(1, 2, WorkerPolicy::PerRating));
        harness.feed(&[Rating::new(1, 7, 5.0), Rating::new(2, 7, 3.0)]);
        harness.end(0).unwrap();
        assert!(wait_until(|| harness.pulls().len() == 2));

        let second = harness.pulls()[1];
        let err = harness
            .worker
            .on_pull_answer(PullAnswer::new(&second, FactorVector::zeros(2)))
            .unwrap_err();
        assert_eq!(
            err.violation(),
            Some(&ProtocolViolation::OutOfOrderPullAnswer {
                item_id: 7,
                expected: 0,
                actual: 1
            })
        );
        assert!(harness.worker.join().unwrap_err().is_protocol_violation());
    }

    #[test]
    fn test_unmatched_answer_is_detected() {
        let harness = Harness::new(settings(1, 2, WorkerPolicy::PerRating));
        let stray = PullRequest {
            worker_id: 0,
            item_id: 99,
            ticket: PullTicket(0),
        };
        let err = harness
            .worker
            .on_pull_answer(PullAnswer::new(&stray, FactorVector::zeros(2)))
            .unwrap_err();
        assert_eq!(
            err.violation(),
            Some(&ProtocolViolation::UnmatchedPullAnswer { item_id: 99 })
        );
    }

    #[test]
    fn test_wrong_dimension_answer_is_detected() {
        let harness = Harness::new(settings(1, 2, WorkerPolicy::PerRating));
        harness.feed(&[Rating::new(1, 7, 5.0)]);
        harness.end(0).unwrap();
        assert!(wait_until(|| harness.pulls().len() == 1));

        let pull = harness.pulls()[0];
        let err = harness
            .worker
            .on_pull_answer(PullAnswer::new(&pull, FactorVector::zeros(3)))
            .unwrap_err();
        assert_eq!(
            err.violation(),
            Some(&ProtocolViolation::DimensionMismatch {
                expected: 2,
                actual: 3
            })
        );
    }

    #[test]
    fn test_per_rating_pushes_add_up_on_server() {
        let init = KeyedInitializer::new(InitializationMethod::default(), 2, 3);
        let mut s = settings(1, 4, WorkerPolicy::PerRating);
        s.iterations = 3;
        let mut harness = Harness::with_initializer(s, Arc::new(init.clone()));
        let ratings = [
            Rating::new(1, 1, 5.0),
            Rating::new(2, 1, 3.0),
            Rating::new(1, 2, 4.0),
        ];
        harness.feed(&ratings);
        harness.end(0).unwrap();

        let store = ServerStore::new(0, Arc::new(init.clone()));
        let summary = harness.run_to_completion(&store);
        assert_eq!(summary.pulls_issued, 9);
        assert_eq!(summary.pushes_sent, 9);
        assert_eq!(summary.results_emitted, 9);
        assert_eq!(summary.iterations_completed, 3);
        assert_eq!(harness.drain_results().len(), 9);

        let pushes = harness.client.pushes.lock().clone();
        for item in [1, 2] {
            let expected = pushes
                .iter()
                .filter(|p| p.item_id == item)
                .fold(init.init(item), |acc, p| acc + &p.delta);
            let actual = store.get(item).unwrap();
            assert!((actual - expected).norm() < 1e-12);
        }
    }

    #[test]
    fn test_per_item_policy_pulls_once_per_item() {
        let mut s = settings(1, 10, WorkerPolicy::PerItem);
        s.iterations = 2;
        let mut harness = Harness::new(s);
        harness.feed(&[
            Rating::new(1, 1, 5.0),
            Rating::new(2, 1, 3.0),
            Rating::new(1, 2, 4.0),
        ]);
        harness.end(0).unwrap();

        let store = constant_store(1.0);
        let summary = harness.run_to_completion(&store);
        assert_eq!(summary.pulls_issued, 4);
        assert_eq!(summary.pushes_sent, 6);

        // final vectors only, one per user
        let results = harness.drain_results();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].user_id, 1);
        assert_eq!(results[1].user_id, 2);
    }

    #[test]
    fn test_per_rating_order_follows_worker_shuffle_stream() {
        let mut s = settings(1, 100, WorkerPolicy::PerRating);
        s.iterations = 2;
        let mut harness = Harness::new(s);
        let ratings: Vec<Rating> = (0..10).map(|item| Rating::new(item, item, 1.0)).collect();
        harness.feed(&ratings);
        harness.end(0).unwrap();

        let store = constant_store(0.1);
        harness.run_to_completion(&store);

        let mut rng = worker_rng(Some(17), 0);
        let mut order = ratings.clone();
        let mut expected = Vec::new();
        for _ in 0..2 {
            order.shuffle(&mut rng);
            expected.extend(order.iter().map(|r| r.item_id));
        }
        let issued: Vec<ItemId> = harness.pulls().iter().map(|p| p.item_id).collect();
        assert_eq!(issued, expected);
    }

    #[test]
    fn test_cancel_unblocks_backpressure_wait() {
        let harness = Harness::new(settings(1, 1, WorkerPolicy::PerRating));
        harness.feed(&[Rating::new(1, 1, 1.0), Rating::new(1, 2, 1.0)]);
        harness.end(0).unwrap();
        assert!(wait_until(|| harness.pulls().len() == 1));

        harness.worker.cancel();
        assert!(matches!(
            harness.worker.join(),
            Err(WorkerError::Cancelled(0))
        ));
        assert_eq!(harness.worker.phase(), WorkerPhase::Cancelled);
        assert_eq!(harness.pulls().len(), 1);
    }

    #[test]
    fn test_unanswered_pulls_time_out() {
        let mut s = settings(1, 10, WorkerPolicy::PerRating);
        s.drain_timeout = Duration::from_millis(50);
        let harness = Harness::new(s);
        harness.feed(&[Rating::new(1, 1, 1.0)]);
        harness.end(0).unwrap();

        match harness.worker.join() {
            Err(WorkerError::DrainTimeout { outstanding, .. }) => assert_eq!(outstanding, 1),
            other => panic!("expected drain timeout, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_partition_finishes_immediately() {
        let harness = Harness::new(settings(2, 10, WorkerPolicy::PerRating));
        harness.end(0).unwrap();
        harness.end(1).unwrap();

        let summary = harness.worker.join().unwrap();
        assert_eq!(summary.pulls_issued, 0);
        assert_eq!(harness.worker.phase(), WorkerPhase::Done);
    }
}
