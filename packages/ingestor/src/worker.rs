//! Retrying Parse Worker
//!
//! Runs one parse attempt per claimed job and decides what happens next:
//! - success: CREATED drafts are persisted, then announced; anything else is a no-op
//! - network failure: the job goes back to the queue with backoff
//! - anything else: the job is dropped and the failure logged
//!
//! Only transport failures are retried. A malformed request or a rejecting
//! server would fail the same way on every attempt.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::client::{ClientError, ParseService, ProtocolError};
use crate::message::{ParseJob, ParseResponse, ParseStatus};
use crate::notifier::EventNotifier;
use crate::queue::{JobQueue, QueueError};
use crate::store::{ResultStore, StoreError};

/// Attempts allowed per job before a network failure becomes terminal
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Initial retry delay in milliseconds
pub const INITIAL_BACKOFF_MS: u64 = 1_000;

/// Maximum retry delay in milliseconds
pub const MAX_BACKOFF_MS: u64 = 60_000;

/// Concurrent worker loops in a pool
pub const DEFAULT_WORKERS: usize = 4;

/// How long an idle worker waits on the queue before re-checking shutdown
pub const DEQUEUE_WAIT_MS: u64 = 1_000;

/// Pause after a queue failure before claiming again
const QUEUE_ERROR_BACKOFF_MS: u64 = 1_000;

/// Retry schedule for network failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay before the first retry in milliseconds
    pub initial_backoff_ms: u64,
    /// Delay cap in milliseconds
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff_ms: INITIAL_BACKOFF_MS,
            max_backoff_ms: MAX_BACKOFF_MS,
        }
    }
}

impl RetryPolicy {
    /// Calculate the delay before retrying after the given zero-based attempt
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let delay_ms = self
            .initial_backoff_ms
            .saturating_mul(2u64.pow(attempt.min(10)));
        Duration::from_millis(delay_ms.min(self.max_backoff_ms))
    }

    /// Whether a job that has made `attempts_made` attempts may try again
    pub fn allows_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

/// Lifecycle of a claimed job as seen by the worker
///
/// A queued job is pending until claimed; that state lives in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Running,
    Succeeded,
    RetryScheduled,
    Failed,
}

/// Terminal success of an attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Success {
    /// A new draft was stored and announced
    Created { unique_identifier: String },
    /// The service did not create a draft (e.g. DUPLICATE)
    NoOp { status: ParseStatus },
}

/// Why a job ended without success
#[derive(Error, Debug)]
pub enum JobFailure {
    #[error("Rejected by parsing service: {0}")]
    Rejected(ProtocolError),

    #[error("Gave up after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("Parsed but could not persist result: {0}")]
    Persist(#[from] StoreError),

    #[error("Parsed but could not encode result: {0}")]
    Encode(#[from] serde_json::Error),
}

impl JobFailure {
    /// Whether the remote parse itself succeeded
    pub fn is_local_fault(&self) -> bool {
        matches!(self, JobFailure::Persist(_) | JobFailure::Encode(_))
    }
}

/// Result of a single attempt
#[derive(Debug)]
pub enum AttemptOutcome {
    Succeeded(Success),
    RetryScheduled { next_attempt: u32, delay: Duration },
    Failed(JobFailure),
}

impl AttemptOutcome {
    /// State the job is in after this attempt
    pub fn state(&self) -> JobState {
        match self {
            AttemptOutcome::Succeeded(_) => JobState::Succeeded,
            AttemptOutcome::RetryScheduled { .. } => JobState::RetryScheduled,
            AttemptOutcome::Failed(_) => JobState::Failed,
        }
    }
}

/// Executes parse attempts and fans successful results out
pub struct ParseWorker<S> {
    service: Arc<S>,
    store: Arc<dyn ResultStore>,
    notifier: Arc<EventNotifier>,
    policy: RetryPolicy,
    dequeue_wait: Duration,
}

impl<S: ParseService> ParseWorker<S> {
    pub fn new(
        service: Arc<S>,
        store: Arc<dyn ResultStore>,
        notifier: Arc<EventNotifier>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            service,
            store,
            notifier,
            policy,
            dequeue_wait: Duration::from_millis(DEQUEUE_WAIT_MS),
        }
    }

    /// Override how long an idle loop waits on the queue
    pub fn with_dequeue_wait(mut self, wait: Duration) -> Self {
        self.dequeue_wait = wait;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run exactly one parse attempt for a job
    pub async fn process(&self, job: &ParseJob) -> AttemptOutcome {
        let attempts_made = job.attempt.saturating_add(1);
        debug!(
            sender = %job.sender,
            attempt = attempts_made,
            state = ?JobState::Running,
            "parse attempt started"
        );

        match self.service.parse(&job.to_request()).await {
            Ok(response) => self.settle(job, response),
            Err(ClientError::Network(reason)) => {
                if self.policy.allows_retry(attempts_made) {
                    let delay = self.policy.backoff_delay(job.attempt);
                    warn!(
                        sender = %job.sender,
                        attempt = attempts_made,
                        delay_ms = delay.as_millis() as u64,
                        error = %reason,
                        "network issue, retrying"
                    );
                    AttemptOutcome::RetryScheduled {
                        next_attempt: attempts_made,
                        delay,
                    }
                } else {
                    error!(
                        sender = %job.sender,
                        attempt = attempts_made,
                        error = %reason,
                        "parse job failed: retries exhausted"
                    );
                    AttemptOutcome::Failed(JobFailure::RetriesExhausted {
                        attempts: attempts_made,
                        last_error: reason,
                    })
                }
            }
            Err(ClientError::Protocol(e)) => {
                error!(
                    sender = %job.sender,
                    attempt = attempts_made,
                    error = %e,
                    "parse job failed: rejected"
                );
                AttemptOutcome::Failed(JobFailure::Rejected(e))
            }
        }
    }

    fn settle(&self, job: &ParseJob, response: ParseResponse) -> AttemptOutcome {
        if !response.status.is_created() {
            info!(
                sender = %job.sender,
                status = response.status.as_str(),
                unique_identifier = %response.unique_identifier,
                "parse succeeded, no new draft"
            );
            return AttemptOutcome::Succeeded(Success::NoOp {
                status: response.status,
            });
        }

        let persisted = response
            .to_json()
            .map_err(JobFailure::from)
            .and_then(|payload| self.store.save(&payload).map_err(JobFailure::from));
        if let Err(failure) = persisted {
            error!(
                sender = %job.sender,
                unique_identifier = %response.unique_identifier,
                fault = "persistence",
                error = %failure,
                "parse job failed: result not stored"
            );
            return AttemptOutcome::Failed(failure);
        }

        self.notifier.emit(&response.unique_identifier);
        info!(
            sender = %job.sender,
            unique_identifier = %response.unique_identifier,
            "transaction draft created"
        );
        AttemptOutcome::Succeeded(Success::Created {
            unique_identifier: response.unique_identifier,
        })
    }

    /// Claim one job, process it, and settle it on the queue
    ///
    /// Returns `None` when no job became ready within `wait`.
    pub async fn run_once<Q: JobQueue>(
        &self,
        queue: &Q,
        wait: Duration,
    ) -> Result<Option<AttemptOutcome>, QueueError> {
        let Some(delivery) = queue.dequeue(wait).await? else {
            return Ok(None);
        };

        let outcome = self.process(&delivery.job).await;
        match &outcome {
            AttemptOutcome::RetryScheduled { delay, .. } => queue.retry(&delivery, *delay).await?,
            AttemptOutcome::Succeeded(_) | AttemptOutcome::Failed(_) => queue.ack(&delivery).await?,
        }
        Ok(Some(outcome))
    }

    /// Process jobs until `shutdown` flips to true
    ///
    /// Shutdown is checked between jobs, so an attempt in progress completes.
    pub async fn run<Q: JobQueue>(&self, queue: Arc<Q>, shutdown: watch::Receiver<bool>) {
        loop {
            let stop = *shutdown.borrow();
            if stop {
                break;
            }
            if let Err(e) = self.run_once(queue.as_ref(), self.dequeue_wait).await {
                error!(error = %e, "job queue error");
                tokio::time::sleep(Duration::from_millis(QUEUE_ERROR_BACKOFF_MS)).await;
            }
        }
    }
}

/// A set of concurrent worker loops sharing one queue
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    tasks: JoinSet<()>,
}

impl WorkerPool {
    /// Start `concurrency` loops (at least one) on the current runtime
    pub fn spawn<S, Q>(worker: Arc<ParseWorker<S>>, queue: Arc<Q>, concurrency: usize) -> Self
    where
        S: ParseService + 'static,
        Q: JobQueue + 'static,
    {
        let (shutdown, signal) = watch::channel(false);
        let mut tasks = JoinSet::new();
        let concurrency = concurrency.max(1);

        for id in 0..concurrency {
            let worker = worker.clone();
            let queue = queue.clone();
            let signal = signal.clone();
            tasks.spawn(async move {
                worker.run(queue, signal).await;
                debug!(worker = id, "worker loop stopped");
            });
        }

        info!(concurrency, "worker pool started");
        Self { shutdown, tasks }
    }

    /// Number of running loops
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Signal every loop to stop and wait for in-flight attempts to finish
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "worker loop panicked");
            }
        }
        info!("worker pool stopped");
    }
}
