//! Ingestor Composition Root
//!
//! Builds the store, notifier, queue and worker once and hands out the
//! platform-facing and UI-facing entry points.

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::client::{ClientError, ParseClient, ParseService};
use crate::config::IngestorConfig;
use crate::dispatcher::{Dispatcher, IngestReport};
use crate::message::RawMessage;
use crate::notifier::{EventNotifier, Subscription};
use crate::queue::{JobQueue, QueueError, RedisJobQueue};
use crate::store::{FileResultStore, ResultStore, StoreError};
use crate::worker::{ParseWorker, RetryPolicy, WorkerPool};

/// Errors that can occur while assembling an ingestor
#[derive(Error, Debug)]
pub enum IngestorError {
    #[error("Job queue unavailable: {0}")]
    Queue(#[from] QueueError),

    #[error("Parse client setup failed: {0}")]
    Client(#[from] ClientError),

    #[error("Result store unavailable: {0}")]
    Store(#[from] StoreError),
}

/// The assembled pipeline
pub struct Ingestor<Q, S> {
    dispatcher: Dispatcher<Q>,
    queue: Arc<Q>,
    worker: Arc<ParseWorker<S>>,
    store: Arc<dyn ResultStore>,
    notifier: Arc<EventNotifier>,
}

/// Production wiring: Redis queue, HTTP client, file store
pub type RedisIngestor = Ingestor<RedisJobQueue, ParseClient>;

impl<Q, S> Ingestor<Q, S>
where
    Q: JobQueue + 'static,
    S: ParseService + 'static,
{
    pub fn new(queue: Arc<Q>, service: Arc<S>, store: Arc<dyn ResultStore>, retry: RetryPolicy) -> Self {
        let notifier = Arc::new(EventNotifier::new());
        let worker = Arc::new(ParseWorker::new(service, store.clone(), notifier.clone(), retry));
        Self {
            dispatcher: Dispatcher::new(queue.clone()),
            queue,
            worker,
            store,
            notifier,
        }
    }

    /// Platform callback for one delivery of messages
    pub async fn ingest_batch(&self, messages: &[RawMessage]) -> IngestReport {
        self.dispatcher.ingest_batch(messages).await
    }

    pub fn dispatcher(&self) -> &Dispatcher<Q> {
        &self.dispatcher
    }

    pub fn worker(&self) -> &ParseWorker<S> {
        &self.worker
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    /// Latest stored CREATED response, as JSON
    pub fn latest_result(&self) -> Result<Option<String>, StoreError> {
        self.store.load()
    }

    /// Attach the live feed, replacing any earlier subscriber
    pub fn subscribe(&self) -> Subscription {
        self.notifier.attach()
    }

    pub fn unsubscribe(&self) {
        self.notifier.detach()
    }

    /// Hand jobs abandoned by a previous process back to the queue
    pub async fn recover(&self) -> Result<usize, QueueError> {
        self.queue.recover().await
    }

    /// Start background workers on the current runtime
    pub fn start_workers(&self, concurrency: usize) -> WorkerPool {
        WorkerPool::spawn(self.worker.clone(), self.queue.clone(), concurrency)
    }
}

impl RedisIngestor {
    /// Connect every production collaborator described by `config`
    pub async fn connect(config: &IngestorConfig) -> Result<Self, IngestorError> {
        let store = match &config.store_dir {
            Some(dir) => FileResultStore::open(dir)?,
            None => FileResultStore::open_default()?,
        };
        info!(path = %store.path().display(), "result store ready");

        let client = ParseClient::new(&config.client)?;
        info!(url = %client.url(), "parse client ready");

        let queue = RedisJobQueue::connect(&config.queue).await?;

        Ok(Self::new(
            Arc::new(queue),
            Arc::new(client),
            Arc::new(store),
            config.retry,
        ))
    }
}
