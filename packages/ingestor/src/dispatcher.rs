//! Message Dispatcher
//!
//! Reception-path entry point: classifies each platform message and hands
//! transaction messages to the durable queue. Nothing here talks to the
//! parsing service.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::filter::matched_keyword;
use crate::message::{ParseJob, RawMessage};
use crate::queue::{JobQueue, QueueError};

/// Errors that can occur while handing a message to the queue
#[derive(Error, Debug)]
pub enum EnqueueError {
    #[error("Failed to enqueue parse job: {0}")]
    Queue(#[from] QueueError),
}

/// Per-batch ingestion counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    /// Messages in the batch
    pub received: usize,
    /// Messages classified as transactions
    pub matched: usize,
    /// Jobs durably queued
    pub enqueued: usize,
    /// Transaction messages lost to enqueue failures
    pub dropped: usize,
}

/// Turns classified messages into queued parse jobs
pub struct Dispatcher<Q> {
    queue: Arc<Q>,
}

impl<Q> Clone for Dispatcher<Q> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
        }
    }
}

impl<Q: JobQueue> Dispatcher<Q> {
    pub fn new(queue: Arc<Q>) -> Self {
        Self { queue }
    }

    /// Queue a parse job for a message already classified as a transaction
    ///
    /// No deduplication happens here; repeated submissions are resolved by
    /// the parsing service.
    pub async fn enqueue(&self, message: RawMessage) -> Result<(), EnqueueError> {
        let job = ParseJob::from_message(message);
        self.queue.enqueue(&job).await?;
        debug!(sender = %job.sender, timestamp = job.timestamp_millis, "parse job enqueued");
        Ok(())
    }

    /// Handle one platform delivery of messages
    ///
    /// Each message is classified and queued independently; a failed
    /// enqueue drops that message and the batch carries on.
    pub async fn ingest_batch(&self, messages: &[RawMessage]) -> IngestReport {
        let mut report = IngestReport {
            received: messages.len(),
            ..Default::default()
        };

        for message in messages {
            let Some(keyword) = matched_keyword(&message.body) else {
                continue;
            };
            report.matched += 1;
            debug!(sender = %message.sender, keyword = keyword.as_str(), "transaction detected");

            match self.enqueue(message.clone()).await {
                Ok(()) => report.enqueued += 1,
                Err(e) => {
                    report.dropped += 1;
                    warn!(
                        sender = %message.sender,
                        timestamp = message.timestamp_millis,
                        error = %e,
                        "dropping transaction message"
                    );
                }
            }
        }

        if report.matched > 0 {
            info!(
                received = report.received,
                matched = report.matched,
                enqueued = report.enqueued,
                dropped = report.dropped,
                "ingested message batch"
            );
        }
        report
    }
}
