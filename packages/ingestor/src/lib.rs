//! SMS Ledger Ingestor Library
//!
//! This crate provides components for classifying incoming SMS, queueing
//! transaction messages durably, forwarding them to the remote parsing
//! service with retry, and fanning results out to a local store and a live
//! subscriber.

pub mod client;
pub mod config;
pub mod dispatcher;
pub mod filter;
pub mod ingestor;
pub mod message;
pub mod notifier;
pub mod queue;
pub mod store;
pub mod worker;

// Re-export commonly used types
pub use client::{ClientConfig, ClientError, ParseClient, ParseService};
pub use config::IngestorConfig;
pub use dispatcher::{Dispatcher, IngestReport};
pub use filter::{is_transaction, matched_keyword, TransactionKeyword};
pub use ingestor::{Ingestor, RedisIngestor};
pub use message::{ParseJob, ParseRequest, ParseResponse, ParseStatus, ParsedTransaction, RawMessage};
pub use notifier::{DraftEvent, EventNotifier, Subscription};
pub use queue::{JobQueue, MemoryJobQueue, RedisJobQueue};
pub use store::{FileResultStore, MemoryResultStore, ResultStore};
pub use worker::{AttemptOutcome, ParseWorker, RetryPolicy, WorkerPool};
