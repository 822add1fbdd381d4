//! Durable Job Queue
//!
//! At-least-once queue for parse jobs with a native delayed-retry facility.
//! Claimed jobs stay in an in-flight set until they are acknowledged or
//! rescheduled, so a crashed process can hand them back with [`JobQueue::recover`].
//!
//! Redis layout under a key prefix:
//! - `<prefix>:pending`  list, LPUSH on enqueue, claimed from the right (FIFO)
//! - `<prefix>:inflight` list of claimed jobs awaiting ack
//! - `<prefix>:delayed`  sorted set of retries scored by ready-at epoch millis,
//!   each member tagged `<seq>|<job>` so identical jobs stay distinct
//! - `<prefix>:seq`      counter behind those tags

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::message::ParseJob;

/// Default Redis URL
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Default key prefix for queue structures
pub const DEFAULT_KEY_PREFIX: &str = "sms_parse";

/// How often an idle Redis consumer polls for ready jobs
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

/// Most delayed jobs promoted per claim
const PROMOTE_BATCH: usize = 100;

/// Moves due retries from the delayed set to the pending list atomically
const PROMOTE_SCRIPT: &str = r"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
for _, member in ipairs(due) do
  redis.call('ZREM', KEYS[1], member)
  local tag = string.match(member, '^%d+|')
  if tag then
    member = string.sub(member, #tag + 1)
  end
  redis.call('LPUSH', KEYS[2], member)
end
return #due
";

/// Releases a claim and schedules the bumped job under a fresh tag
const RETRY_SCRIPT: &str = r"
redis.call('LREM', KEYS[1], 1, ARGV[1])
local seq = redis.call('INCR', KEYS[3])
redis.call('ZADD', KEYS[2], ARGV[3], seq .. '|' .. ARGV[2])
return seq
";

/// Errors that can occur during queue operations
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A claimed job
///
/// Must be settled with [`JobQueue::ack`] or [`JobQueue::retry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub job: ParseJob,
    /// Exact queue entry, used to remove the claim
    receipt: String,
}

impl Delivery {
    fn claim(receipt: String) -> Result<Self, serde_json::Error> {
        let job = ParseJob::from_json(&receipt)?;
        Ok(Self { job, receipt })
    }
}

/// Durable, at-least-once work queue for parse jobs
pub trait JobQueue: Send + Sync {
    /// Append a job; durable once this returns
    fn enqueue(&self, job: &ParseJob) -> impl Future<Output = Result<(), QueueError>> + Send;

    /// Claim the next ready job, waiting up to `wait` for one
    fn dequeue(
        &self,
        wait: Duration,
    ) -> impl Future<Output = Result<Option<Delivery>, QueueError>> + Send;

    /// Drop a job that reached a terminal state
    fn ack(&self, delivery: &Delivery) -> impl Future<Output = Result<(), QueueError>> + Send;

    /// Reschedule a job with its attempt counter bumped
    fn retry(
        &self,
        delivery: &Delivery,
        delay: Duration,
    ) -> impl Future<Output = Result<(), QueueError>> + Send;

    /// Return jobs claimed by a previous process to the ready queue
    fn recover(&self) -> impl Future<Output = Result<usize, QueueError>> + Send;
}

/// Configuration for the Redis-backed queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub redis_url: String,
    pub key_prefix: String,
    pub poll_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_REDIS_URL.to_string(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        }
    }
}

/// Redis key names derived from a prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    pub pending: String,
    pub inflight: String,
    pub delayed: String,
    pub seq: String,
}

impl QueueKeys {
    pub fn new(prefix: &str) -> Self {
        Self {
            pending: format!("{}:pending", prefix),
            inflight: format!("{}:inflight", prefix),
            delayed: format!("{}:delayed", prefix),
            seq: format!("{}:seq", prefix),
        }
    }
}

/// Get current timestamp in milliseconds
pub fn current_timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Redis-backed durable queue
pub struct RedisJobQueue {
    connection: MultiplexedConnection,
    keys: QueueKeys,
    poll_interval: Duration,
    promote: Script,
    reschedule: Script,
}

impl RedisJobQueue {
    /// Wrap an established multiplexed connection
    pub fn new(connection: MultiplexedConnection, config: &QueueConfig) -> Self {
        Self {
            connection,
            keys: QueueKeys::new(&config.key_prefix),
            poll_interval: config.poll_interval,
            promote: Script::new(PROMOTE_SCRIPT),
            reschedule: Script::new(RETRY_SCRIPT),
        }
    }

    /// Open a connection to the configured Redis server
    pub async fn connect(config: &QueueConfig) -> Result<Self, QueueError> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        let connection = client.get_multiplexed_async_connection().await?;
        info!(url = %config.redis_url, prefix = %config.key_prefix, "connected job queue");
        Ok(Self::new(connection, config))
    }

    /// Get the key names
    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }

    async fn promote_due(&self) -> Result<usize, QueueError> {
        let mut conn = self.connection.clone();
        let promoted: usize = self
            .promote
            .key(&self.keys.delayed)
            .key(&self.keys.pending)
            .arg(current_timestamp_millis())
            .arg(PROMOTE_BATCH)
            .invoke_async(&mut conn)
            .await?;
        if promoted > 0 {
            debug!(promoted, "promoted delayed jobs");
        }
        Ok(promoted)
    }

    async fn claim(&self) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.connection.clone();
        // LMOVE rather than BLMOVE: a blocking call would stall the shared multiplexed connection
        let raw: Option<String> = redis::cmd("LMOVE")
            .arg(&self.keys.pending)
            .arg(&self.keys.inflight)
            .arg("RIGHT")
            .arg("LEFT")
            .query_async(&mut conn)
            .await?;

        let Some(raw) = raw else {
            return Ok(None);
        };

        match Delivery::claim(raw.clone()) {
            Ok(delivery) => Ok(Some(delivery)),
            Err(e) => {
                warn!(error = %e, "dropping undecodable queue entry");
                let _: () = conn.lrem(&self.keys.inflight, 1, &raw).await?;
                Err(e.into())
            }
        }
    }
}

impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, job: &ParseJob) -> Result<(), QueueError> {
        let json = job.to_json()?;
        let mut conn = self.connection.clone();
        let _: () = conn.lpush(&self.keys.pending, json).await?;
        Ok(())
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = Instant::now() + wait;
        loop {
            self.promote_due().await?;
            if let Some(delivery) = self.claim().await? {
                return Ok(Some(delivery));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.connection.clone();
        let _: () = conn.lrem(&self.keys.inflight, 1, &delivery.receipt).await?;
        Ok(())
    }

    async fn retry(&self, delivery: &Delivery, delay: Duration) -> Result<(), QueueError> {
        let next = delivery.job.next_attempt().to_json()?;
        let ready_at = current_timestamp_millis() + delay.as_millis() as i64;
        let mut conn = self.connection.clone();
        let _: i64 = self
            .reschedule
            .key(&self.keys.inflight)
            .key(&self.keys.delayed)
            .key(&self.keys.seq)
            .arg(&delivery.receipt)
            .arg(next)
            .arg(ready_at)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn recover(&self) -> Result<usize, QueueError> {
        let mut conn = self.connection.clone();
        let mut recovered = 0;
        loop {
            // newest claim first onto the claiming end, so the oldest is claimed next
            let moved: Option<String> = redis::cmd("LMOVE")
                .arg(&self.keys.inflight)
                .arg(&self.keys.pending)
                .arg("LEFT")
                .arg("RIGHT")
                .query_async(&mut conn)
                .await?;
            if moved.is_none() {
                break;
            }
            recovered += 1;
        }
        if recovered > 0 {
            info!(recovered, "recovered in-flight jobs from previous run");
        }
        Ok(recovered)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    pending: VecDeque<String>,
    inflight: Vec<String>,
    delayed: Vec<(Instant, String)>,
}

impl MemoryState {
    fn promote_due(&mut self, now: Instant) {
        let mut due: Vec<(Instant, String)> = Vec::new();
        self.delayed.retain(|(ready_at, raw)| {
            if *ready_at <= now {
                due.push((*ready_at, raw.clone()));
                false
            } else {
                true
            }
        });
        due.sort_by_key(|(ready_at, _)| *ready_at);
        self.pending.extend(due.into_iter().map(|(_, raw)| raw));
    }

    fn next_due(&self) -> Option<Instant> {
        self.delayed.iter().map(|(ready_at, _)| *ready_at).min()
    }

    fn release(&mut self, receipt: &str) {
        if let Some(pos) = self.inflight.iter().position(|raw| raw == receipt) {
            self.inflight.remove(pos);
        }
    }
}

/// In-process queue with the same claim/retry semantics as [`RedisJobQueue`]
///
/// Not durable across restarts.
#[derive(Debug, Default)]
pub struct MemoryJobQueue {
    state: Mutex<MemoryState>,
    notify: Notify,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Jobs ready to be claimed
    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Jobs claimed but not yet settled
    pub fn inflight_len(&self) -> usize {
        self.lock().inflight.len()
    }

    /// Retries waiting for their delay to elapse
    pub fn delayed_len(&self) -> usize {
        self.lock().delayed.len()
    }

    /// True when no job is pending, delayed or in flight
    pub fn is_idle(&self) -> bool {
        let state = self.lock();
        state.pending.is_empty() && state.inflight.is_empty() && state.delayed.is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        // a poisoned queue is still structurally valid
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, job: &ParseJob) -> Result<(), QueueError> {
        let json = job.to_json()?;
        self.lock().pending.push_back(json);
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = Instant::now() + wait;
        loop {
            let next_due = {
                let mut state = self.lock();
                state.promote_due(Instant::now());
                if let Some(raw) = state.pending.pop_front() {
                    return match Delivery::claim(raw.clone()) {
                        Ok(delivery) => {
                            state.inflight.push(raw);
                            Ok(Some(delivery))
                        }
                        Err(e) => {
                            warn!(error = %e, "dropping undecodable queue entry");
                            Err(e.into())
                        }
                    };
                }
                state.next_due()
            };

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wake_at = next_due.map_or(deadline, |due| due.min(deadline));
            let _ = tokio::time::timeout_at(wake_at, self.notify.notified()).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.lock().release(&delivery.receipt);
        Ok(())
    }

    async fn retry(&self, delivery: &Delivery, delay: Duration) -> Result<(), QueueError> {
        let next = delivery.job.next_attempt().to_json()?;
        {
            let mut state = self.lock();
            state.release(&delivery.receipt);
            state.delayed.push((Instant::now() + delay, next));
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn recover(&self) -> Result<usize, QueueError> {
        let recovered = {
            let mut state = self.lock();
            let claimed: Vec<String> = state.inflight.drain(..).collect();
            let count = claimed.len();
            for raw in claimed.into_iter().rev() {
                state.pending.push_front(raw);
            }
            count
        };
        if recovered > 0 {
            self.notify.notify_one();
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::RawMessage;

    fn job(body: &str) -> ParseJob {
        ParseJob::from_message(RawMessage::new(body, "VM-HDFCBK", 1703000000000))
    }

    // ==================== QueueConfig / QueueKeys tests ====================

    #[test]
    fn test_queue_config_default() {
        let config = QueueConfig::default();
        assert_eq!(config.redis_url, DEFAULT_REDIS_URL);
        assert_eq!(config.key_prefix, DEFAULT_KEY_PREFIX);
        assert_eq!(config.poll_interval, Duration::from_millis(500));
    }

    #[test]
    fn test_queue_keys_use_prefix() {
        let keys = QueueKeys::new("test");
        assert_eq!(keys.pending, "test:pending");
        assert_eq!(keys.inflight, "test:inflight");
        assert_eq!(keys.delayed, "test:delayed");
        assert_eq!(keys.seq, "test:seq");
    }

    #[test]
    fn test_current_timestamp_is_reasonable() {
        let ts = current_timestamp_millis();
        assert!(ts > 1704067200000);
    }

    // ==================== MemoryJobQueue tests ====================

    #[tokio::test]
    async fn test_memory_queue_is_fifo() {
        let queue = MemoryJobQueue::new();
        queue.enqueue(&job("first")).await.unwrap();
        queue.enqueue(&job("second")).await.unwrap();

        let a = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        let b = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(a.job.body, "first");
        assert_eq!(b.job.body, "second");
        assert_eq!(queue.inflight_len(), 2);
    }

    #[tokio::test]
    async fn test_memory_queue_empty_times_out() {
        let queue = MemoryJobQueue::new();
        let got = queue.dequeue(Duration::from_millis(20)).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_memory_queue_wakes_waiting_consumer() {
        let queue = std::sync::Arc::new(MemoryJobQueue::new());
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.enqueue(&job("late")).await.unwrap();

        let delivery = consumer.await.unwrap().unwrap().unwrap();
        assert_eq!(delivery.job.body, "late");
    }

    #[tokio::test]
    async fn test_memory_queue_ack_removes_claim() {
        let queue = MemoryJobQueue::new();
        queue.enqueue(&job("a")).await.unwrap();
        let delivery = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        queue.ack(&delivery).await.unwrap();
        assert!(queue.is_idle());
    }

    #[tokio::test]
    async fn test_memory_queue_retry_bumps_attempt_after_delay() {
        let queue = MemoryJobQueue::new();
        queue.enqueue(&job("a")).await.unwrap();
        let delivery = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(delivery.job.attempt, 0);

        queue.retry(&delivery, Duration::from_millis(50)).await.unwrap();
        assert_eq!(queue.inflight_len(), 0);
        assert_eq!(queue.delayed_len(), 1);

        // not ready yet
        assert!(queue.dequeue(Duration::ZERO).await.unwrap().is_none());

        let retried = queue.dequeue(Duration::from_secs(2)).await.unwrap().unwrap();
        assert_eq!(retried.job.attempt, 1);
        assert_eq!(retried.job.body, "a");
    }

    #[tokio::test]
    async fn test_memory_queue_recover_returns_claims_first() {
        let queue = MemoryJobQueue::new();
        queue.enqueue(&job("claimed")).await.unwrap();
        queue.enqueue(&job("waiting")).await.unwrap();
        let _abandoned = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();

        assert_eq!(queue.recover().await.unwrap(), 1);
        assert_eq!(queue.inflight_len(), 0);

        let next = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(next.job.body, "claimed");
    }

    #[tokio::test]
    async fn test_memory_queue_identical_retries_both_return() {
        let queue = MemoryJobQueue::new();
        queue.enqueue(&job("same")).await.unwrap();
        queue.enqueue(&job("same")).await.unwrap();
        let first = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        let second = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();

        queue.retry(&first, Duration::ZERO).await.unwrap();
        queue.retry(&second, Duration::ZERO).await.unwrap();
        assert_eq!(queue.delayed_len(), 2);

        let a = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        let b = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!((a.job.attempt, b.job.attempt), (1, 1));
        assert_eq!(queue.delayed_len(), 0);
    }

    #[tokio::test]
    async fn test_memory_queue_duplicate_submissions_are_kept() {
        let queue = MemoryJobQueue::new();
        queue.enqueue(&job("same")).await.unwrap();
        queue.enqueue(&job("same")).await.unwrap();
        assert_eq!(queue.pending_len(), 2);

        let first = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        let second = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        queue.ack(&first).await.unwrap();
        assert_eq!(queue.inflight_len(), 1);
        queue.ack(&second).await.unwrap();
        assert!(queue.is_idle());
    }
}
