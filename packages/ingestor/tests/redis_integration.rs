//! Redis Queue Integration Tests
//!
//! These tests require Redis at localhost:6379.
//! They are marked with #[ignore] by default for CI environments.
//!
//! To run these tests:
//! 1. Start Redis: `docker run -d -p 6379:6379 redis:alpine`
//! 2. Run tests: `cargo test --test redis_integration -- --ignored`

use std::time::{Duration, Instant};

use redis::AsyncCommands;

use sms_ledger_ingestor::message::{ParseJob, RawMessage};
use sms_ledger_ingestor::queue::{
    current_timestamp_millis, JobQueue, QueueConfig, QueueKeys, RedisJobQueue,
};

const REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Queue under a prefix no other test uses
async fn fresh_queue(name: &str) -> Result<RedisJobQueue, sms_ledger_ingestor::queue::QueueError> {
    let config = QueueConfig {
        redis_url: REDIS_URL.to_string(),
        key_prefix: format!("sms_parse_test:{}:{}", name, current_timestamp_millis()),
        poll_interval: Duration::from_millis(20),
    };
    RedisJobQueue::connect(&config).await
}

async fn get_redis_connection() -> Result<redis::aio::MultiplexedConnection, redis::RedisError> {
    let client = redis::Client::open(REDIS_URL)?;
    client.get_multiplexed_async_connection().await
}

async fn cleanup(keys: &QueueKeys) {
    if let Ok(mut conn) = get_redis_connection().await {
        let _: Result<(), _> = conn
            .del(&[
                keys.pending.as_str(),
                keys.inflight.as_str(),
                keys.delayed.as_str(),
                keys.seq.as_str(),
            ])
            .await;
    }
}

async fn list_len(key: &str) -> usize {
    let mut conn = get_redis_connection().await.unwrap();
    conn.llen(key).await.unwrap()
}

async fn zset_len(key: &str) -> usize {
    let mut conn = get_redis_connection().await.unwrap();
    conn.zcard(key).await.unwrap()
}

fn job(body: &str) -> ParseJob {
    ParseJob::from_message(RawMessage::new(body, "VM-HDFCBK", 1703000000000))
}

// ==================== Redis Connection Tests ====================

#[tokio::test]
#[ignore = "Requires running Redis at localhost:6379"]
async fn test_connect_to_redis() {
    let result = fresh_queue("connect").await;
    assert!(result.is_ok(), "Failed to connect to Redis: {:?}", result.err());
}

// ==================== Queue Semantics Tests ====================

#[tokio::test]
#[ignore = "Requires running Redis at localhost:6379"]
async fn test_enqueue_dequeue_is_fifo() {
    let queue = match fresh_queue("fifo").await {
        Ok(q) => q,
        Err(e) => {
            eprintln!("Skipping test: Redis not available: {}", e);
            return;
        }
    };

    queue.enqueue(&job("first")).await.unwrap();
    queue.enqueue(&job("second")).await.unwrap();

    let a = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
    let b = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
    assert_eq!(a.job.body, "first");
    assert_eq!(b.job.body, "second");
    assert_eq!(a.job.attempt, 0);
    assert_eq!(list_len(&queue.keys().inflight).await, 2);

    queue.ack(&a).await.unwrap();
    queue.ack(&b).await.unwrap();
    assert_eq!(list_len(&queue.keys().inflight).await, 0);

    cleanup(queue.keys()).await;
}

#[tokio::test]
#[ignore = "Requires running Redis at localhost:6379"]
async fn test_empty_queue_waits_then_returns_none() {
    let queue = match fresh_queue("empty").await {
        Ok(q) => q,
        Err(e) => {
            eprintln!("Skipping test: Redis not available: {}", e);
            return;
        }
    };

    let start = Instant::now();
    let got = queue.dequeue(Duration::from_millis(100)).await.unwrap();

    assert!(got.is_none());
    assert!(start.elapsed() >= Duration::from_millis(100));

    cleanup(queue.keys()).await;
}

#[tokio::test]
#[ignore = "Requires running Redis at localhost:6379"]
async fn test_retry_is_delayed_and_bumps_attempt() {
    let queue = match fresh_queue("retry").await {
        Ok(q) => q,
        Err(e) => {
            eprintln!("Skipping test: Redis not available: {}", e);
            return;
        }
    };

    queue.enqueue(&job("retry me")).await.unwrap();
    let delivery = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
    queue.retry(&delivery, Duration::from_millis(300)).await.unwrap();

    assert_eq!(list_len(&queue.keys().inflight).await, 0);
    assert_eq!(zset_len(&queue.keys().delayed).await, 1);
    assert!(queue.dequeue(Duration::ZERO).await.unwrap().is_none(), "retry ran early");

    let again = queue.dequeue(Duration::from_secs(2)).await.unwrap().unwrap();
    assert_eq!(again.job.body, "retry me");
    assert_eq!(again.job.attempt, 1);
    assert_eq!(zset_len(&queue.keys().delayed).await, 0);

    queue.ack(&again).await.unwrap();
    cleanup(queue.keys()).await;
}

#[tokio::test]
#[ignore = "Requires running Redis at localhost:6379"]
async fn test_identical_retries_are_not_collapsed() {
    let queue = match fresh_queue("identical").await {
        Ok(q) => q,
        Err(e) => {
            eprintln!("Skipping test: Redis not available: {}", e);
            return;
        }
    };

    queue.enqueue(&job("same")).await.unwrap();
    queue.enqueue(&job("same")).await.unwrap();
    let first = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
    let second = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
    queue.retry(&first, Duration::ZERO).await.unwrap();
    queue.retry(&second, Duration::ZERO).await.unwrap();

    assert_eq!(zset_len(&queue.keys().delayed).await, 2);

    let a = queue.dequeue(Duration::from_secs(1)).await.unwrap().unwrap();
    let b = queue.dequeue(Duration::from_secs(1)).await.unwrap().unwrap();
    assert_eq!(a.job, b.job);
    assert_eq!(a.job.attempt, 1);
    assert_eq!(zset_len(&queue.keys().delayed).await, 0);

    queue.ack(&a).await.unwrap();
    queue.ack(&b).await.unwrap();
    cleanup(queue.keys()).await;
}

#[tokio::test]
#[ignore = "Requires running Redis at localhost:6379"]
async fn test_recover_returns_abandoned_claims() {
    let queue = match fresh_queue("recover").await {
        Ok(q) => q,
        Err(e) => {
            eprintln!("Skipping test: Redis not available: {}", e);
            return;
        }
    };

    queue.enqueue(&job("one")).await.unwrap();
    queue.enqueue(&job("two")).await.unwrap();
    queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
    queue.dequeue(Duration::ZERO).await.unwrap().unwrap();

    let recovered = queue.recover().await.unwrap();
    assert_eq!(recovered, 2);
    assert_eq!(list_len(&queue.keys().inflight).await, 0);

    // oldest claim is handed out first again
    let first = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
    assert_eq!(first.job.body, "one");

    cleanup(queue.keys()).await;
}

#[tokio::test]
#[ignore = "Requires running Redis at localhost:6379"]
async fn test_undecodable_entry_is_dropped() {
    let queue = match fresh_queue("garbage").await {
        Ok(q) => q,
        Err(e) => {
            eprintln!("Skipping test: Redis not available: {}", e);
            return;
        }
    };

    let mut conn = get_redis_connection().await.unwrap();
    let _: () = conn.lpush(&queue.keys().pending, "not json").await.unwrap();

    assert!(queue.dequeue(Duration::ZERO).await.is_err());
    assert_eq!(list_len(&queue.keys().inflight).await, 0);
    assert_eq!(list_len(&queue.keys().pending).await, 0);

    cleanup(queue.keys()).await;
}
