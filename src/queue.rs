//! Asynchronous persistence queues.
//!
//! Two typed queues carry billing deltas and usage rows off the hot path.
//! Enqueue is non-blocking; a worker per queue collects batches, attempts one
//! transactional commit, falls back to per-item writes with exponential
//! backoff, and parks exhausted items in the dead-letter queue tagged with
//! their last error. Nothing is ever dropped silently.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::rngs::OsRng;
use rand::RngCore;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use sqlx::PgPool;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::billing::{BillingDelta, BillingService};
use crate::db::{self, UsageRow};

const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub capacity: usize,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            capacity: 10_000,
            batch_size: 100,
            batch_timeout: Duration::from_secs(5),
            max_retries: 3,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("queue {0} is full")]
    Full(&'static str),
    #[error("queue {0} is shut down")]
    Closed(&'static str),
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct SinkError(pub String);

/// Producer handle. Cheap to clone; enqueue never blocks the hot path.
pub struct WorkQueue<T> {
    name: &'static str,
    tx: mpsc::Sender<T>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        WorkQueue {
            name: self.name,
            tx: self.tx.clone(),
        }
    }
}

impl<T> WorkQueue<T> {
    #[cfg(test)]
    pub(crate) fn for_test(name: &'static str, tx: mpsc::Sender<T>) -> Self {
        WorkQueue { name, tx }
    }

    pub fn enqueue(&self, item: T) -> Result<(), EnqueueError> {
        self.tx.try_send(item).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EnqueueError::Full(self.name),
            mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed(self.name),
        })
    }
}

/// Commit target for one queue. Batch commit must be all-or-nothing; the
/// per-item path is the retry fallback.
pub trait BatchSink<T>: Send + Sync + 'static {
    fn commit_batch(&self, items: &[T]) -> impl Future<Output = Result<(), SinkError>> + Send;
    fn commit_one(&self, item: &T) -> impl Future<Output = Result<(), SinkError>> + Send;
}

/// A parked item with its last error.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DeadLetterEntry {
    pub id: Uuid,
    pub item: serde_json::Value,
    pub error: String,
    pub ts: i64,
}

/// Dead-letter storage: a Redis list in production, in-memory elsewhere.
pub enum DeadLetterQueue {
    Redis { conn: ConnectionManager },
    Memory(std::sync::Mutex<Vec<DeadLetterEntry>>),
}

impl DeadLetterQueue {
    pub fn redis(conn: ConnectionManager) -> Self {
        DeadLetterQueue::Redis { conn }
    }

    pub fn memory() -> Self {
        DeadLetterQueue::Memory(std::sync::Mutex::new(Vec::new()))
    }

    pub async fn park<T: serde::Serialize>(&self, queue_name: &str, item: &T, error: &str) {
        let entry = DeadLetterEntry {
            id: Uuid::new_v4(),
            item: serde_json::to_value(item).unwrap_or(serde_json::Value::Null),
            error: error.to_string(),
            ts: Utc::now().timestamp(),
        };
        tracing::error!(queue = queue_name, error = error, id = %entry.id, "parking item in DLQ");

        match self {
            DeadLetterQueue::Redis { conn } => {
                let payload = match serde_json::to_string(&entry) {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::error!(queue = queue_name, error = %e, "unserialisable DLQ entry");
                        return;
                    }
                };
                let mut conn = conn.clone();
                if let Err(e) = conn
                    .rpush::<_, _, i64>(format!("queue:{queue_name}:dlq"), &payload)
                    .await
                {
                    // Last resort: the entry survives only in the log line.
                    tracing::error!(
                        queue = queue_name,
                        error = %e,
                        entry = %payload,
                        "DLQ write failed, entry preserved in log only"
                    );
                }
            }
            DeadLetterQueue::Memory(entries) => {
                entries.lock().expect("dlq mutex poisoned").push(entry);
            }
        }
    }

    /// Snapshot of parked entries (memory variant; used by tests and ops).
    pub fn parked(&self) -> Vec<DeadLetterEntry> {
        match self {
            DeadLetterQueue::Memory(entries) => {
                entries.lock().expect("dlq mutex poisoned").clone()
            }
            DeadLetterQueue::Redis { .. } => Vec::new(),
        }
    }
}

/// Consumer half: a long-running task plus its stop signal.
pub struct QueueWorker {
    name: &'static str,
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl QueueWorker {
    /// Close intake and drain pending items within the deadline.
    pub async fn stop(self, deadline: Duration) {
        let _ = self.stop_tx.send(true);
        match tokio::time::timeout(deadline, self.handle).await {
            Ok(_) => tracing::info!(queue = self.name, "queue worker drained"),
            Err(_) => tracing::error!(queue = self.name, "queue worker drain deadline exceeded"),
        }
    }
}

/// Start a queue: bounded channel, worker task, retry/DLQ machinery.
pub fn spawn_queue<T, S>(
    name: &'static str,
    config: QueueConfig,
    sink: S,
    dlq: Arc<DeadLetterQueue>,
) -> (WorkQueue<T>, QueueWorker)
where
    T: serde::Serialize + Send + Sync + 'static,
    S: BatchSink<T>,
{
    let (tx, rx) = mpsc::channel(config.capacity.max(1));
    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(worker_loop(name, config, rx, sink, dlq, stop_rx));
    (
        WorkQueue { name, tx },
        QueueWorker {
            name,
            stop_tx,
            handle,
        },
    )
}

async fn worker_loop<T, S>(
    name: &'static str,
    config: QueueConfig,
    mut rx: mpsc::Receiver<T>,
    sink: S,
    dlq: Arc<DeadLetterQueue>,
    mut stop: watch::Receiver<bool>,
) where
    T: serde::Serialize + Send + Sync + 'static,
    S: BatchSink<T>,
{
    let mut draining = false;
    loop {
        if !draining && *stop.borrow() {
            rx.close();
            draining = true;
        }

        // Wait for the head of the next batch. recv() is cancel-safe, so the
        // stop branch cannot lose items.
        let first = if draining {
            rx.recv().await
        } else {
            tokio::select! {
                item = rx.recv() => item,
                changed = stop.changed() => {
                    // A dropped stop handle counts as a stop signal.
                    if changed.is_err() {
                        rx.close();
                        draining = true;
                    }
                    continue;
                }
            }
        };
        let Some(first) = first else {
            break;
        };

        let mut items = vec![first];
        let deadline = tokio::time::Instant::now() + config.batch_timeout;
        while items.len() < config.batch_size {
            // Keep watching the stop signal mid-fill so a long batch timeout
            // cannot stall the drain.
            tokio::select! {
                result = tokio::time::timeout_at(deadline, rx.recv()) => {
                    match result {
                        Ok(Some(item)) => items.push(item),
                        Ok(None) | Err(_) => break,
                    }
                }
                _ = stop.changed(), if !draining => {
                    rx.close();
                    draining = true;
                }
            }
        }

        commit_with_retries(name, &config, &sink, &dlq, items).await;
    }
    tracing::debug!(queue = name, "worker loop exited");
}

async fn commit_with_retries<T, S>(
    name: &'static str,
    config: &QueueConfig,
    sink: &S,
    dlq: &DeadLetterQueue,
    items: Vec<T>,
) where
    T: serde::Serialize + Send + Sync + 'static,
    S: BatchSink<T>,
{
    let batch_error = match sink.commit_batch(&items).await {
        Ok(()) => return,
        Err(e) => e,
    };
    tracing::warn!(
        queue = name,
        batch = items.len(),
        error = %batch_error,
        "batch commit failed, falling back to per-item writes"
    );

    for item in &items {
        let max_attempts = config.max_retries + 1;
        for attempt in 1..=max_attempts {
            match sink.commit_one(item).await {
                Ok(()) => break,
                Err(e) if attempt == max_attempts => {
                    dlq.park(name, item, &e.to_string()).await;
                }
                Err(e) => {
                    tracing::debug!(queue = name, attempt, error = %e, "item commit failed, retrying");
                    tokio::time::sleep(backoff_delay(attempt, config.retry_backoff)).await;
                }
            }
        }
    }
}

/// `retry_backoff × 2^(attempt-1)`, capped, with up to 25% jitter.
fn backoff_delay(attempt: u32, base: Duration) -> Duration {
    let exp = base.saturating_mul(1u32 << (attempt - 1).min(16));
    let delay = exp.min(MAX_BACKOFF);
    let mut jitter_bytes = [0u8; 8];
    OsRng.fill_bytes(&mut jitter_bytes);
    let jitter_range = (delay.as_millis() as u64 / 4).max(1);
    let jitter = u64::from_le_bytes(jitter_bytes) % jitter_range;
    delay + Duration::from_millis(jitter)
}

// ============================================================================
// Sinks
// ============================================================================

/// Writes usage rows (and their summary increments) to Postgres.
pub struct UsageSink {
    pool: PgPool,
}

impl UsageSink {
    pub fn new(pool: PgPool) -> Self {
        UsageSink { pool }
    }
}

impl BatchSink<UsageRow> for UsageSink {
    async fn commit_batch(&self, items: &[UsageRow]) -> Result<(), SinkError> {
        db::insert_usage_rows(&self.pool, items)
            .await
            .map_err(|e| SinkError(e.to_string()))
    }

    async fn commit_one(&self, item: &UsageRow) -> Result<(), SinkError> {
        db::insert_usage_row(&self.pool, item)
            .await
            .map_err(|e| SinkError(e.to_string()))
    }
}

/// Accumulates billing deltas into the shared store's month counters.
pub struct BillingSink {
    billing: Arc<BillingService>,
}

impl BillingSink {
    pub fn new(billing: Arc<BillingService>) -> Self {
        BillingSink { billing }
    }
}

impl BatchSink<BillingDelta> for BillingSink {
    async fn commit_batch(&self, items: &[BillingDelta]) -> Result<(), SinkError> {
        // Collapse the batch to one INCRBYFLOAT per key.
        let mut totals: std::collections::HashMap<Uuid, f64> = std::collections::HashMap::new();
        for delta in items {
            *totals.entry(delta.api_key_id).or_insert(0.0) += delta.cost_usd;
        }
        for (key_id, cost) in totals {
            self.billing
                .add_usage(key_id, cost)
                .await
                .map_err(|e| SinkError(e.to_string()))?;
        }
        Ok(())
    }

    async fn commit_one(&self, item: &BillingDelta) -> Result<(), SinkError> {
        self.billing
            .add_usage(item.api_key_id, item.cost_usd)
            .await
            .map_err(|e| SinkError(e.to_string()))
    }
}
