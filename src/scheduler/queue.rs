//! Redis-backed invocation queue with reliable dequeue.
//!
//! Self-continuation is a durable re-dispatch: an invocation close to its
//! time budget pushes a ticket for the next invocation here, and the
//! supervisor pool picks it up.
//!
//! # Queue Structure
//!
//! - `{queue_name}`: tickets waiting for a worker
//! - `{queue_name}:processing`: tickets being processed (for crash recovery)
//! - `{queue_name}:dead_letter`: tickets that failed after max attempts
//!
//! Tickets are atomically moved from the main list to the processing list
//! with BRPOPLPUSH, so a worker crash never drops a continuation.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use thiserror::Error;
use uuid::Uuid;

use super::job::{InvocationTicket, ProcessRequest};

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to connect to Redis.
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    RedisError(#[from] redis::RedisError),

    /// Failed to serialize ticket data.
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    /// The sink refused the dispatch.
    #[error("Dispatch rejected: {0}")]
    Rejected(String),
}

/// Where a processor invocation hands off its continuation.
#[async_trait]
pub trait ContinuationSink: Send + Sync {
    async fn dispatch(&self, request: ProcessRequest) -> Result<(), QueueError>;
}

/// Redis list queue of invocation tickets.
pub struct InvocationQueue {
    redis: ConnectionManager,
    queue_name: String,
    processing_queue: String,
    dead_letter_queue: String,
}

impl InvocationQueue {
    /// Connects to Redis and creates a new queue.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str, queue_name: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_connection(redis, queue_name))
    }

    /// Creates a queue from an existing ConnectionManager.
    pub fn from_connection(redis: ConnectionManager, queue_name: &str) -> Self {
        Self {
            redis,
            queue_name: queue_name.to_string(),
            processing_queue: format!("{}:processing", queue_name),
            dead_letter_queue: format!("{}:dead_letter", queue_name),
        }
    }

    /// Enqueues a ticket.
    ///
    /// Tickets are pushed on the left and popped from the right (FIFO).
    pub async fn enqueue(&self, ticket: &InvocationTicket) -> Result<(), QueueError> {
        let serialized = serde_json::to_string(ticket)?;
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(&self.queue_name, serialized).await?;

        tracing::debug!(
            ticket_id = %ticket.id,
            batch_id = %ticket.request.batch_id,
            depth = ticket.request.resume_context.continuation_depth,
            "Enqueued invocation"
        );
        Ok(())
    }

    /// Dequeues the next ticket, blocking until one is available or timeout.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(ticket))` if a ticket was dequeued
    /// - `Ok(None)` if the timeout expired with nothing queued
    pub async fn dequeue(&self, timeout: Duration) -> Result<Option<InvocationTicket>, QueueError> {
        let mut conn = self.redis.clone();
        let timeout_secs = timeout.as_secs().max(1) as usize;

        let result: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(&self.queue_name)
            .arg(&self.processing_queue)
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await?;

        match result {
            Some(data) => {
                let ticket: InvocationTicket = serde_json::from_str(&data)?;
                Ok(Some(ticket))
            }
            None => Ok(None),
        }
    }

    /// Removes a finished ticket from the processing list.
    pub async fn complete(&self, ticket_id: Uuid) -> Result<(), QueueError> {
        self.remove_from_processing(ticket_id).await
    }

    /// Returns a ticket to the main queue for retry.
    ///
    /// The ticket's attempt counter should be incremented before calling this.
    pub async fn requeue(&self, ticket: &InvocationTicket) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();

        self.remove_from_processing(ticket.id).await?;

        // Right push so the retry is the next ticket dequeued.
        let serialized = serde_json::to_string(ticket)?;
        conn.rpush::<_, _, ()>(&self.queue_name, serialized).await?;

        Ok(())
    }

    /// Moves a ticket to the dead letter list after exhausting its attempts.
    pub async fn dead_letter(&self, ticket: &InvocationTicket, error: &str) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();

        self.remove_from_processing(ticket.id).await?;

        let entry = dead_letter_entry(ticket, error);
        let serialized = serde_json::to_string(&entry)?;
        conn.lpush::<_, _, ()>(&self.dead_letter_queue, serialized)
            .await?;

        Ok(())
    }

    pub async fn len(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(&self.queue_name).await?;
        Ok(len)
    }

    pub async fn processing_len(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(&self.processing_queue).await?;
        Ok(len)
    }

    pub async fn dead_letter_len(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(&self.dead_letter_queue).await?;
        Ok(len)
    }

    /// Recovers tickets stuck in the processing list.
    ///
    /// Called on supervisor startup to pick up tickets of workers that
    /// crashed. Tickets with attempts left are moved back to the main
    /// queue, the rest are dead-lettered.
    ///
    /// # Returns
    ///
    /// The number of tickets recovered.
    pub async fn recover_processing(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let mut recovered = 0;

        let tickets: Vec<String> = conn.lrange(&self.processing_queue, 0, -1).await?;

        for data in tickets {
            let Ok(mut ticket) = serde_json::from_str::<InvocationTicket>(&data) else {
                tracing::warn!("Dropping undecodable ticket from processing list");
                conn.lrem::<_, _, ()>(&self.processing_queue, 1, &data)
                    .await?;
                continue;
            };

            // A crash mid-invocation counts as an attempt.
            ticket.increment_attempts();

            if ticket.should_retry() {
                let serialized = serde_json::to_string(&ticket)?;

                let mut pipe = redis::pipe();
                pipe.atomic()
                    .lrem(&self.processing_queue, 1, &data)
                    .rpush(&self.queue_name, &serialized);
                pipe.query_async::<_, ()>(&mut conn).await?;

                recovered += 1;
            } else {
                self.dead_letter(&ticket, "Recovered from processing list after max attempts")
                    .await?;
            }
        }

        Ok(recovered)
    }

    /// Clears all lists (main, processing, and dead letter).
    ///
    /// **Warning**: This permanently deletes all tickets.
    pub async fn clear(&self) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();

        let mut pipe = redis::pipe();
        pipe.del(&self.queue_name)
            .del(&self.processing_queue)
            .del(&self.dead_letter_queue);
        pipe.query_async::<_, ()>(&mut conn).await?;

        Ok(())
    }

    /// Returns queue statistics.
    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let (pending, processing, dead_letter) =
            tokio::try_join!(self.len(), self.processing_len(), self.dead_letter_len())?;

        Ok(QueueStats {
            queue_name: self.queue_name.clone(),
            pending,
            processing,
            dead_letter,
        })
    }

    async fn remove_from_processing(&self, ticket_id: Uuid) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();

        let tickets: Vec<String> = conn.lrange(&self.processing_queue, 0, -1).await?;

        for data in tickets {
            if let Ok(ticket) = serde_json::from_str::<InvocationTicket>(&data) {
                if ticket.id == ticket_id {
                    conn.lrem::<_, _, ()>(&self.processing_queue, 1, &data)
                        .await?;
                    return Ok(());
                }
            }
        }

        // Already removed, e.g. by a concurrent recovery.
        Ok(())
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }
}

#[async_trait]
impl ContinuationSink for InvocationQueue {
    async fn dispatch(&self, request: ProcessRequest) -> Result<(), QueueError> {
        self.enqueue(&InvocationTicket::new(request)).await
    }
}

fn dead_letter_entry(ticket: &InvocationTicket, error: &str) -> serde_json::Value {
    serde_json::json!({
        "ticket": ticket,
        "error": error,
        "moved_at": chrono::Utc::now().to_rfc3339(),
    })
}

/// Statistics about queue state.
#[derive(Debug, Clone)]
pub struct QueueStats {
    pub queue_name: String,
    pub pending: usize,
    pub processing: usize,
    pub dead_letter: usize,
}

impl QueueStats {
    pub fn total(&self) -> usize {
        self.pending + self.processing + self.dead_letter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticket() -> InvocationTicket {
        InvocationTicket::new(ProcessRequest::new(Uuid::new_v4(), Uuid::new_v4(), "m"))
    }

    #[test]
    fn test_queue_error_display() {
        let err = QueueError::ConnectionFailed("timeout".to_string());
        assert!(err.to_string().contains("timeout"));

        let err = QueueError::Rejected("full".to_string());
        assert!(err.to_string().contains("full"));
    }

    #[test]
    fn test_queue_stats() {
        let stats = QueueStats {
            queue_name: "test".to_string(),
            pending: 10,
            processing: 5,
            dead_letter: 2,
        };

        assert_eq!(stats.total(), 17);
    }

    #[test]
    fn test_dead_letter_entry_structure() {
        let ticket = ticket();
        let entry = dead_letter_entry(&ticket, "store unreachable");

        assert_eq!(entry["error"], "store unreachable");
        assert_eq!(entry["ticket"]["id"], ticket.id.to_string());
        assert!(entry.get("moved_at").is_some());
    }

    /// Requires a running Redis at `REDIS_URL`.
    #[tokio::test]
    #[ignore]
    async fn test_enqueue_dequeue_complete() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".into());
        let name = format!("repose:test:{}", Uuid::new_v4());
        let queue = InvocationQueue::connect(&url, &name).await.unwrap();

        let ticket = ticket();
        queue.enqueue(&ticket).await.unwrap();
        assert_eq!(queue.len().await.unwrap(), 1);

        let got = queue.dequeue(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(got.id, ticket.id);
        assert_eq!(queue.processing_len().await.unwrap(), 1);

        queue.complete(got.id).await.unwrap();
        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.total(), 0);

        queue.clear().await.unwrap();
    }
}
