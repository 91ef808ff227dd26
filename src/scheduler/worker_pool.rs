//! Supervisor pool running processor invocations from the Redis queue.
//!
//! Each worker runs as an independent async task: it dequeues an
//! invocation ticket, runs one bounded [`BatchProcessor`] invocation and
//! acknowledges the ticket. Continuations dispatched by an invocation land
//! back on the same queue, so a long batch hops from worker to worker.
//!
//! # Features
//!
//! - Configurable number of workers
//! - Graceful shutdown with broadcast channel
//! - Ticket retry on infrastructure failure
//! - Dead letter list for tickets out of attempts
//! - Pool statistics tracking

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ProcessorConfig;
use crate::metrics::MetricsCollector;

use super::job::InvocationTicket;
use super::processor::{BatchProcessor, InvocationOutcome};
use super::queue::{InvocationQueue, QueueError};

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Failed to connect to the invocation queue.
    #[error("Queue connection failed: {0}")]
    QueueConnection(#[from] QueueError),

    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),

    /// An invocation failed.
    #[error("Invocation failed: {message}")]
    Invocation { message: String, retryable: bool },
}

impl PoolError {
    fn retryable(&self) -> bool {
        match self {
            PoolError::Invocation { retryable, .. } => *retryable,
            _ => true,
        }
    }
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks to spawn.
    pub num_workers: usize,
    /// Redis connection URL.
    pub redis_url: String,
    /// Name of the invocation queue.
    pub queue_name: String,
    /// How long a dequeue blocks when the queue is empty.
    pub poll_interval: Duration,
    /// Hard ceiling on one invocation, above its own time budget.
    pub invocation_timeout: Duration,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 2,
            redis_url: "redis://localhost:6379".to_string(),
            queue_name: "repose:invocations".to_string(),
            poll_interval: Duration::from_secs(1),
            invocation_timeout: Duration::from_secs(90),
            shutdown_timeout: Duration::from_secs(90),
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    /// Derives connection settings and timeouts from the processor config.
    ///
    /// An invocation gets its time budget plus the generator timeout, which
    /// bounds the last in-flight slice it is allowed to await.
    pub fn from_processor_config(config: &ProcessorConfig, num_workers: usize) -> Self {
        let invocation_timeout = config.time_budget + config.generator_timeout;
        Self {
            num_workers,
            redis_url: config.redis_url.clone(),
            queue_name: config.queue_name.clone(),
            invocation_timeout,
            shutdown_timeout: invocation_timeout,
            ..Default::default()
        }
    }

    /// Sets the Redis URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    /// Sets the queue name.
    pub fn with_queue_name(mut self, name: impl Into<String>) -> Self {
        self.queue_name = name.into();
        self
    }

    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the invocation timeout.
    pub fn with_invocation_timeout(mut self, timeout: Duration) -> Self {
        self.invocation_timeout = timeout;
        self
    }

    /// Sets the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of workers currently running an invocation.
    pub active_workers: usize,
    /// Invocations that ended normally (finished, continued or halted).
    pub invocations_completed: u64,
    /// Invocations that returned an error or timed out.
    pub invocations_failed: u64,
    /// Average invocation duration.
    pub average_invocation_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of invocations run.
    pub fn total_processed(&self) -> u64 {
        self.invocations_completed + self.invocations_failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.invocations_completed as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
struct SharedPoolStats {
    invocations_completed: AtomicU64,
    invocations_failed: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            invocations_completed: AtomicU64::new(0),
            invocations_failed: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
        }
    }

    fn record_completion(&self, duration: Duration) {
        self.invocations_completed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn record_failure(&self, duration: Duration) {
        self.invocations_failed.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn increment_active(&self) -> u64 {
        self.active_workers.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn decrement_active(&self) -> u64 {
        self.active_workers.fetch_sub(1, Ordering::SeqCst) - 1
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let completed = self.invocations_completed.load(Ordering::SeqCst);
        let failed = self.invocations_failed.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);
        let active = self.active_workers.load(Ordering::SeqCst);

        let total = completed + failed;
        let average_duration = if total > 0 {
            Duration::from_millis(total_duration_ms / total)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: active as usize,
            invocations_completed: completed,
            invocations_failed: failed,
            average_invocation_duration: average_duration,
        }
    }
}

/// Pool of workers running invocations from the queue.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    queue: Arc<InvocationQueue>,
    processor: Arc<BatchProcessor>,
    shutdown_tx: broadcast::Sender<()>,
    worker_handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
    is_running: AtomicBool,
}

impl WorkerPool {
    /// Creates a worker pool over an existing queue connection.
    ///
    /// The processor's continuation sink is normally the same queue.
    pub fn with_queue(
        config: WorkerPoolConfig,
        queue: Arc<InvocationQueue>,
        processor: Arc<BatchProcessor>,
    ) -> Self {
        // Buffer size of 1 is sufficient since we only send once
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            queue,
            processor,
            shutdown_tx,
            worker_handles: Vec::new(),
            stats: Arc::new(SharedPoolStats::new()),
            is_running: AtomicBool::new(false),
        }
    }

    /// Starts all workers in the pool.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running.
    pub async fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }

        // Tickets stuck in the processing list belong to workers that died.
        match self.queue.recover_processing().await {
            Ok(recovered) => {
                if recovered > 0 {
                    info!(recovered = recovered, "Recovered tickets from processing list");
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to recover processing tickets");
            }
        }

        for i in 0..self.config.num_workers {
            let worker = Worker::new(
                format!("worker-{}", i),
                Arc::clone(&self.queue),
                Arc::clone(&self.processor),
                self.shutdown_tx.subscribe(),
                self.config.poll_interval,
                self.config.invocation_timeout,
                Arc::clone(&self.stats),
            );

            let handle = tokio::spawn(async move {
                worker.run().await;
            });

            self.worker_handles.push(handle);
        }

        self.is_running.store(true, Ordering::SeqCst);
        info!(num_workers = self.config.num_workers, "Worker pool started");

        Ok(())
    }

    /// Signals all workers to stop and waits for their current invocation.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if workers don't stop within
    /// the configured timeout.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");

        // Workers may have already stopped
        let _ = self.shutdown_tx.send(());

        let shutdown_future = async {
            for handle in self.worker_handles.drain(..) {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        let result = tokio::time::timeout(self.config.shutdown_timeout, shutdown_future).await;
        self.is_running.store(false, Ordering::SeqCst);
        match result {
            Ok(()) => {
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.num_workers)
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }

    pub fn queue(&self) -> &Arc<InvocationQueue> {
        &self.queue
    }
}

/// A single worker pulling tickets from the queue.
pub struct Worker {
    id: String,
    queue: Arc<InvocationQueue>,
    processor: Arc<BatchProcessor>,
    shutdown_rx: broadcast::Receiver<()>,
    poll_interval: Duration,
    invocation_timeout: Duration,
    stats: Arc<SharedPoolStats>,
    metrics: MetricsCollector,
}

impl Worker {
    fn new(
        id: String,
        queue: Arc<InvocationQueue>,
        processor: Arc<BatchProcessor>,
        shutdown_rx: broadcast::Receiver<()>,
        poll_interval: Duration,
        invocation_timeout: Duration,
        stats: Arc<SharedPoolStats>,
    ) -> Self {
        Self {
            id,
            queue,
            processor,
            shutdown_rx,
            poll_interval,
            invocation_timeout,
            stats,
            metrics: MetricsCollector::new(),
        }
    }

    /// Polls for tickets until a shutdown signal is received.
    async fn run(mut self) {
        info!(worker_id = %self.id, "Worker started");

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(worker_id = %self.id, "Worker received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            match self.queue.dequeue(self.poll_interval).await {
                Ok(Some(ticket)) => {
                    self.process_ticket(ticket).await;
                }
                Ok(None) => {
                    debug!(worker_id = %self.id, "No tickets available");
                }
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Failed to dequeue ticket");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    async fn process_ticket(&self, mut ticket: InvocationTicket) {
        let ticket_id = ticket.id;
        let start_time = Instant::now();

        info!(
            worker_id = %self.id,
            ticket_id = %ticket_id,
            batch_id = %ticket.request.batch_id,
            continuation_depth = ticket.request.resume_context.continuation_depth,
            attempt = ticket.attempts + 1,
            "Processing invocation"
        );

        self.metrics
            .set_active_workers(self.stats.increment_active());
        ticket.increment_attempts();

        let result = self.invoke_with_timeout(&ticket).await;
        let duration = start_time.elapsed();

        self.metrics
            .set_active_workers(self.stats.decrement_active());

        match result {
            Ok(outcome) => {
                self.stats.record_completion(duration);
                if let Err(e) = self.queue.complete(ticket_id).await {
                    error!(
                        worker_id = %self.id,
                        ticket_id = %ticket_id,
                        error = %e,
                        "Failed to acknowledge ticket"
                    );
                }
                info!(
                    worker_id = %self.id,
                    ticket_id = %ticket_id,
                    outcome = ?outcome,
                    duration_ms = duration.as_millis(),
                    "Invocation completed"
                );
            }
            Err(e) => {
                self.stats.record_failure(duration);

                if e.retryable() && ticket.should_retry() {
                    warn!(
                        worker_id = %self.id,
                        ticket_id = %ticket_id,
                        error = %e,
                        remaining_attempts = ticket.remaining_attempts(),
                        "Invocation failed, requeueing"
                    );

                    if let Err(requeue_err) = self.queue.requeue(&ticket).await {
                        error!(
                            worker_id = %self.id,
                            ticket_id = %ticket_id,
                            error = %requeue_err,
                            "Failed to requeue ticket"
                        );
                    }
                } else {
                    error!(
                        worker_id = %self.id,
                        ticket_id = %ticket_id,
                        error = %e,
                        "Invocation failed, moving to dead letter list"
                    );

                    if let Err(dlq_err) = self.queue.dead_letter(&ticket, &e.to_string()).await {
                        error!(
                            worker_id = %self.id,
                            ticket_id = %ticket_id,
                            error = %dlq_err,
                            "Failed to dead-letter ticket"
                        );
                    }
                }
            }
        }

        match self.queue.len().await {
            Ok(depth) => self.metrics.set_queue_depth(self.queue.queue_name(), depth),
            Err(e) => debug!(worker_id = %self.id, error = %e, "Failed to read queue depth"),
        }
    }

    /// Runs the invocation, abandoning it after the configured timeout.
    ///
    /// An abandoned invocation leaves its runs `running`; the next sweep of
    /// the batch reclaims them.
    async fn invoke_with_timeout(
        &self,
        ticket: &InvocationTicket,
    ) -> Result<InvocationOutcome, PoolError> {
        match tokio::time::timeout(self.invocation_timeout, self.processor.process(&ticket.request))
            .await
        {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(e)) => Err(PoolError::Invocation {
                retryable: e.is_retryable(),
                message: e.to_string(),
            }),
            Err(_) => Err(PoolError::Invocation {
                retryable: true,
                message: format!("timed out after {:?}", self.invocation_timeout),
            }),
        }
    }

    /// Returns the worker's ID.
    pub fn id(&self) -> &str {
        &self.id
    }
}
