//! Dispatch executor.
//!
//! A fixed pool of tokio workers pulls [`Task`]s from one shared queue. A
//! task that answers [`Outcome::Retry`] is queued again after the configured
//! delay. A task that reports itself [blocked](Task::blocked_on) is parked
//! until its wakeup fires; parking is not a retry and costs no budget. Both
//! waits run in their own tokio task so no worker is held.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::config::ExecutorConfig;

// ---------------------------------------------------------------------------
// Task trait
// ---------------------------------------------------------------------------

/// Result of one attempt at running a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Fully handled; any response has been published.
    Done,
    /// Precondition not met; run again later. Nothing was published.
    Retry,
}

/// Why a task was given up on without completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbandonReason {
    /// `max_retries` was exceeded.
    RetryBudget { attempts: u32 },
    /// The executor stopped while the task was queued, parked or waiting to
    /// retry.
    Shutdown,
}

/// Resolves when a blocked task may make progress.
pub type Wakeup = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Unit of work run by the [`Executor`].
///
/// Tasks must not panic; code that may panic has to be isolated by the task
/// itself.
#[async_trait]
pub trait Task: Send + 'static {
    async fn run(&mut self) -> Outcome;

    /// Checked before every run. `Some` parks the task until the wakeup
    /// resolves, then queues it again. Default is never blocked.
    fn blocked_on(&self) -> Option<Wakeup> {
        None
    }

    /// Called exactly once instead of a final `Done` when the task will not
    /// run again. Default is a no-op.
    async fn abandon(&mut self, _reason: AbandonReason) {}
}

/// Errors returned by [`Executor::submit`].
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("executor is stopped")]
    Stopped,
}

// ---------------------------------------------------------------------------
// In-flight tracking
// ---------------------------------------------------------------------------

/// RAII guard that decrements the in-flight counter when dropped.
///
/// Each submitted task carries one from `submit` until it finishes or is
/// abandoned, including while it is parked or sits in a retry delay.
#[derive(Debug)]
struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl InFlightGuard {
    fn new(in_flight: &Arc<AtomicU64>) -> Self {
        in_flight.fetch_add(1, Ordering::Relaxed);
        Self {
            in_flight: Arc::clone(in_flight),
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

struct Job {
    task: Box<dyn Task>,
    retries: u32,
    _guard: InFlightGuard,
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

struct Shared {
    config: ExecutorConfig,
    tx: mpsc::UnboundedSender<Job>,
    in_flight: Arc<AtomicU64>,
    stopped: AtomicBool,
    shutdown: watch::Sender<bool>,
}

/// Worker pool with retry support.
///
/// The queue is unbounded: the transport loop must never block on a full
/// queue, and every accepted task is either completed or abandoned.
pub struct Executor {
    shared: Arc<Shared>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Job>>>,
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Executor {
    /// Spawns `config.workers` workers (at least one). Must be called inside
    /// a tokio runtime.
    #[must_use]
    pub fn start(config: ExecutorConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        let worker_count = config.workers.max(1);
        let shared = Arc::new(Shared {
            config,
            tx,
            in_flight: Arc::new(AtomicU64::new(0)),
            stopped: AtomicBool::new(false),
            shutdown,
        });
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let workers = (0..worker_count)
            .map(|index| tokio::spawn(worker_loop(index, Arc::clone(&rx), Arc::clone(&shared))))
            .collect();

        debug!(workers = worker_count, "executor started");
        Self {
            shared,
            rx,
            workers: parking_lot::Mutex::new(workers),
        }
    }

    /// Queues a task.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutorError::Stopped`] after [`stop`](Self::stop); the task
    /// has been abandoned with [`AbandonReason::Shutdown`] by then.
    pub async fn submit<T: Task>(&self, task: T) -> Result<(), ExecutorError> {
        let mut task: Box<dyn Task> = Box::new(task);
        if self.shared.stopped.load(Ordering::Acquire) {
            task.abandon(AbandonReason::Shutdown).await;
            return Err(ExecutorError::Stopped);
        }
        let job = Job {
            task,
            retries: 0,
            _guard: InFlightGuard::new(&self.shared.in_flight),
        };
        if let Err(mpsc::error::SendError(mut job)) = self.shared.tx.send(job) {
            job.task.abandon(AbandonReason::Shutdown).await;
            return Err(ExecutorError::Stopped);
        }
        Ok(())
    }

    /// Tasks submitted and not yet finished or abandoned.
    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.shared.in_flight.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    /// Stops accepting work, lets running tasks finish, joins the workers,
    /// and abandons everything still queued or waiting to retry.
    pub async fn stop(&self) {
        if self.shared.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.shutdown.send_replace(true);

        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "executor worker ended abnormally");
            }
        }

        let deadline = tokio::time::Instant::now() + self.shared.config.drain_timeout;
        loop {
            while let Some(mut job) = self.next_queued().await {
                job.task.abandon(AbandonReason::Shutdown).await;
            }
            if self.in_flight() == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(in_flight = self.in_flight(), "executor drain timed out");
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        debug!("executor stopped");
    }

    async fn next_queued(&self) -> Option<Job> {
        self.rx.lock().await.try_recv().ok()
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.shared.stopped.store(true, Ordering::Release);
        self.shared.shutdown.send_replace(true);
    }
}

async fn worker_loop(
    index: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Job>>>,
    shared: Arc<Shared>,
) {
    let mut shutdown = shared.shutdown.subscribe();
    loop {
        let job = tokio::select! {
            biased;
            () = shutdown_requested(&mut shutdown) => break,
            job = async { rx.lock().await.recv().await } => job,
        };
        let Some(job) = job else { break };
        execute(&shared, job).await;
    }
    debug!(worker = index, "executor worker exited");
}

/// Resolves once shutdown is signalled or the signal's sender is gone.
pub(crate) async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

async fn execute(shared: &Arc<Shared>, mut job: Job) {
    if let Some(wakeup) = job.task.blocked_on() {
        requeue_after(shared, job, wakeup);
        return;
    }
    match job.task.run().await {
        Outcome::Done => {}
        Outcome::Retry => schedule_retry(shared, job).await,
    }
}

async fn schedule_retry(shared: &Arc<Shared>, mut job: Job) {
    job.retries += 1;
    metrics::counter!("nodewire_retries_total").increment(1);

    if let Some(max) = shared.config.max_retries {
        if job.retries > max {
            warn!(attempts = job.retries, "retry budget exhausted, abandoning task");
            job.task
                .abandon(AbandonReason::RetryBudget {
                    attempts: job.retries,
                })
                .await;
            return;
        }
    }

    requeue_after(shared, job, tokio::time::sleep(shared.config.retry_delay));
}

/// Queues `job` again once `wait` resolves, or abandons it on shutdown.
fn requeue_after(
    shared: &Arc<Shared>,
    mut job: Job,
    wait: impl Future<Output = ()> + Send + 'static,
) {
    let tx = shared.tx.clone();
    let mut shutdown = shared.shutdown.subscribe();
    tokio::spawn(async move {
        tokio::select! {
            biased;
            () = shutdown_requested(&mut shutdown) => {
                job.task.abandon(AbandonReason::Shutdown).await;
            }
            () = wait => {
                if let Err(mpsc::error::SendError(mut job)) = tx.send(job) {
                    job.task.abandon(AbandonReason::Shutdown).await;
                }
            }
        }
    });
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
