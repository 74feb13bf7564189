use std::{
    sync::atomic::{AtomicU64, Ordering},
    sync::Arc,
    time::Duration,
};

use tokio::sync::watch;
use tracing::{event, Level};

use crate::{
    adapter::{Adapter, FindOptions},
    executor::{ExecutionOutcome, Executor},
    job_registry::JobRegistry,
    Result, DEFAULT_MAX_ATTEMPTS,
};

/// How long a worker sleeps between polls that find nothing.
pub const DEFAULT_WAIT_TIME: Duration = Duration::from_secs(5);
/// How long a claim may be held before other workers treat it as abandoned.
pub const DEFAULT_MAX_RUNTIME: Duration = Duration::from_secs(4 * 60 * 60);

static WORKER_SEQ: AtomicU64 = AtomicU64::new(0);

fn default_process_name(queue: Option<&str>) -> String {
    let seq = WORKER_SEQ.fetch_add(1, Ordering::Relaxed);
    let pid = std::process::id();
    match queue {
        Some(q) => format!("drudge-worker.{q}.{pid}-{seq}"),
        None => format!("drudge-worker.{pid}-{seq}"),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shutdown {
    Running,
    /// Finish the job in flight, then exit.
    Draining,
    /// Exit now. Any job in flight keeps its lock until it goes stale.
    Stopped,
}

/// Requests shutdown of a running [Worker] from another task, typically a
/// signal handler.
#[derive(Clone)]
pub struct WorkerHandle {
    tx: watch::Sender<Shutdown>,
}

impl WorkerHandle {
    /// Graceful shutdown: the worker finishes the job in flight (if any),
    /// records its outcome, and then exits. SIGINT semantics.
    pub fn drain(&self) {
        self.tx.send_replace(Shutdown::Draining);
    }

    /// Immediate shutdown: the worker abandons any job in flight without
    /// recording an outcome; the stale lock is reclaimed by another worker
    /// after `max_runtime`. SIGTERM semantics.
    pub fn stop(&self) {
        self.tx.send_replace(Shutdown::Stopped);
    }
}

/// Tallies for one worker run.
#[derive(Debug, Default, Clone, Copy)]
pub struct WorkerCounts {
    /// Jobs claimed from the store.
    pub claimed: u64,
    /// Jobs whose `perform` completed successfully.
    pub succeeded: u64,
    /// Jobs whose attempt failed and was recorded for retry or terminally.
    pub failed: u64,
}

/// A single-queue polling loop: claim one job, execute it, repeat; sleep when
/// the store has nothing eligible.
///
/// Run several workers (in one process or many) against the same store for
/// parallelism. Claim exclusivity is enforced by the adapter, not by worker
/// coordination.
pub struct Worker<CONTEXT>
where
    CONTEXT: Send + Sync + Clone + 'static,
{
    adapter: Arc<dyn Adapter>,
    registry: Arc<JobRegistry<CONTEXT>>,
    context: CONTEXT,
    process_name: String,
    queue: Option<String>,
    max_attempts: i32,
    max_runtime: Duration,
    wait_time: Duration,
    workoff: bool,
    forever: bool,
    clear: bool,
    shutdown_tx: watch::Sender<Shutdown>,
    shutdown_rx: watch::Receiver<Shutdown>,
}

impl<CONTEXT> Worker<CONTEXT>
where
    CONTEXT: Send + Sync + Clone + 'static,
{
    /// Create a [WorkerBuilder].
    pub fn builder(adapter: Arc<dyn Adapter>, context: CONTEXT) -> WorkerBuilder<CONTEXT> {
        WorkerBuilder::new(adapter, context)
    }

    /// The name this worker claims jobs under (`locked_by`).
    pub fn process_name(&self) -> &str {
        &self.process_name
    }

    /// A handle for requesting shutdown while [run](Worker::run) is in
    /// progress.
    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Run the poll loop until shutdown, or until the queue is drained when
    /// `workoff` is set.
    pub async fn run(mut self) -> Result<WorkerCounts> {
        let mut counts = WorkerCounts::default();

        if self.clear {
            self.adapter.clear().await?;
            return Ok(counts);
        }

        let find_options = FindOptions {
            process_name: self.process_name.clone(),
            max_runtime: self.max_runtime,
            queue: self.queue.clone(),
        };

        event!(
            Level::INFO,
            process_name = %self.process_name,
            queue = ?self.queue,
            workoff = self.workoff,
            "starting worker"
        );

        loop {
            if *self.shutdown_rx.borrow() == Shutdown::Stopped {
                break;
            }

            match self.adapter.find(&find_options).await {
                Ok(Some(mut record)) => {
                    record.max_attempts.get_or_insert(self.max_attempts);
                    counts.claimed += 1;

                    let executor = Executor::new(
                        self.adapter.clone(),
                        self.registry.clone(),
                        record,
                        self.context.clone(),
                    );
                    let mut stop_rx = self.shutdown_rx.clone();

                    tokio::select! {
                        biased;
                        _ = stop_requested(&mut stop_rx) => {
                            event!(
                                Level::WARN,
                                process_name = %self.process_name,
                                "hard stop requested, abandoning job in flight"
                            );
                            break;
                        }
                        outcome = executor.perform() => match outcome {
                            Ok(ExecutionOutcome::Succeeded) => counts.succeeded += 1,
                            Ok(ExecutionOutcome::Failed) => counts.failed += 1,
                            Err(e) => {
                                event!(Level::ERROR, error = %e, "error recording job outcome");
                            }
                        }
                    }
                }
                Ok(None) => {
                    if self.workoff {
                        event!(Level::INFO, process_name = %self.process_name, "queue empty, exiting");
                        break;
                    }
                    self.idle().await;
                }
                Err(e) => {
                    event!(Level::ERROR, error = %e, "failed to poll for jobs");
                    self.idle().await;
                }
            }

            if *self.shutdown_rx.borrow() != Shutdown::Running {
                event!(Level::INFO, process_name = %self.process_name, "drained, exiting");
                break;
            }

            if !self.forever {
                break;
            }
        }

        event!(
            Level::INFO,
            process_name = %self.process_name,
            claimed = counts.claimed,
            succeeded = counts.succeeded,
            failed = counts.failed,
            "worker exiting"
        );

        Ok(counts)
    }

    /// Sleep for `wait_time`, waking early on any shutdown request.
    async fn idle(&mut self) {
        let sleep = tokio::time::sleep(self.wait_time);
        tokio::pin!(sleep);
        let mut rx = self.shutdown_rx.clone();

        tokio::select! {
            biased;
            _ = shutdown_requested(&mut rx) => {}
            _ = &mut sleep => {}
        }
    }
}

async fn shutdown_requested(rx: &mut watch::Receiver<Shutdown>) {
    loop {
        if *rx.borrow_and_update() != Shutdown::Running {
            return;
        }
        if rx.changed().await.is_err() {
            // All handles dropped; nobody can ever request shutdown.
            std::future::pending::<()>().await;
        }
    }
}

async fn stop_requested(rx: &mut watch::Receiver<Shutdown>) {
    loop {
        if *rx.borrow_and_update() == Shutdown::Stopped {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// A builder for a [Worker].
pub struct WorkerBuilder<CONTEXT>
where
    CONTEXT: Send + Sync + Clone + 'static,
{
    adapter: Arc<dyn Adapter>,
    context: CONTEXT,
    registry: Option<Arc<JobRegistry<CONTEXT>>>,
    process_name: Option<String>,
    queue: Option<String>,
    max_attempts: i32,
    max_runtime: Duration,
    wait_time: Duration,
    workoff: bool,
    forever: bool,
    clear: bool,
}

impl<CONTEXT> WorkerBuilder<CONTEXT>
where
    CONTEXT: Send + Sync + Clone + 'static,
{
    /// Create a builder with the engine defaults.
    pub fn new(adapter: Arc<dyn Adapter>, context: CONTEXT) -> Self {
        Self {
            adapter,
            context,
            registry: None,
            process_name: None,
            queue: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_runtime: DEFAULT_MAX_RUNTIME,
            wait_time: DEFAULT_WAIT_TIME,
            workoff: false,
            forever: true,
            clear: false,
        }
    }

    /// The job classes this worker can run.
    pub fn registry(mut self, registry: Arc<JobRegistry<CONTEXT>>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Override the generated process name recorded in `locked_by`.
    pub fn process_name(mut self, process_name: impl ToString) -> Self {
        self.process_name = Some(process_name.to_string());
        self
    }

    /// Claim only from this queue. Defaults to claiming from every queue.
    pub fn queue(mut self, queue: impl ToString) -> Self {
        self.queue = Some(queue.to_string());
        self
    }

    /// Retry cap applied to jobs that did not record their own.
    pub fn max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// The stale-lock threshold for claims made by this worker.
    pub fn max_runtime(mut self, max_runtime: Duration) -> Self {
        self.max_runtime = max_runtime;
        self
    }

    /// How long to sleep after an empty poll.
    pub fn wait_time(mut self, wait_time: Duration) -> Self {
        self.wait_time = wait_time;
        self
    }

    /// Exit once a poll finds the queue empty instead of sleeping.
    pub fn workoff(mut self, workoff: bool) -> Self {
        self.workoff = workoff;
        self
    }

    /// When false, the worker performs a single poll cycle and exits. On by
    /// default.
    pub fn forever(mut self, forever: bool) -> Self {
        self.forever = forever;
        self
    }

    /// Delete every job and exit immediately instead of polling.
    pub fn clear(mut self, clear: bool) -> Self {
        self.clear = clear;
        self
    }

    /// Build the worker.
    pub fn build(self) -> Worker<CONTEXT> {
        let registry = self.registry.expect("Must set a registry");
        let process_name = self
            .process_name
            .unwrap_or_else(|| default_process_name(self.queue.as_deref()));
        let (shutdown_tx, shutdown_rx) = watch::channel(Shutdown::Running);

        Worker {
            adapter: self.adapter,
            registry,
            context: self.context,
            process_name,
            queue: self.queue,
            max_attempts: self.max_attempts,
            max_runtime: self.max_runtime,
            wait_time: self.wait_time,
            workoff: self.workoff,
            forever: self.forever,
            clear: self.clear,
            shutdown_tx,
            shutdown_rx,
        }
    }
}
