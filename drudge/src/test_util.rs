use std::{
    sync::{atomic::AtomicUsize, Arc, Mutex, MutexGuard},
    time::Duration,
};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use temp_dir::TempDir;
use uuid::Uuid;

use crate::{
    adapter::{FindOptions, JobRecord, NewJob},
    executor::Executor,
    job::BackgroundJob,
    job_registry::JobRegistry,
    sqlite::SqliteAdapter,
    worker::{Worker, WorkerBuilder},
    Adapter, Result,
};

pub(crate) struct TestContext {
    pub counter: AtomicUsize,
}

impl TestContext {
    pub fn new() -> Arc<TestContext> {
        Arc::new(TestContext {
            counter: AtomicUsize::new(0),
        })
    }
}

#[derive(Serialize, Deserialize)]
pub(crate) struct CounterJob {
    pub amount: usize,
}

impl BackgroundJob for CounterJob {
    const NAME: &'static str = "counter";
    type Context = Arc<TestContext>;

    async fn perform(&self, context: Arc<TestContext>) -> eyre::Result<()> {
        context
            .counter
            .fetch_add(self.amount, std::sync::atomic::Ordering::Relaxed);
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
pub(crate) struct BoomJob;

impl BackgroundJob for BoomJob {
    const NAME: &'static str = "boom";
    type Context = Arc<TestContext>;

    async fn perform(&self, _context: Arc<TestContext>) -> eyre::Result<()> {
        Err(eyre::eyre!("boom"))
    }
}

#[derive(Serialize, Deserialize)]
pub(crate) struct PanicJob;

impl BackgroundJob for PanicJob {
    const NAME: &'static str = "panic";
    type Context = Arc<TestContext>;

    async fn perform(&self, _context: Arc<TestContext>) -> eyre::Result<()> {
        panic!("deliberate panic");
    }
}

#[derive(Serialize, Deserialize)]
pub(crate) struct SleepJob {
    pub millis: u64,
}

impl BackgroundJob for SleepJob {
    const NAME: &'static str = "sleep";
    type Context = Arc<TestContext>;

    async fn perform(&self, context: Arc<TestContext>) -> eyre::Result<()> {
        tokio::time::sleep(Duration::from_millis(self.millis)).await;
        context
            .counter
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(())
    }
}

/// Hangs on its first attempt, completes instantly afterwards. For tests that
/// interrupt a worker mid-job and let another one reclaim the stale lock.
#[derive(Serialize, Deserialize)]
pub(crate) struct SlowFirstTryJob;

impl BackgroundJob for SlowFirstTryJob {
    const NAME: &'static str = "slow_first_try";
    type Context = Arc<TestContext>;

    async fn perform(&self, context: Arc<TestContext>) -> eyre::Result<()> {
        let tries = context
            .counter
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        if tries == 0 {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        Ok(())
    }
}

/// Build a [NewJob] from a job class instance, applying the class defaults.
pub(crate) fn spec_for<J>(job: &J) -> NewJob
where
    J: BackgroundJob<Context = Arc<TestContext>>,
{
    J::set().new_job(job).expect("serializing job args")
}

pub(crate) async fn create_test_adapter(dir: &TempDir) -> Arc<SqliteAdapter> {
    Lazy::force(&TRACING);
    Arc::new(
        SqliteAdapter::new(dir.child("test.sqlite"))
            .await
            .expect("opening test adapter"),
    )
}

pub(crate) struct TestEnvironment {
    pub adapter: Arc<SqliteAdapter>,
    pub registry: Arc<JobRegistry<Arc<TestContext>>>,
    pub context: Arc<TestContext>,
    #[allow(dead_code)]
    dir: TempDir,
}

impl TestEnvironment {
    pub async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let adapter = create_test_adapter(&dir).await;

        let mut registry = JobRegistry::new();
        registry.add::<CounterJob>();
        registry.add::<BoomJob>();
        registry.add::<PanicJob>();
        registry.add::<SleepJob>();
        registry.add::<SlowFirstTryJob>();

        TestEnvironment {
            adapter,
            registry: Arc::new(registry),
            context: TestContext::new(),
            dir,
        }
    }

    pub fn worker(&self) -> WorkerBuilder<Arc<TestContext>> {
        Worker::builder(self.adapter.clone(), self.context.clone())
            .registry(self.registry.clone())
            .wait_time(Duration::from_millis(50))
    }

    pub async fn schedule(&self, job: NewJob) -> Result<JobRecord> {
        self.adapter.schedule(job).await
    }

    /// Claim one job the way a worker named `process_name` would.
    pub async fn claim(&self, process_name: &str) -> Option<JobRecord> {
        self.adapter
            .find(&FindOptions {
                process_name: process_name.to_string(),
                max_runtime: Duration::from_secs(4 * 60 * 60),
                queue: None,
            })
            .await
            .expect("claiming job")
    }

    pub fn executor(&self, record: JobRecord) -> Executor<Arc<TestContext>> {
        Executor::new(
            self.adapter.clone(),
            self.registry.clone(),
            record,
            self.context.clone(),
        )
    }
}

/// Serializes tests that touch the process-wide scheduler configuration.
pub(crate) fn scheduler_lock() -> MutexGuard<'static, ()> {
    static LOCK: Mutex<()> = Mutex::new(());
    LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

/// Poll a job row until `accept` is satisfied, returning the matching record.
/// Worker tests cannot observe claim and outcome transitions synchronously,
/// so they watch the row itself. Panics if the row is deleted or the
/// condition is not reached within a few seconds.
pub(crate) async fn wait_for_record<F>(
    label: &str,
    adapter: &SqliteAdapter,
    id: Uuid,
    accept: F,
) -> JobRecord
where
    F: Fn(&JobRecord) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);

    loop {
        match adapter.get(id).await.expect("reading job record") {
            Some(record) if accept(&record) => return record,
            Some(record) => {
                tracing::trace!(label, job_id = %id, attempts = record.attempts, "record not there yet");
            }
            None => panic!("job {id} disappeared while waiting for {label}"),
        }

        if tokio::time::Instant::now() >= deadline {
            panic!("gave up waiting for {label} on job {id}");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Opt-in test logging: set `TEST_LOG` to see worker and adapter events,
/// filtered like any other binary via `RUST_LOG`.
pub(crate) static TRACING: Lazy<()> = Lazy::new(|| {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    if std::env::var("TEST_LOG").is_err() {
        return;
    }

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .init();
});
