use std::sync::Arc;

use ahash::HashMap;
use futures::{future::BoxFuture, FutureExt};

use crate::{error::PerformError, job::BackgroundJob, SmartString};

pub(crate) type RunnerFn<CONTEXT> = Arc<
    dyn Fn(serde_json::Value, CONTEXT) -> BoxFuture<'static, Result<(), PerformError>>
        + Send
        + Sync,
>;

/// The set of job classes a worker can run, keyed by handler name.
///
/// Populate the registry at startup with every class the worker should
/// handle. A claimed record whose handler has no entry is routed to
/// [Adapter::failure](crate::Adapter::failure) rather than crashing the
/// worker.
pub struct JobRegistry<CONTEXT>
where
    CONTEXT: Send + Sync + Clone + 'static,
{
    pub(crate) jobs: HashMap<SmartString, JobRunner<CONTEXT>>,
}

impl<CONTEXT> Default for JobRegistry<CONTEXT>
where
    CONTEXT: Send + Sync + Clone + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<CONTEXT> JobRegistry<CONTEXT>
where
    CONTEXT: Send + Sync + Clone + 'static,
{
    /// Create an empty registry.
    pub fn new() -> Self {
        JobRegistry {
            jobs: HashMap::default(),
        }
    }

    /// Register a job class under its [BackgroundJob::NAME].
    pub fn add<J>(&mut self)
    where
        J: BackgroundJob<Context = CONTEXT>,
    {
        self.add_runner(JobRunner::from_class::<J>());
    }

    /// Register a prebuilt [JobRunner].
    pub fn add_runner(&mut self, runner: JobRunner<CONTEXT>) {
        self.jobs
            .entry(runner.name.clone())
            .and_modify(|_| {
                panic!("Job {} already exists", runner.name);
            })
            .or_insert(runner);
    }

    pub(crate) fn get(&self, name: &str) -> Option<&JobRunner<CONTEXT>> {
        self.jobs.get(name)
    }

    /// The registered handler names.
    pub fn handlers(&self) -> impl Iterator<Item = &str> {
        self.jobs.keys().map(|k| k.as_str())
    }
}

/// A type-erased runner for one job class: deserializes the persisted
/// arguments and invokes `perform`.
#[derive(Clone)]
pub struct JobRunner<CONTEXT>
where
    CONTEXT: Send + Sync + Clone + 'static,
{
    pub(crate) name: SmartString,
    pub(crate) runner: RunnerFn<CONTEXT>,
}

impl<CONTEXT> JobRunner<CONTEXT>
where
    CONTEXT: Send + Sync + Clone + 'static,
{
    /// Build a runner from a [BackgroundJob] implementation.
    pub fn from_class<J>() -> Self
    where
        J: BackgroundJob<Context = CONTEXT>,
    {
        let runner = Arc::new(
            move |args: serde_json::Value,
                  context: CONTEXT|
                  -> BoxFuture<'static, Result<(), PerformError>> {
                async move {
                    let job: J =
                        serde_json::from_value(args).map_err(|e| PerformError::InvalidArgs {
                            handler: J::NAME.to_string(),
                            source: e,
                        })?;
                    job.perform(context).await.map_err(PerformError::Failed)
                }
                .boxed()
            },
        );

        JobRunner {
            name: SmartString::from(J::NAME),
            runner,
        }
    }
}
