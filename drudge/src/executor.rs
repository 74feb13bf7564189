use std::{panic::AssertUnwindSafe, sync::Arc};

use futures::FutureExt;
use tracing::{event, Level};

use crate::{
    adapter::{Adapter, JobRecord},
    error::PerformError,
    job_registry::JobRegistry,
    Result,
};

/// What happened to the job an [Executor] ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// `perform` returned Ok and the record was removed.
    Succeeded,
    /// `perform` failed (or could not be dispatched) and the failure was
    /// persisted for retry or terminal failure.
    Failed,
}

/// Runs a single claimed [JobRecord]: resolves the handler, invokes the job
/// class, and routes the outcome back through the adapter.
///
/// One executor is constructed per execution. Perform-side errors are
/// persisted via [Adapter::failure] and never re-raised; only adapter I/O
/// errors propagate to the caller.
pub struct Executor<CONTEXT>
where
    CONTEXT: Send + Sync + Clone + 'static,
{
    adapter: Arc<dyn Adapter>,
    registry: Arc<JobRegistry<CONTEXT>>,
    record: JobRecord,
    context: CONTEXT,
}

impl<CONTEXT> Executor<CONTEXT>
where
    CONTEXT: Send + Sync + Clone + 'static,
{
    /// Create an executor for one claimed record.
    pub fn new(
        adapter: Arc<dyn Adapter>,
        registry: Arc<JobRegistry<CONTEXT>>,
        record: JobRecord,
        context: CONTEXT,
    ) -> Self {
        Executor {
            adapter,
            registry,
            record,
            context,
        }
    }

    /// Run the job to completion and record its outcome.
    pub async fn perform(self) -> Result<ExecutionOutcome> {
        let payload = match self.record.payload() {
            Ok(payload) => payload,
            Err(e) => {
                return self.record_failure(PerformError::InvalidPayload(e)).await;
            }
        };

        let Some(runner) = self.registry.get(&payload.handler) else {
            return self
                .record_failure(PerformError::NotRegistered(payload.handler))
                .await;
        };

        event!(
            Level::INFO,
            job_id = %self.record.id,
            handler = %payload.handler,
            attempts = self.record.attempts,
            "running job"
        );

        let future = (runner.runner)(payload.args, self.context.clone());
        let result = AssertUnwindSafe(future).catch_unwind().await;

        match result {
            Ok(Ok(())) => {
                self.adapter.success(&self.record).await?;
                Ok(ExecutionOutcome::Succeeded)
            }
            Ok(Err(e)) => self.record_failure(e).await,
            Err(panic) => {
                self.record_failure(PerformError::Panicked(panic_message(panic)))
                    .await
            }
        }
    }

    async fn record_failure(self, error: PerformError) -> Result<ExecutionOutcome> {
        event!(
            Level::WARN,
            job_id = %self.record.id,
            error = %error,
            "job attempt failed"
        );
        self.adapter.failure(&self.record, &error).await?;
        Ok(ExecutionOutcome::Failed)
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "Panic".to_string()
    }
}
