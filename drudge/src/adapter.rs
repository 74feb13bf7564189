use std::{borrow::Cow, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{error::PerformError, Result};

/// Queue used when a job class does not declare one.
pub const DEFAULT_QUEUE: &str = "default";
/// Priority used when a job class does not declare one. Priorities run from
/// 1 (most urgent) to 100 (least urgent).
pub const DEFAULT_PRIORITY: i32 = 50;
/// Retry cap used when neither the job class nor the worker declares one.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 24;

/// The delay before a failed job's next attempt.
///
/// A quartic polynomial of the attempt count: one second times the fourth
/// power of the attempts completed so far. At the default cap of 24 attempts
/// the final interval is roughly 3.8 days.
pub fn backoff_interval(attempts: i32) -> Duration {
    let n = attempts.max(0) as u64;
    Duration::from_millis(1000 * n.pow(4))
}

/// The gateway to durable job state. All mutation of the store happens
/// through these five operations.
///
/// The crate ships [SqliteAdapter](crate::SqliteAdapter) as the reference
/// implementation; any store that can perform a conditional update can back
/// this trait.
#[async_trait]
pub trait Adapter: Send + Sync + 'static {
    /// Persist a new job. Failures are reported as
    /// [Error::Scheduling](crate::Error::Scheduling) wrapping the cause.
    async fn schedule(&self, job: NewJob) -> Result<JobRecord>;

    /// Atomically claim one runnable job for `options.process_name`, or
    /// return `None` when nothing is eligible. Two concurrent callers can
    /// never both receive the same record.
    async fn find(&self, options: &FindOptions) -> Result<Option<JobRecord>>;

    /// Remove a completed job from the store.
    async fn success(&self, record: &JobRecord) -> Result<()>;

    /// Record a failed attempt: clear the lock and either reschedule with
    /// backoff or, when the attempt cap is exhausted, mark the job terminally
    /// failed.
    async fn failure(&self, record: &JobRecord, error: &PerformError) -> Result<()>;

    /// Delete every job. For tests and administrative use.
    async fn clear(&self) -> Result<()>;
}

/// Options for [Adapter::find].
#[derive(Debug, Clone)]
pub struct FindOptions {
    /// Identity recorded in `locked_by` for claims made through these options.
    pub process_name: String,
    /// How long a worker may hold a claim before other workers treat the lock
    /// as abandoned and reclaim the job.
    pub max_runtime: Duration,
    /// Restrict claims to a single queue. `None` claims from every queue.
    pub queue: Option<String>,
}

/// A job to be submitted to the store via [Adapter::schedule].
#[derive(Debug, Clone)]
pub struct NewJob {
    /// The handler name, matching a registered
    /// [BackgroundJob::NAME](crate::BackgroundJob::NAME).
    pub handler: Cow<'static, str>,
    /// Arguments passed to `perform`, as a JSON value.
    pub args: serde_json::Value,
    /// The queue to place the job on.
    pub queue: String,
    /// 1 is most urgent, 100 least. Claims are served in ascending order.
    pub priority: i32,
    /// Earliest moment the job may run. `None` means immediately.
    pub run_at: Option<OffsetDateTime>,
    /// Per-job retry cap. `None` falls back to the worker's cap.
    pub max_attempts: Option<i32>,
}

impl Default for NewJob {
    fn default() -> Self {
        Self {
            handler: Default::default(),
            args: serde_json::Value::Null,
            queue: DEFAULT_QUEUE.to_string(),
            priority: DEFAULT_PRIORITY,
            run_at: None,
            max_attempts: None,
        }
    }
}

impl NewJob {
    /// Create a [NewJobBuilder] for the given handler name.
    pub fn builder(handler: impl Into<Cow<'static, str>>) -> NewJobBuilder {
        NewJobBuilder::new(handler)
    }
}

/// A builder for a job to submit to the store.
pub struct NewJobBuilder {
    job: NewJob,
}

impl NewJobBuilder {
    /// Create a new builder.
    pub fn new(handler: impl Into<Cow<'static, str>>) -> Self {
        Self {
            job: NewJob {
                handler: handler.into(),
                ..Default::default()
            },
        }
    }

    /// Serialize the job's arguments using `serde_json`.
    pub fn json_args<T: ?Sized + Serialize>(mut self, args: &T) -> Result<Self> {
        self.job.args = serde_json::to_value(args).map_err(crate::Error::Payload)?;
        Ok(self)
    }

    /// Set the queue for the job.
    pub fn queue(mut self, queue: impl ToString) -> Self {
        self.job.queue = queue.to_string();
        self
    }

    /// Set the priority of the job.
    pub fn priority(mut self, priority: i32) -> Self {
        assert!(
            (1..=100).contains(&priority),
            "priority must be between 1 and 100"
        );
        self.job.priority = priority;
        self
    }

    /// Set the time at which the job should run.
    pub fn run_at(mut self, run_at: OffsetDateTime) -> Self {
        self.job.run_at = Some(run_at);
        self
    }

    /// Cap the number of attempts for this job.
    pub fn max_attempts(mut self, max_attempts: i32) -> Self {
        self.job.max_attempts = Some(max_attempts);
        self
    }

    /// Build the job.
    pub fn build(self) -> NewJob {
        self.job
    }

    /// Build the job and submit it through the configured
    /// [scheduler](crate::scheduler).
    pub async fn schedule(self) -> Result<JobRecord> {
        crate::scheduler::schedule(self.job).await
    }
}

/// The serialized form stored in a [JobRecord]'s `handler` column: the
/// handler name and its arguments as one blob.
#[derive(Debug, Serialize, Deserialize)]
pub struct HandlerPayload {
    /// Registered handler name.
    pub handler: String,
    /// Arguments for `perform`.
    pub args: serde_json::Value,
}

/// One persisted job invocation.
#[derive(Debug, Clone)]
pub struct JobRecord {
    /// Primary key.
    pub id: Uuid,
    /// The serialized [HandlerPayload] blob. Decode with [JobRecord::payload].
    pub handler: String,
    /// The queue the job belongs to.
    pub queue: String,
    /// 1 most urgent, 100 least.
    pub priority: i32,
    /// Earliest eligible run time. `None` only for terminally failed jobs.
    pub run_at: Option<OffsetDateTime>,
    /// When a worker claimed the job.
    pub locked_at: Option<OffsetDateTime>,
    /// The claiming worker's process name.
    pub locked_by: Option<String>,
    /// Execution attempts so far, including the one in flight.
    pub attempts: i32,
    /// Retry cap recorded at scheduling time.
    pub max_attempts: Option<i32>,
    /// Rendered error from the most recent failed attempt.
    pub last_error: Option<String>,
    /// Set when the retry cap was exhausted. Terminal.
    pub failed_at: Option<OffsetDateTime>,
    /// Row creation time.
    pub created_at: OffsetDateTime,
    /// Last mutation time; also the freshness token for conditional updates.
    pub updated_at: OffsetDateTime,
}

impl JobRecord {
    /// Decode the persisted handler blob.
    pub fn payload(&self) -> Result<HandlerPayload, serde_json::Error> {
        serde_json::from_str(&self.handler)
    }

    /// The retry cap for this record, with `fallback` applied when none was
    /// recorded at scheduling time.
    pub fn attempt_cap(&self, fallback: i32) -> i32 {
        self.max_attempts.unwrap_or(fallback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_quartic() {
        assert_eq!(backoff_interval(0), Duration::from_millis(0));
        assert_eq!(backoff_interval(1), Duration::from_millis(1_000));
        assert_eq!(backoff_interval(2), Duration::from_millis(16_000));
        assert_eq!(backoff_interval(3), Duration::from_millis(81_000));
        assert_eq!(backoff_interval(20), Duration::from_millis(160_000_000));
        assert_eq!(backoff_interval(24), Duration::from_millis(331_776_000));
    }

    #[test]
    fn backoff_negative_attempts_clamp_to_zero() {
        assert_eq!(backoff_interval(-3), Duration::ZERO);
    }

    #[test]
    fn builder_applies_defaults() {
        let job = NewJob::builder("welcome_email").build();
        assert_eq!(job.handler, "welcome_email");
        assert_eq!(job.queue, DEFAULT_QUEUE);
        assert_eq!(job.priority, DEFAULT_PRIORITY);
        assert_eq!(job.args, serde_json::Value::Null);
        assert!(job.run_at.is_none());
        assert!(job.max_attempts.is_none());
    }

    #[test]
    fn builder_overrides() {
        let run_at = OffsetDateTime::now_utc();
        let job = NewJob::builder("resize_image")
            .json_args(&serde_json::json!({"width": 200}))
            .unwrap()
            .queue("media")
            .priority(3)
            .run_at(run_at)
            .max_attempts(5)
            .build();

        assert_eq!(job.queue, "media");
        assert_eq!(job.priority, 3);
        assert_eq!(job.run_at, Some(run_at));
        assert_eq!(job.max_attempts, Some(5));
        assert_eq!(job.args["width"], 200);
    }

    #[test]
    #[should_panic(expected = "priority must be between 1 and 100")]
    fn priority_out_of_range_panics() {
        NewJob::builder("welcome_email").priority(0);
    }
}
