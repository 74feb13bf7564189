use std::{borrow::Cow, future::Future, marker::PhantomData, time::Duration};

use futures::{future::BoxFuture, FutureExt};
use serde::{de::DeserializeOwned, Serialize};
use time::OffsetDateTime;

use crate::{
    adapter::{JobRecord, NewJob},
    scheduler, Error, Result, DEFAULT_MAX_ATTEMPTS, DEFAULT_PRIORITY, DEFAULT_QUEUE,
};

/// A user-defined unit of deferred work.
///
/// Implementations declare their handler name and scheduling defaults as
/// associated constants, and the work itself in [perform](BackgroundJob::perform).
/// The struct's fields are the job's arguments; they are serialized when the
/// job is scheduled and deserialized again when a worker runs it.
///
/// ```
/// # use serde::{Deserialize, Serialize};
/// # use drudge::BackgroundJob;
/// #[derive(Serialize, Deserialize)]
/// struct WelcomeEmail {
///     address: String,
/// }
///
/// impl BackgroundJob for WelcomeEmail {
///     const NAME: &'static str = "welcome_email";
///     const QUEUE: &'static str = "email";
///     type Context = ();
///
///     async fn perform(&self, _context: ()) -> eyre::Result<()> {
///         // send the email here
///         Ok(())
///     }
/// }
/// ```
pub trait BackgroundJob: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Unique handler name, persisted with every scheduled invocation and
    /// used to look the class up in the worker's
    /// [JobRegistry](crate::JobRegistry).
    const NAME: &'static str;

    /// Queue this class schedules onto by default.
    const QUEUE: &'static str = DEFAULT_QUEUE;

    /// Priority this class schedules with by default (1 most urgent, 100
    /// least).
    const PRIORITY: i32 = DEFAULT_PRIORITY;

    /// How many attempts this class allows before a job fails permanently.
    const MAX_ATTEMPTS: i32 = DEFAULT_MAX_ATTEMPTS;

    /// Application state handed to every execution, such as a database pool.
    type Context: Send + Sync + Clone + 'static;

    /// Do the work.
    fn perform(&self, context: Self::Context) -> impl Future<Output = eyre::Result<()>> + Send;

    /// Start a fluent scheduling builder that layers overrides on top of this
    /// class's defaults.
    fn set() -> ScheduleBuilder<Self>
    where
        Self: Sized,
    {
        ScheduleBuilder::new()
    }

    /// Schedule this job through the configured
    /// [scheduler](crate::scheduler), using the class defaults.
    fn perform_later(&self) -> BoxFuture<'static, Result<JobRecord>>
    where
        Self: Sized,
    {
        Self::set().perform_later(self)
    }

    /// Run the job right here, with no adapter involved. Returns whatever
    /// `perform` returns.
    fn perform_now(&self, context: Self::Context) -> impl Future<Output = eyre::Result<()>> + Send
    where
        Self: Sized,
    {
        self.perform(context)
    }
}

/// Fluent scheduling overrides for one [BackgroundJob] class, created with
/// [BackgroundJob::set].
pub struct ScheduleBuilder<J> {
    wait: Option<u64>,
    wait_until: Option<OffsetDateTime>,
    queue: Option<String>,
    priority: Option<i32>,
    _job: PhantomData<fn(J)>,
}

impl<J: BackgroundJob> Default for ScheduleBuilder<J> {
    fn default() -> Self {
        Self::new()
    }
}

impl<J: BackgroundJob> ScheduleBuilder<J> {
    /// Create a builder with no overrides.
    pub fn new() -> Self {
        ScheduleBuilder {
            wait: None,
            wait_until: None,
            queue: None,
            priority: None,
            _job: PhantomData,
        }
    }

    /// Delay the job by this many seconds from now.
    pub fn wait(mut self, seconds: u64) -> Self {
        self.wait = Some(seconds);
        self
    }

    /// Run the job no earlier than this moment. Takes precedence over
    /// [wait](ScheduleBuilder::wait) when both are set.
    pub fn wait_until(mut self, at: OffsetDateTime) -> Self {
        self.wait_until = Some(at);
        self
    }

    /// Override the class's queue.
    pub fn queue(mut self, queue: impl ToString) -> Self {
        self.queue = Some(queue.to_string());
        self
    }

    /// Override the class's priority.
    pub fn priority(mut self, priority: i32) -> Self {
        assert!(
            (1..=100).contains(&priority),
            "priority must be between 1 and 100"
        );
        self.priority = Some(priority);
        self
    }

    /// Resolve the overrides and the class defaults into a [NewJob] that can
    /// be handed to any [Adapter](crate::Adapter) directly.
    pub fn new_job(&self, job: &J) -> Result<NewJob> {
        let args = serde_json::to_value(job).map_err(Error::Payload)?;

        let run_at = self
            .wait_until
            .or_else(|| self.wait.map(|s| OffsetDateTime::now_utc() + Duration::from_secs(s)));

        Ok(NewJob {
            handler: Cow::Borrowed(J::NAME),
            args,
            queue: self.queue.clone().unwrap_or_else(|| J::QUEUE.to_string()),
            priority: self.priority.unwrap_or(J::PRIORITY),
            run_at,
            max_attempts: Some(J::MAX_ATTEMPTS),
        })
    }

    /// Schedule the job through the configured [scheduler](crate::scheduler).
    pub fn perform_later(self, job: &J) -> BoxFuture<'static, Result<JobRecord>> {
        let new_job = self.new_job(job);
        async move { scheduler::schedule(new_job?).await }.boxed()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::atomic::Ordering, sync::Arc, time::Duration};

    use serde::{Deserialize, Serialize};
    use time::OffsetDateTime;

    use super::BackgroundJob;
    use crate::{
        scheduler,
        test_util::{scheduler_lock, CounterJob, TestContext, TestEnvironment},
    };

    #[derive(Serialize, Deserialize)]
    struct DigestEmail {
        address: String,
    }

    impl BackgroundJob for DigestEmail {
        const NAME: &'static str = "digest_email";
        const QUEUE: &'static str = "email";
        const PRIORITY: i32 = 10;
        const MAX_ATTEMPTS: i32 = 5;
        type Context = Arc<TestContext>;

        async fn perform(&self, _context: Arc<TestContext>) -> eyre::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn new_job_uses_class_defaults() {
        let job = CounterJob { amount: 1 };
        let new_job = CounterJob::set().new_job(&job).unwrap();

        assert_eq!(new_job.handler, "counter");
        assert_eq!(new_job.queue, "default");
        assert_eq!(new_job.priority, 50);
        assert_eq!(new_job.max_attempts, Some(24));
        assert!(new_job.run_at.is_none());
        assert_eq!(new_job.args["amount"], 1);
    }

    #[test]
    fn new_job_uses_class_overrides() {
        let job = DigestEmail {
            address: "a@x".to_string(),
        };
        let new_job = DigestEmail::set().new_job(&job).unwrap();

        assert_eq!(new_job.queue, "email");
        assert_eq!(new_job.priority, 10);
        assert_eq!(new_job.max_attempts, Some(5));
    }

    #[test]
    fn set_overrides_win_over_class_defaults() {
        let job = DigestEmail {
            address: "a@x".to_string(),
        };
        let new_job = DigestEmail::set()
            .queue("urgent")
            .priority(1)
            .new_job(&job)
            .unwrap();

        assert_eq!(new_job.queue, "urgent");
        assert_eq!(new_job.priority, 1);
    }

    #[test]
    fn wait_offsets_run_at_from_now() {
        let job = CounterJob { amount: 1 };
        let before = OffsetDateTime::now_utc();
        let new_job = CounterJob::set().wait(300).new_job(&job).unwrap();

        let run_at = new_job.run_at.unwrap();
        assert!(run_at >= before + Duration::from_secs(299));
        assert!(run_at <= OffsetDateTime::now_utc() + Duration::from_secs(301));
    }

    #[test]
    fn wait_until_wins_over_wait() {
        let job = CounterJob { amount: 1 };
        let at = OffsetDateTime::now_utc() + Duration::from_secs(7200);
        let new_job = CounterJob::set()
            .wait(10)
            .wait_until(at)
            .new_job(&job)
            .unwrap();

        assert_eq!(new_job.run_at, Some(at));
    }

    #[tokio::test]
    async fn perform_later_creates_a_pending_record() {
        let _guard = scheduler_lock();
        scheduler::reset();

        let test = TestEnvironment::new().await;
        scheduler::configure(test.adapter.clone()).unwrap();

        let before = OffsetDateTime::now_utc();
        let record = CounterJob { amount: 1 }.perform_later().await.unwrap();

        let row = test.adapter.get(record.id).await.unwrap().unwrap();
        assert_eq!(row.queue, "default");
        assert_eq!(row.priority, 50);
        assert_eq!(row.attempts, 0);
        assert!(row.run_at.unwrap() <= OffsetDateTime::now_utc() + Duration::from_secs(1));
        assert!(row.run_at.unwrap() >= before - Duration::from_secs(1));

        scheduler::reset();
    }

    #[tokio::test]
    async fn far_future_job_is_not_found() {
        let test = TestEnvironment::new().await;

        let job = CounterJob { amount: 1 };
        let new_job = CounterJob::set()
            .wait_until(OffsetDateTime::now_utc() + Duration::from_secs(60 * 60 * 24 * 365))
            .new_job(&job)
            .unwrap();
        test.schedule(new_job).await.unwrap();

        assert!(test.claim("w1").await.is_none());
    }

    #[tokio::test]
    async fn perform_now_runs_without_an_adapter() {
        let context = TestContext::new();

        CounterJob { amount: 5 }
            .perform_now(context.clone())
            .await
            .unwrap();

        assert_eq!(context.counter.load(Ordering::Relaxed), 5);
    }
}
