#![warn(missing_docs)]
//! A SQLite-backed background job engine: schedule user-defined job classes
//! into a durable store and execute them with polling workers, priorities,
//! quartic retry backoff, and stale-lock recovery.
//!
//! Any number of worker processes can share one database; claim exclusivity
//! is enforced with a conditional update, so no worker coordination is
//! needed.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use serde::{Deserialize, Serialize};
//! use drudge::{scheduler, BackgroundJob, JobRegistry, SqliteAdapter, Worker};
//!
//! #[derive(Clone)]
//! pub struct AppContext {
//!     // database pool or other things here
//! }
//!
//! #[derive(Serialize, Deserialize)]
//! struct WelcomeEmail {
//!     address: String,
//! }
//!
//! impl BackgroundJob for WelcomeEmail {
//!     const NAME: &'static str = "welcome_email";
//!     const QUEUE: &'static str = "email";
//!     type Context = AppContext;
//!
//!     async fn perform(&self, _context: AppContext) -> eyre::Result<()> {
//!         // send the email
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), drudge::Error> {
//!     // One adapter per process, configured at boot.
//!     let adapter = Arc::new(SqliteAdapter::new("jobs.sqlite").await?);
//!     scheduler::configure(adapter.clone())?;
//!
//!     // Schedule work from anywhere in the application.
//!     let record = WelcomeEmail { address: "me@example.com".into() }
//!         .perform_later()
//!         .await?;
//!     println!("scheduled {}", record.id);
//!
//!     // Somewhere else (often another process): run a worker.
//!     let mut registry = JobRegistry::new();
//!     registry.add::<WelcomeEmail>();
//!
//!     let worker = Worker::builder(adapter, AppContext {})
//!         .registry(Arc::new(registry))
//!         .queue("email")
//!         .build();
//!     worker.run().await?;
//!
//!     Ok(())
//! }
//! ```

mod adapter;
mod clock;
mod error;
mod executor;
mod job;
mod job_registry;
mod migrations;
pub mod scheduler;
mod sqlite;
#[cfg(test)]
mod test_util;
mod worker;

pub use adapter::{
    backoff_interval, Adapter, FindOptions, HandlerPayload, JobRecord, NewJob, NewJobBuilder,
    DEFAULT_MAX_ATTEMPTS, DEFAULT_PRIORITY, DEFAULT_QUEUE,
};
pub use error::{Error, PerformError, Result};
pub use executor::{ExecutionOutcome, Executor};
pub use job::{BackgroundJob, ScheduleBuilder};
pub use job_registry::{JobRegistry, JobRunner};
pub use sqlite::{SqliteAdapter, SqliteAdapterBuilder};
pub use worker::{
    Worker, WorkerBuilder, WorkerCounts, WorkerHandle, DEFAULT_MAX_RUNTIME, DEFAULT_WAIT_TIME,
};

pub(crate) type SmartString = smartstring::SmartString<smartstring::LazyCompact>;
