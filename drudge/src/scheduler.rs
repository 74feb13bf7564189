//! The process-wide scheduling facade.
//!
//! Application code configures one [Adapter] at boot with [configure]; job
//! classes then schedule themselves through
//! [perform_later](crate::BackgroundJob::perform_later) without threading the
//! adapter everywhere. The configured adapter is never reassigned implicitly;
//! tests use [reset] to swap it out explicitly.

use std::sync::{Arc, RwLock};

use crate::{
    adapter::{Adapter, JobRecord, NewJob},
    Error, Result,
};

static CONFIGURED: RwLock<Option<Arc<dyn Adapter>>> = RwLock::new(None);

/// Set the process-wide adapter. Call once at startup, before any job is
/// scheduled. Fails with [Error::AdapterAlreadyConfigured] on a second call;
/// use [reset] first if replacement is really intended.
pub fn configure(adapter: Arc<dyn Adapter>) -> Result<()> {
    let mut configured = CONFIGURED.write().unwrap_or_else(|e| e.into_inner());
    if configured.is_some() {
        return Err(Error::AdapterAlreadyConfigured);
    }
    *configured = Some(adapter);
    Ok(())
}

/// Drop the configured adapter. A test hook; production processes configure
/// once and never reset.
pub fn reset() {
    let mut configured = CONFIGURED.write().unwrap_or_else(|e| e.into_inner());
    *configured = None;
}

fn configured() -> Result<Arc<dyn Adapter>> {
    CONFIGURED
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .clone()
        .ok_or(Error::AdapterNotConfigured)
}

/// Persist a job through the configured adapter.
///
/// Fails with [Error::AdapterNotConfigured] when [configure] has not run, and
/// wraps any adapter failure in [Error::Scheduling] with the cause preserved.
pub async fn schedule(job: NewJob) -> Result<JobRecord> {
    let adapter = configured()?;
    adapter
        .schedule(job)
        .await
        .map_err(Error::into_scheduling)
}
