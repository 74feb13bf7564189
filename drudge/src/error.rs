use deadpool_sqlite::InteractError;

/// A [std::result::Result] whose error type defaults to [Error].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that can be returned from the job engine.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// An error occurred while updating the database to a new schema version.
    #[error("Migration error: {0}")]
    Migration(#[from] rusqlite_migration::Error),
    /// An error occurred while opening the database.
    #[error("Error opening database: {0}")]
    OpenDatabase(eyre::Report),
    /// Failed to acquire a database connection.
    #[error("Error acquiring database connection: {0}")]
    Pool(#[from] deadpool_sqlite::PoolError),
    /// Encountered an error communicating with the database.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// The database contained invalid data.
    #[error("Unexpected value type for {1}: {0}")]
    ColumnType(#[source] rusqlite::Error, &'static str),
    /// An internal error occurred while accessing the database.
    #[error("Internal error: {0}")]
    DbInteract(String),
    /// Failed to serialize or deserialize a job payload.
    #[error("Error processing payload: {0}")]
    Payload(serde_json::Error),
    /// Invalid value for a job timestamp.
    #[error("Timestamp {0} out of range")]
    TimestampOutOfRange(&'static str),
    /// The adapter was configured with a table that does not exist.
    #[error("Table {0} does not exist in the database")]
    UnknownTable(String),
    /// A job was scheduled before an adapter was configured.
    #[error("No adapter configured; call scheduler::configure at process startup")]
    AdapterNotConfigured,
    /// [scheduler::configure](crate::scheduler::configure) was called twice.
    #[error("An adapter is already configured")]
    AdapterAlreadyConfigured,
    /// Scheduling a job failed. Wraps the underlying cause.
    #[error("Scheduling error: {0}")]
    Scheduling(eyre::Report),
    /// The worker's lock on a job expired and another worker claimed it.
    #[error("Job lock expired or was claimed by another worker")]
    Expired,
}

impl From<InteractError> for Error {
    fn from(e: InteractError) -> Self {
        Error::DbInteract(e.to_string())
    }
}

impl Error {
    pub(crate) fn open_database(err: impl Into<eyre::Report>) -> Self {
        Error::OpenDatabase(err.into())
    }

    /// Wrap this error in [Error::Scheduling], unless it already is one.
    pub(crate) fn into_scheduling(self) -> Self {
        match self {
            e @ Error::Scheduling(_) => e,
            e => Error::Scheduling(e.into()),
        }
    }
}

/// Errors raised while executing a claimed job. These are consumed by the
/// [Executor](crate::Executor) and persisted through
/// [Adapter::failure](crate::Adapter::failure); they never propagate out of the
/// worker loop.
#[derive(thiserror::Error, Debug)]
pub enum PerformError {
    /// The handler name in the persisted payload has no registered job class.
    #[error("No job registered for handler {0}")]
    NotRegistered(String),
    /// The persisted handler payload could not be decoded at all.
    #[error("Error decoding job payload: {0}")]
    InvalidPayload(#[source] serde_json::Error),
    /// The handler is registered but the persisted args do not deserialize
    /// into the job class.
    #[error("Error decoding arguments for handler {handler}: {source}")]
    InvalidArgs {
        /// The handler whose args were rejected.
        handler: String,
        /// The deserialization failure.
        #[source]
        source: serde_json::Error,
    },
    /// The job's `perform` returned an error.
    #[error("{0}")]
    Failed(eyre::Report),
    /// The job's `perform` panicked.
    #[error("Job panicked: {0}")]
    Panicked(String),
}

impl PerformError {
    /// Render this error for persistence: the top-level message followed by
    /// each cause in the chain, one per line.
    pub fn render(&self) -> String {
        match self {
            PerformError::Failed(report) => report
                .chain()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("\n"),
            other => {
                let mut lines = vec![other.to_string()];
                let mut source = std::error::Error::source(other);
                while let Some(cause) = source {
                    lines.push(cause.to_string());
                    source = cause.source();
                }
                lines.join("\n")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::PerformError;

    #[test]
    fn render_includes_cause_chain() {
        let inner = eyre::eyre!("connection refused");
        let report = inner.wrap_err("fetching welcome email template");
        let rendered = PerformError::Failed(report).render();

        let lines = rendered.lines().collect::<Vec<_>>();
        assert_eq!(lines[0], "fetching welcome email template");
        assert_eq!(lines[1], "connection refused");
    }

    #[test]
    fn render_leaf_error_is_single_line() {
        let rendered = PerformError::NotRegistered("welcome".to_string()).render();
        assert_eq!(rendered, "No job registered for handler welcome");
    }
}
