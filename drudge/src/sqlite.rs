use std::{path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use rusqlite::{named_params, Connection, OptionalExtension, Row};
use tracing::{event, Level};
use uuid::Uuid;

use crate::{
    adapter::{backoff_interval, Adapter, FindOptions, HandlerPayload, JobRecord, NewJob},
    clock::{from_ms, opt_from_ms, to_ms, Time},
    error::PerformError,
    Error, Result, DEFAULT_MAX_ATTEMPTS,
};

/// How many times a single `find` call will rerun the optimistic
/// select/claim round after losing the conditional update to another worker.
const MAX_CLAIM_ROUNDS: usize = 5;

const RECORD_COLUMNS: &str = "id, handler, queue, priority, run_at, locked_at, locked_by, \
     attempts, max_attempts, last_error, failed_at, created_at, updated_at";

/// The reference [Adapter] implementation, backed by a SQLite database.
///
/// Claims use an optimistic select followed by a conditional update keyed on
/// the row's `updated_at` token, so any number of worker processes may poll
/// the same database file concurrently.
pub struct SqliteAdapter {
    pool: deadpool_sqlite::Pool,
    time: Time,
    queries: Arc<Queries>,
}

/// A builder for a [SqliteAdapter].
pub struct SqliteAdapterBuilder {
    path: PathBuf,
    table: String,
}

impl SqliteAdapterBuilder {
    /// Create a builder for the database at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        SqliteAdapterBuilder {
            path: path.into(),
            table: "jobs".to_string(),
        }
    }

    /// Store jobs in a table other than `jobs`. The table must already exist
    /// with the same columns; construction fails with
    /// [Error::UnknownTable] otherwise.
    pub fn table(mut self, table: impl ToString) -> Self {
        self.table = table.to_string();
        self
    }

    /// Open the database, apply migrations, and build the adapter.
    pub async fn build(self) -> Result<SqliteAdapter> {
        let mut conn = Connection::open(&self.path).map_err(Error::open_database)?;
        conn.pragma_update(None, "journal_mode", "wal")
            .map_err(Error::open_database)?;
        conn.pragma_update(None, "synchronous", "normal")
            .map_err(Error::open_database)?;

        crate::migrations::migrate(&mut conn)?;

        let table_exists = conn
            .prepare("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1")?
            .exists([&self.table])?;
        if !table_exists {
            return Err(Error::UnknownTable(self.table));
        }
        drop(conn);

        let pool = deadpool_sqlite::Config::new(&self.path)
            .builder(deadpool_sqlite::Runtime::Tokio1)
            .map_err(Error::open_database)?
            .recycle_timeout(Some(Duration::from_secs(5 * 60)))
            .build()
            .map_err(Error::open_database)?;

        Ok(SqliteAdapter {
            pool,
            time: Time::new(),
            queries: Arc::new(Queries::for_table(&self.table)),
        })
    }
}

struct Queries {
    insert: String,
    claim_select: String,
    claim_update: String,
    get: String,
    delete: String,
    retry: String,
    terminal: String,
    clear: String,
}

impl Queries {
    fn for_table(table: &str) -> Queries {
        Queries {
            insert: format!(
                r##"INSERT INTO {table}
                    (id, handler, queue, priority, run_at, attempts, max_attempts,
                     created_at, updated_at)
                    VALUES ($id, $handler, $queue, $priority, $run_at, 0, $max_attempts,
                     $now, $now)"##
            ),
            claim_select: format!(
                r##"SELECT id, updated_at FROM {table}
                    WHERE failed_at IS NULL
                        AND run_at IS NOT NULL AND run_at <= $now
                        AND (locked_at IS NULL OR locked_at < $cutoff)
                        AND ($queue IS NULL OR queue = $queue)
                    ORDER BY priority ASC, run_at ASC, id ASC
                    LIMIT 1"##
            ),
            claim_update: format!(
                r##"UPDATE {table} SET
                        locked_at = $now,
                        locked_by = $process,
                        attempts = attempts + 1,
                        updated_at = MAX($now, updated_at + 1)
                    WHERE id = $id
                        AND updated_at = $pre_updated
                        AND failed_at IS NULL
                        AND run_at IS NOT NULL AND run_at <= $now
                        AND (locked_at IS NULL OR locked_at < $cutoff)
                    RETURNING {RECORD_COLUMNS}"##
            ),
            get: format!("SELECT {RECORD_COLUMNS} FROM {table} WHERE id = $id"),
            delete: format!("DELETE FROM {table} WHERE id = $id AND locked_by IS $process"),
            retry: format!(
                r##"UPDATE {table} SET
                        run_at = $run_at,
                        locked_at = NULL,
                        locked_by = NULL,
                        last_error = $error,
                        updated_at = MAX($now, updated_at + 1)
                    WHERE id = $id AND locked_by IS $process"##
            ),
            terminal: format!(
                r##"UPDATE {table} SET
                        failed_at = $now,
                        run_at = NULL,
                        locked_at = NULL,
                        locked_by = NULL,
                        last_error = $error,
                        updated_at = MAX($now, updated_at + 1)
                    WHERE id = $id AND locked_by IS $process"##
            ),
            clear: format!("DELETE FROM {table}"),
        }
    }
}

/// Row values as SQLite hands them back, before timestamp conversion.
struct RawRecord {
    id: Uuid,
    handler: String,
    queue: String,
    priority: i32,
    run_at: Option<i64>,
    locked_at: Option<i64>,
    locked_by: Option<String>,
    attempts: i32,
    max_attempts: Option<i32>,
    last_error: Option<String>,
    failed_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

fn read_raw_record(row: &Row) -> rusqlite::Result<RawRecord> {
    Ok(RawRecord {
        id: row.get(0)?,
        handler: row.get(1)?,
        queue: row.get(2)?,
        priority: row.get(3)?,
        run_at: row.get(4)?,
        locked_at: row.get(5)?,
        locked_by: row.get(6)?,
        attempts: row.get(7)?,
        max_attempts: row.get(8)?,
        last_error: row.get(9)?,
        failed_at: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

impl TryFrom<RawRecord> for JobRecord {
    type Error = Error;

    fn try_from(raw: RawRecord) -> Result<JobRecord> {
        Ok(JobRecord {
            id: raw.id,
            handler: raw.handler,
            queue: raw.queue,
            priority: raw.priority,
            run_at: opt_from_ms(raw.run_at, "run_at")?,
            locked_at: opt_from_ms(raw.locked_at, "locked_at")?,
            locked_by: raw.locked_by,
            attempts: raw.attempts,
            max_attempts: raw.max_attempts,
            last_error: raw.last_error,
            failed_at: opt_from_ms(raw.failed_at, "failed_at")?,
            created_at: from_ms(raw.created_at, "created_at")?,
            updated_at: from_ms(raw.updated_at, "updated_at")?,
        })
    }
}

fn claim_one(
    conn: &mut Connection,
    queries: &Queries,
    now_ms: i64,
    cutoff_ms: i64,
    process_name: &str,
    queue: Option<&str>,
) -> Result<Option<JobRecord>> {
    for _ in 0..MAX_CLAIM_ROUNDS {
        let candidate = conn
            .prepare_cached(&queries.claim_select)?
            .query_row(
                named_params! {
                    "$now": now_ms,
                    "$cutoff": cutoff_ms,
                    "$queue": queue,
                },
                |row| {
                    let id: Uuid = row.get(0)?;
                    let updated_at: i64 = row.get(1)?;
                    Ok((id, updated_at))
                },
            )
            .optional()?;

        let Some((id, pre_updated)) = candidate else {
            return Ok(None);
        };

        let claimed = conn
            .prepare_cached(&queries.claim_update)?
            .query_row(
                named_params! {
                    "$id": id,
                    "$pre_updated": pre_updated,
                    "$now": now_ms,
                    "$cutoff": cutoff_ms,
                    "$process": process_name,
                },
                read_raw_record,
            )
            .optional()?;

        match claimed {
            Some(raw) => return Ok(Some(JobRecord::try_from(raw)?)),
            // Another worker won the conditional update. Start over.
            None => continue,
        }
    }

    Ok(None)
}

impl SqliteAdapter {
    /// Open or create a job database at the given path.
    pub async fn new(path: impl Into<PathBuf>) -> Result<SqliteAdapter> {
        SqliteAdapterBuilder::new(path).build().await
    }

    /// Create a builder for an adapter.
    pub fn builder(path: impl Into<PathBuf>) -> SqliteAdapterBuilder {
        SqliteAdapterBuilder::new(path)
    }

    /// Fetch a single record by id, mostly for inspection and tests.
    pub async fn get(&self, id: Uuid) -> Result<Option<JobRecord>> {
        let queries = self.queries.clone();
        let conn = self.pool.get().await?;
        let raw = conn
            .interact(move |conn| {
                conn.prepare_cached(&queries.get)?
                    .query_row(named_params! { "$id": id }, read_raw_record)
                    .optional()
                    .map_err(Error::from)
            })
            .await??;

        raw.map(JobRecord::try_from).transpose()
    }

    async fn insert(&self, job: NewJob) -> Result<JobRecord> {
        let now = self.time.now();
        let now_ms = to_ms(now);
        let id = Uuid::now_v7();
        let run_at = job.run_at.unwrap_or(now);
        let blob = serde_json::to_string(&HandlerPayload {
            handler: job.handler.to_string(),
            args: job.args,
        })
        .map_err(Error::Payload)?;

        let record = JobRecord {
            id,
            handler: blob,
            queue: job.queue,
            priority: job.priority,
            run_at: Some(run_at),
            locked_at: None,
            locked_by: None,
            attempts: 0,
            max_attempts: job.max_attempts,
            last_error: None,
            failed_at: None,
            created_at: now,
            updated_at: now,
        };

        let queries = self.queries.clone();
        let insert = record.clone();
        let conn = self.pool.get().await?;
        conn.interact(move |conn| {
            conn.prepare_cached(&queries.insert)?
                .execute(named_params! {
                    "$id": insert.id,
                    "$handler": insert.handler,
                    "$queue": insert.queue,
                    "$priority": insert.priority,
                    "$run_at": to_ms(run_at),
                    "$max_attempts": insert.max_attempts,
                    "$now": now_ms,
                })
                .map_err(Error::from)
        })
        .await??;

        event!(Level::DEBUG, job_id = %record.id, queue = %record.queue, "scheduled job");
        Ok(record)
    }
}

#[async_trait]
impl Adapter for SqliteAdapter {
    async fn schedule(&self, job: NewJob) -> Result<JobRecord> {
        self.insert(job).await.map_err(Error::into_scheduling)
    }

    async fn find(&self, options: &FindOptions) -> Result<Option<JobRecord>> {
        let now_ms = to_ms(self.time.now());
        let cutoff_ms = now_ms - options.max_runtime.as_millis() as i64;
        let process_name = options.process_name.clone();
        let queue = options.queue.clone();
        let queries = self.queries.clone();

        let conn = self.pool.get().await?;
        let claimed = conn
            .interact(move |conn| {
                claim_one(
                    conn,
                    &queries,
                    now_ms,
                    cutoff_ms,
                    &process_name,
                    queue.as_deref(),
                )
            })
            .await??;

        if let Some(record) = &claimed {
            event!(
                Level::DEBUG,
                job_id = %record.id,
                attempts = record.attempts,
                locked_by = ?record.locked_by,
                "claimed job"
            );
        }

        Ok(claimed)
    }

    async fn success(&self, record: &JobRecord) -> Result<()> {
        let queries = self.queries.clone();
        let id = record.id;
        let locked_by = record.locked_by.clone();

        let conn = self.pool.get().await?;
        let deleted = conn
            .interact(move |conn| {
                conn.prepare_cached(&queries.delete)?
                    .execute(named_params! { "$id": id, "$process": locked_by })
                    .map_err(Error::from)
            })
            .await??;

        if deleted == 0 {
            return Err(Error::Expired);
        }

        event!(Level::DEBUG, job_id = %record.id, "job succeeded");
        Ok(())
    }

    async fn failure(&self, record: &JobRecord, error: &PerformError) -> Result<()> {
        let now = self.time.now();
        let now_ms = to_ms(now);
        let cap = record.attempt_cap(DEFAULT_MAX_ATTEMPTS);
        let rendered = error.render();
        let queries = self.queries.clone();
        let id = record.id;
        let locked_by = record.locked_by.clone();

        let conn = self.pool.get().await?;
        let altered = if record.attempts < cap {
            let run_at = now + backoff_interval(record.attempts);
            event!(
                Level::WARN,
                job_id = %record.id,
                attempts = record.attempts,
                next_run_at = %run_at,
                "job failed, scheduling retry"
            );
            conn.interact(move |conn| {
                conn.prepare_cached(&queries.retry)?
                    .execute(named_params! {
                        "$id": id,
                        "$process": locked_by,
                        "$run_at": to_ms(run_at),
                        "$error": rendered,
                        "$now": now_ms,
                    })
                    .map_err(Error::from)
            })
            .await??
        } else {
            event!(
                Level::ERROR,
                job_id = %record.id,
                attempts = record.attempts,
                "job exhausted its attempts and failed permanently"
            );
            conn.interact(move |conn| {
                conn.prepare_cached(&queries.terminal)?
                    .execute(named_params! {
                        "$id": id,
                        "$process": locked_by,
                        "$error": rendered,
                        "$now": now_ms,
                    })
                    .map_err(Error::from)
            })
            .await??
        };

        if altered == 0 {
            return Err(Error::Expired);
        }

        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let queries = self.queries.clone();
        let conn = self.pool.get().await?;
        let deleted = conn
            .interact(move |conn| {
                conn.prepare_cached(&queries.clear)?
                    .execute([])
                    .map_err(Error::from)
            })
            .await??;
        event!(Level::INFO, %deleted, "cleared job store");
        Ok(())
    }
}
