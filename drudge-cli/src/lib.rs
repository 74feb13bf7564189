//! The command-line surface for drudge workers.
//!
//! Job classes are compiled into the application, so this CLI is embedded
//! rather than standalone: the application's binary parses [Cli] and hands it
//! the registry and context its workers need.
//!
//! ```no_run
//! use clap::Parser;
//! use drudge::JobRegistry;
//!
//! #[derive(Clone)]
//! struct AppContext {}
//!
//! #[tokio::main]
//! async fn main() -> eyre::Result<()> {
//!     drudge_cli::init_tracing();
//!
//!     let mut registry: JobRegistry<AppContext> = JobRegistry::new();
//!     // registry.add::<WelcomeEmail>(); ...
//!
//!     drudge_cli::Cli::parse().run(registry, AppContext {}).await
//! }
//! ```
//!
//! `start` re-invokes the same binary with `work` arguments for each detached
//! worker and records pids under `--pid-dir`; `stop` signals those pids with
//! SIGINT so they drain.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use clap::{Args, Parser, Subcommand};
use eyre::WrapErr;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{event, Level};

use drudge::{Adapter, JobRegistry, SqliteAdapter, Worker};

mod control;

pub use control::{parse_worker_spec, worker_title, WorkerGroup};

/// Manage background job workers.
#[derive(Parser, Debug)]
#[command(name = "jobs", about = "Run and control background job workers")]
pub struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to the SQLite job database.
    #[arg(
        long,
        env = "DRUDGE_DATABASE",
        default_value = "drudge.sqlite",
        global = true
    )]
    database: PathBuf,

    /// Directory where detached workers record their pidfiles.
    #[arg(long, env = "DRUDGE_PID_DIR", default_value = ".drudge", global = true)]
    pid_dir: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one worker in the foreground until signalled.
    Work(WorkArgs),
    /// Run one worker until the queue is empty, then exit.
    Workoff(WorkArgs),
    /// Detach workers into the background.
    Start {
        /// Worker layout: a count ("3") or queue:count pairs
        /// ("default:2,email:1"). Defaults to one worker.
        #[arg(short = 'n', long = "workers")]
        spec: Option<String>,
    },
    /// Signal detached workers to drain and exit.
    Stop {
        /// Restrict which workers to stop, same format as `start -n`.
        #[arg(short = 'n', long = "workers")]
        spec: Option<String>,
    },
    /// Delete every job in the store.
    Clear,
}

#[derive(Args, Debug)]
struct WorkArgs {
    /// Claim jobs only from this queue.
    #[arg(long)]
    queue: Option<String>,

    /// Claimant name recorded in the store; generated when omitted.
    #[arg(long)]
    name: Option<String>,

    /// Seconds to sleep between polls that find nothing.
    #[arg(long, default_value_t = 5)]
    wait_time: u64,
}

impl Cli {
    /// Execute the parsed command with the application's job registry and
    /// context.
    pub async fn run<CONTEXT>(
        self,
        registry: JobRegistry<CONTEXT>,
        context: CONTEXT,
    ) -> eyre::Result<()>
    where
        CONTEXT: Send + Sync + Clone + 'static,
    {
        match self.command {
            Command::Work(args) => work(args, false, &self.database, registry, context).await,
            Command::Workoff(args) => work(args, true, &self.database, registry, context).await,
            Command::Start { spec } => {
                let groups = parse_worker_spec(spec.as_deref().unwrap_or("1"))?;
                control::start_workers(&groups, &self.database, &self.pid_dir)
            }
            Command::Stop { spec } => {
                let groups = spec.as_deref().map(parse_worker_spec).transpose()?;
                control::stop_workers(groups.as_deref(), &self.pid_dir)
            }
            Command::Clear => {
                let adapter = open_adapter(&self.database).await?;
                adapter.clear().await?;
                Ok(())
            }
        }
    }
}

async fn open_adapter(database: &Path) -> eyre::Result<Arc<SqliteAdapter>> {
    let adapter = SqliteAdapter::new(database)
        .await
        .wrap_err_with(|| format!("opening job database {}", database.display()))?;
    Ok(Arc::new(adapter))
}

async fn work<CONTEXT>(
    args: WorkArgs,
    workoff: bool,
    database: &Path,
    registry: JobRegistry<CONTEXT>,
    context: CONTEXT,
) -> eyre::Result<()>
where
    CONTEXT: Send + Sync + Clone + 'static,
{
    let adapter = open_adapter(database).await?;

    let mut builder = Worker::builder(adapter, context)
        .registry(Arc::new(registry))
        .wait_time(Duration::from_secs(args.wait_time))
        .workoff(workoff);
    if let Some(queue) = &args.queue {
        builder = builder.queue(queue);
    }
    if let Some(name) = &args.name {
        builder = builder.process_name(name);
    }

    let worker = builder.build();
    let handle = worker.handle();

    let mut sigint = signal(SignalKind::interrupt()).wrap_err("installing SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).wrap_err("installing SIGTERM handler")?;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sigint.recv() => {
                    event!(Level::INFO, "SIGINT received, draining worker");
                    handle.drain();
                }
                _ = sigterm.recv() => {
                    event!(Level::WARN, "SIGTERM received, stopping worker");
                    handle.stop();
                }
            }
        }
    });

    let counts = worker.run().await?;
    event!(
        Level::INFO,
        claimed = counts.claimed,
        succeeded = counts.succeeded,
        failed = counts.failed,
        "worker finished"
    );

    Ok(())
}

/// Initialize tracing for a worker binary: `RUST_LOG`-style filtering with an
/// `info` default.
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
