//! Detached worker bookkeeping: the `-n` spec, pidfile naming, and signals.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
};

use eyre::{bail, eyre, WrapErr};
use nix::{sys::signal, unistd::Pid};
use tracing::{event, Level};

/// One entry of a `-n` worker spec: how many workers, pinned to which queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerGroup {
    /// Queue the workers claim from; `None` claims from every queue.
    pub queue: Option<String>,
    /// Number of workers to run.
    pub count: usize,
}

/// Parse a worker spec: either a bare count (`"3"`) or comma-separated
/// `queue:count` pairs (`"default:2,email:1"`).
pub fn parse_worker_spec(spec: &str) -> eyre::Result<Vec<WorkerGroup>> {
    let spec = spec.trim();
    if spec.is_empty() {
        bail!("worker spec is empty");
    }

    if let Ok(count) = spec.parse::<usize>() {
        return Ok(vec![WorkerGroup { queue: None, count }]);
    }

    spec.split(',')
        .map(|segment| {
            let (queue, count) = segment
                .split_once(':')
                .ok_or_else(|| eyre!("invalid worker spec segment {segment:?}, expected queue:count"))?;
            let queue = queue.trim();
            if queue.is_empty() {
                bail!("missing queue name in worker spec segment {segment:?}");
            }
            let count = count
                .trim()
                .parse::<usize>()
                .wrap_err_with(|| format!("invalid worker count in segment {segment:?}"))?;
            Ok(WorkerGroup {
                queue: Some(queue.to_string()),
                count,
            })
        })
        .collect()
}

/// The conventional name for a detached worker: `drudge-worker[.<queue>].<id>`.
/// Used both as the worker's process name (`locked_by`) and its pidfile stem.
pub fn worker_title(queue: Option<&str>, index: usize) -> String {
    match queue {
        Some(queue) => format!("drudge-worker.{queue}.{index}"),
        None => format!("drudge-worker.{index}"),
    }
}

/// Recover the queue from a pidfile name produced by [worker_title].
fn title_queue(file_name: &str) -> Option<Option<String>> {
    let stem = file_name.strip_suffix(".pid")?;
    let rest = stem.strip_prefix("drudge-worker.")?;
    match rest.rsplit_once('.') {
        None => {
            rest.parse::<usize>().ok()?;
            Some(None)
        }
        Some((queue, index)) => {
            index.parse::<usize>().ok()?;
            Some(Some(queue.to_string()))
        }
    }
}

/// Spawn detached `work` subcommand children and record their pids.
pub fn start_workers(
    groups: &[WorkerGroup],
    database: &Path,
    pid_dir: &Path,
) -> eyre::Result<()> {
    std::fs::create_dir_all(pid_dir)
        .wrap_err_with(|| format!("creating pid directory {}", pid_dir.display()))?;
    let exe = std::env::current_exe().wrap_err("finding current executable")?;

    for group in groups {
        for index in 0..group.count {
            let name = worker_title(group.queue.as_deref(), index);

            let mut command = std::process::Command::new(&exe);
            command
                .arg("work")
                .arg("--database")
                .arg(database)
                .arg("--name")
                .arg(&name)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null());
            if let Some(queue) = &group.queue {
                command.arg("--queue").arg(queue);
            }

            let child = command
                .spawn()
                .wrap_err_with(|| format!("spawning worker {name}"))?;
            std::fs::write(pidfile(pid_dir, &name), child.id().to_string())?;

            event!(Level::INFO, %name, pid = child.id(), "started detached worker");
        }
    }

    Ok(())
}

/// SIGINT recorded workers so they drain and exit. With a spec, only workers
/// matching the spec's queues are signalled, at most `count` per group; with
/// no spec, every recorded worker is.
pub fn stop_workers(groups: Option<&[WorkerGroup]>, pid_dir: &Path) -> eyre::Result<()> {
    let mut recorded = recorded_workers(pid_dir)?;
    recorded.sort();

    let targets: Vec<PathBuf> = match groups {
        None => recorded,
        Some(groups) => {
            let mut targets = Vec::new();
            for group in groups {
                let mut matched = 0;
                for path in &recorded {
                    if matched >= group.count {
                        break;
                    }
                    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
                    if title_queue(name) == Some(group.queue.clone()) {
                        targets.push(path.clone());
                        matched += 1;
                    }
                }
            }
            targets
        }
    };

    for path in targets {
        let pid = std::fs::read_to_string(&path)
            .wrap_err_with(|| format!("reading pidfile {}", path.display()))?
            .trim()
            .parse::<i32>()
            .wrap_err_with(|| format!("invalid pid in {}", path.display()))?;

        match signal::kill(Pid::from_raw(pid), signal::Signal::SIGINT) {
            Ok(()) => event!(Level::INFO, %pid, file = %path.display(), "sent SIGINT"),
            Err(nix::errno::Errno::ESRCH) => {
                event!(Level::WARN, %pid, "worker already gone, removing stale pidfile");
            }
            Err(e) => return Err(e).wrap_err_with(|| format!("signalling pid {pid}")),
        }

        std::fs::remove_file(&path).ok();
    }

    Ok(())
}

fn pidfile(pid_dir: &Path, name: &str) -> PathBuf {
    pid_dir.join(format!("{name}.pid"))
}

fn recorded_workers(pid_dir: &Path) -> eyre::Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(pid_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).wrap_err_with(|| format!("reading {}", pid_dir.display())),
    };

    let mut paths = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if title_queue(name).is_some() {
            paths.push(path);
        }
    }
    Ok(paths)
}
