//! Worker launching
//!
//! A launcher starts one worker for one chunk and feeds its output lines and
//! exit status into the scheduler's event channel. For every worker all output
//! lines are sent before its `Exited` event.

use crate::chunk::Chunk;
use crate::error::PoolError;
use async_trait::async_trait;
use ferry_core::{RunConfig, RunId};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};

/// How long output may keep flowing after a worker exited
///
/// A grandchild that inherited the pipes can hold them open indefinitely;
/// its remaining output is dropped once this passes.
pub const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Scheduler-assigned worker identifier, unique per scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerId(pub u64);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Output stream of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Something a worker did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// One complete output line, without its newline
    Line {
        worker: WorkerId,
        stream: StreamKind,
        line: String,
    },
    /// Worker finished; `None` when killed by a signal or not observable
    Exited { worker: WorkerId, code: Option<i32> },
}

impl WorkerEvent {
    #[inline]
    #[must_use]
    pub fn worker(&self) -> WorkerId {
        match self {
            Self::Line { worker, .. } | Self::Exited { worker, .. } => *worker,
        }
    }
}

/// Sender half of the scheduler's event channel
pub type EventSender = mpsc::UnboundedSender<WorkerEvent>;

/// Starts workers
pub trait WorkerLauncher: Send + Sync {
    /// Start a worker migrating `chunk`
    ///
    /// `attempt` is zero for the first run of a chunk.
    ///
    /// # Errors
    /// Returns `PoolError::Spawn` if the worker could not be started. No
    /// events are sent for a worker that failed to start.
    fn launch(
        &self,
        chunk: &Chunk,
        attempt: u32,
        worker: WorkerId,
        events: EventSender,
    ) -> Result<Box<dyn WorkerHandle>, PoolError>;
}

/// Control over a running worker
#[async_trait]
pub trait WorkerHandle: Send {
    /// OS process id, if any
    fn pid(&self) -> Option<u32>;

    /// Ask the worker to stop, forcing it after `grace`
    async fn terminate(&mut self, grace: Duration);
}

/// Command-line arguments that make a worker migrate exactly `chunk`
///
/// Workers always run forced so a completion marker left by an earlier full
/// run does not make them skip their range.
#[must_use]
pub fn worker_args(source: &str, chunk: &Chunk, config: &RunConfig) -> Vec<String> {
    let mut args = vec![
        source.to_string(),
        format!("--entity={}", chunk.entity),
        format!("--offset={}", chunk.offset),
        format!("--limit={}", chunk.limit),
        format!("--batch={}", config.batch_size),
        "--worker".to_string(),
        "--force".to_string(),
    ];

    if let Some(mb) = config.memory_limit_mb {
        args.push(format!("--memory-limit={mb}"));
    }
    if config.dry_run {
        args.push("--dry-run".to_string());
    }
    if config.use_ssh {
        args.push("--ssh".to_string());
    }
    if config.download_media {
        args.push("--download-media".to_string());
    }
    if let Some(url) = &config.base_url {
        args.push(format!("--base-url={url}"));
    }
    if let Some(id) = config.user_id {
        args.push(format!("--id={id}"));
    }
    if !config.excluded.is_empty() {
        let excluded: Vec<&str> = config.excluded.iter().map(String::as_str).collect();
        args.push(format!("--excluded={}", excluded.join(",")));
    }
    args
}

/// Launches workers as child processes of `program`
///
/// The command line is `program <leading args> <worker args> <trailing args>`.
/// Leading args usually carry the subcommand, trailing args settings such as
/// `--config=<path>`.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    leading_args: Vec<String>,
    trailing_args: Vec<String>,
    source: String,
    config: Arc<RunConfig>,
    run_id: Option<RunId>,
}

impl ProcessLauncher {
    #[must_use]
    pub fn new(program: impl Into<PathBuf>, source: impl Into<String>, config: Arc<RunConfig>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
            trailing_args: Vec::new(),
            source: source.into(),
            config,
            run_id: None,
        }
    }

    /// Relaunch the current executable
    ///
    /// # Errors
    /// Returns an I/O error if the current executable cannot be located.
    pub fn current_exe(source: impl Into<String>, config: Arc<RunConfig>) -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, source, config))
    }

    #[must_use]
    pub fn with_leading_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.leading_args = args.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_trailing_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.trailing_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Make workers record their details under the parent's run
    #[must_use]
    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }

    /// Full argument list for `chunk`
    #[must_use]
    pub fn args_for(&self, chunk: &Chunk) -> Vec<String> {
        let mut args = self.leading_args.clone();
        args.extend(worker_args(&self.source, chunk, &self.config));
        if let Some(run_id) = self.run_id {
            args.push(format!("--run-id={run_id}"));
        }
        args.extend(self.trailing_args.iter().cloned());
        args
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(
        &self,
        chunk: &Chunk,
        attempt: u32,
        worker: WorkerId,
        events: EventSender,
    ) -> Result<Box<dyn WorkerHandle>, PoolError> {
        let args = self.args_for(chunk);
        tracing::debug!(%worker, %chunk, attempt, ?args, "spawning worker process");

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| PoolError::Spawn {
                chunk: chunk.to_string(),
                source,
            })?;

        let pid = child.id();
        let mut readers: Vec<JoinHandle<()>> = [
            child
                .stdout
                .take()
                .map(|s| tokio::spawn(forward_lines(s, worker, StreamKind::Stdout, events.clone()))),
            child
                .stderr
                .take()
                .map(|s| tokio::spawn(forward_lines(s, worker, StreamKind::Stderr, events.clone()))),
        ]
        .into_iter()
        .flatten()
        .collect();
        let reader_aborts: Vec<AbortHandle> = readers.iter().map(JoinHandle::abort_handle).collect();

        // Readers run on their own tasks, so a full pipe never blocks the wait
        let pump = tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    tracing::warn!(%worker, error = %e, "failed to reap worker process");
                    None
                }
            };
            let drained =
                tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, futures::future::join_all(readers.iter_mut())).await;
            if drained.is_err() {
                tracing::warn!(%worker, "worker output still open after exit, detaching");
                for reader in &readers {
                    reader.abort();
                }
            }
            let _ = events.send(WorkerEvent::Exited { worker, code });
        });

        Ok(Box::new(ProcessHandle {
            pid,
            pump,
            readers: reader_aborts,
        }))
    }
}

/// Forward complete lines until EOF
///
/// Bytes that are not UTF-8 are replaced rather than ending the stream, so the
/// worker never writes into a closed pipe.
async fn forward_lines<R>(reader: R, worker: WorkerId, stream: StreamKind, events: EventSender)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = decode_line(&buf);
                if events.send(WorkerEvent::Line { worker, stream, line }).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(%worker, ?stream, error = %e, "worker stream closed");
                break;
            }
        }
    }
}

/// One raw line without its terminator, lossily decoded
fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

/// Handle to a worker child process
///
/// The child is owned by the pump task; aborting the task drops the child,
/// which kills it.
#[derive(Debug)]
struct ProcessHandle {
    pid: Option<u32>,
    pump: JoinHandle<()>,
    readers: Vec<AbortHandle>,
}

impl ProcessHandle {
    fn abort(&self) {
        self.pump.abort();
        for reader in &self.readers {
            reader.abort();
        }
    }
}

#[async_trait]
impl WorkerHandle for ProcessHandle {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn terminate(&mut self, grace: Duration) {
        if !signal::terminate(self.pid) {
            self.abort();
            return;
        }
        if tokio::time::timeout(grace, &mut self.pump).await.is_err() {
            tracing::warn!(pid = ?self.pid, "worker ignored SIGTERM, killing");
            signal::kill(self.pid);
            self.abort();
        }
    }
}

#[cfg(unix)]
mod signal {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    fn deliver(pid: Option<u32>, sig: Signal) -> bool {
        let Some(raw) = pid.and_then(|p| i32::try_from(p).ok()) else {
            return false;
        };
        match signal::kill(Pid::from_raw(raw), sig) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(pid = raw, signal = ?sig, error = %e, "signal not delivered");
                false
            }
        }
    }

    pub(super) fn terminate(pid: Option<u32>) -> bool {
        deliver(pid, Signal::SIGTERM)
    }

    pub(super) fn kill(pid: Option<u32>) {
        deliver(pid, Signal::SIGKILL);
    }
}

#[cfg(not(unix))]
mod signal {
    pub(super) fn terminate(_pid: Option<u32>) -> bool {
        false
    }

    pub(super) fn kill(_pid: Option<u32>) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn worker_args_carry_chunk_and_config() {
        let config = RunConfig::new(["users"])
            .with_batch_size(50)
            .with_user_id(7)
            .with_excluded(["comments", "attachments"]);
        let chunk = Chunk::new("users", 200, 100);

        assert_eq!(
            worker_args("legacy", &chunk, &config),
            vec![
                "legacy",
                "--entity=users",
                "--offset=200",
                "--limit=100",
                "--batch=50",
                "--worker",
                "--force",
                "--id=7",
                "--excluded=attachments,comments",
            ]
        );
    }

    #[test]
    fn worker_args_forward_flags() {
        let mut config = RunConfig::new(["users"]).dry_run();
        config.use_ssh = true;
        config.memory_limit_mb = Some(512);
        let args = worker_args("legacy", &Chunk::new("users", 0, 10), &config);

        assert!(args.contains(&"--memory-limit=512".to_string()));
        assert!(args.contains(&"--dry-run".to_string()));
        assert!(args.contains(&"--ssh".to_string()));
    }

    #[test]
    fn worker_args_forward_media_and_links() {
        let mut config = RunConfig::new(["posts"]);
        config.download_media = true;
        config.base_url = Some("https://old.example.com".into());
        let args = worker_args("legacy", &Chunk::new("posts", 0, 10), &config);

        assert!(args.contains(&"--download-media".to_string()));
        assert!(args.contains(&"--base-url=https://old.example.com".to_string()));
    }

    #[test]
    fn run_id_precedes_trailing_args() {
        let run_id = RunId::new();
        let launcher = ProcessLauncher::new("ferry", "legacy", Arc::new(RunConfig::new(["users"])))
            .with_run_id(run_id)
            .with_trailing_args(["--config=ferry.toml"]);
        let args = launcher.args_for(&Chunk::new("users", 0, 10));

        let n = args.len();
        assert_eq!(args[n - 2], format!("--run-id={run_id}"));
        assert_eq!(args[n - 1], "--config=ferry.toml");
    }

    #[test]
    fn lines_decode_lossily() {
        assert_eq!(decode_line(b"caf\xe9 title\n"), "caf\u{fffd} title");
        assert_eq!(decode_line(b"windows\r\n"), "windows");
        assert_eq!(decode_line(b"no newline"), "no newline");
    }

    #[test]
    fn process_launcher_wraps_worker_args() {
        let launcher = ProcessLauncher::new("ferry", "legacy", Arc::new(RunConfig::new(["users"])))
            .with_leading_args(["migrate"])
            .with_trailing_args(["--config=ferry.toml"]);
        let args = launcher.args_for(&Chunk::new("users", 0, 10));

        assert_eq!(args.first().map(String::as_str), Some("migrate"));
        assert_eq!(args.get(1).map(String::as_str), Some("legacy"));
        assert_eq!(args.last().map(String::as_str), Some("--config=ferry.toml"));
    }
}
