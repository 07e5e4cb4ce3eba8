//! Worker pool scheduler
//!
//! Fans one entity's record range out across a bounded number of worker
//! processes. The scheduler is a single control loop driven by worker events:
//! it fills free slots in offset order, retries failed chunks in place, and
//! stops every worker when a shutdown is requested.
//!
//! Workers report their per-entity counts as tally lines on stdout. Tallies of
//! a successful run are added to the scheduler's [`RunResult`]; those of a
//! failed attempt are dropped with it.

use crate::chunk::{Chunk, ChunkKey, ChunkPlanner};
use crate::error::PoolError;
use crate::launcher::{EventSender, StreamKind, WorkerEvent, WorkerHandle, WorkerId, WorkerLauncher};
use crate::multiplex::{Color, OutputMultiplexer};
use ferry_core::{render_table, OutputSink, RunConfig, RunResult, TableRow};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Time a worker gets between SIGTERM and SIGKILL
pub const DEFAULT_TERMINATION_GRACE: Duration = Duration::from_secs(3);

const UNKNOWN_ERROR: &str = "Unknown error";

/// Pool sizing and retry policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSettings {
    /// Concurrently running workers
    pub max_processes: usize,
    /// Records per chunk
    pub max_records_per_process: u64,
    /// First offset to dispatch
    pub start_offset: u64,
    /// Reruns of a failed chunk before it is reported
    pub max_retries: u32,
    /// Grace period before a terminated worker is killed
    pub termination_grace: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self::from_config(&RunConfig::default())
    }
}

impl PoolSettings {
    /// Settings for a parallel run of `config`
    #[must_use]
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            max_processes: config.max_processes,
            max_records_per_process: config.max_records_per_process,
            start_offset: config.offset.unwrap_or(0),
            max_retries: config.max_retries,
            termination_grace: DEFAULT_TERMINATION_GRACE,
        }
    }

    #[must_use]
    pub fn with_max_processes(mut self, max_processes: usize) -> Self {
        self.max_processes = max_processes;
        self
    }

    #[must_use]
    pub fn with_max_records_per_process(mut self, max_records: u64) -> Self {
        self.max_records_per_process = max_records;
        self
    }

    #[must_use]
    pub fn with_start_offset(mut self, offset: u64) -> Self {
        self.start_offset = offset;
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_termination_grace(mut self, grace: Duration) -> Self {
        self.termination_grace = grace;
        self
    }

    /// Check the settings can make progress
    ///
    /// # Errors
    /// Returns `PoolError::InvalidSettings` for a zero process count or chunk size.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_processes == 0 {
            return Err(PoolError::InvalidSettings("max_processes must be at least 1".into()));
        }
        if self.max_records_per_process == 0 {
            return Err(PoolError::InvalidSettings(
                "max_records_per_process must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// End of the range a parallel run covers
///
/// With a limit the run stops at `offset + limit`, never past the source's
/// record count.
#[must_use]
pub fn range_end(total_records: u64, config: &RunConfig) -> u64 {
    match config.limit {
        Some(limit) => total_records.min(config.offset.unwrap_or(0).saturating_add(limit)),
        None => total_records,
    }
}

/// A chunk that exited successfully
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedChunk {
    pub chunk: Chunk,
    /// Runs it took, including the successful one
    pub attempts: u32,
}

/// A chunk that kept failing after every retry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFailure {
    pub chunk: Chunk,
    pub attempts: u32,
    /// Exit code of the last run; `None` if killed or never started
    pub exit_code: Option<i32>,
    /// Captured stderr of the last run, `"Unknown error"` when it was empty
    pub error: String,
    /// Captured stdout of the last run
    pub output: String,
}

struct ActiveWorker {
    chunk: Chunk,
    attempt: u32,
    color: Color,
    handle: Box<dyn WorkerHandle>,
    stdout: Vec<String>,
    stderr: Vec<String>,
    tallies: Vec<TableRow>,
}

#[derive(Default)]
struct PoolState {
    active: HashMap<WorkerId, ActiveWorker>,
    completed: Vec<CompletedChunk>,
    failed: Vec<ChunkFailure>,
    retries: BTreeMap<ChunkKey, u32>,
    dispatched: Vec<Chunk>,
    peak_active: usize,
    next_worker: u64,
}

enum Wake {
    Event(Option<WorkerEvent>),
    Shutdown,
}

/// Bounded, retrying worker pool for one entity at a time
pub struct WorkerPoolScheduler {
    settings: PoolSettings,
    launcher: Arc<dyn WorkerLauncher>,
    output: OutputMultiplexer,
    shutdown: Option<watch::Receiver<bool>>,
    result: Arc<RunResult>,
    state: PoolState,
}

impl std::fmt::Debug for WorkerPoolScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPoolScheduler")
            .field("settings", &self.settings)
            .field("active", &self.state.active.len())
            .field("completed", &self.state.completed.len())
            .field("failed", &self.state.failed.len())
            .finish_non_exhaustive()
    }
}

impl WorkerPoolScheduler {
    #[must_use]
    pub fn new(settings: PoolSettings, launcher: Arc<dyn WorkerLauncher>, output: Arc<dyn OutputSink>) -> Self {
        Self {
            settings,
            launcher,
            output: OutputMultiplexer::new(output),
            shutdown: None,
            result: Arc::new(RunResult::new()),
            state: PoolState::default(),
        }
    }

    /// Add worker tallies to `result` instead of a private one
    #[must_use]
    pub fn with_result(mut self, result: Arc<RunResult>) -> Self {
        self.result = result;
        self
    }

    /// Counts reported by successful workers
    #[inline]
    #[must_use]
    pub fn result(&self) -> &Arc<RunResult> {
        &self.result
    }

    /// Enable or disable colored worker prefixes
    #[must_use]
    pub fn with_colors(mut self, colored: bool) -> Self {
        self.output = self.output.with_colors(colored);
        self
    }

    /// Stop all workers and return `PoolError::Interrupted` once `shutdown`
    /// turns true
    #[must_use]
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    #[inline]
    #[must_use]
    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Migrate `[start_offset, total_records)` of `entity`
    ///
    /// Returns `Ok(true)` iff every chunk eventually succeeded. Results of a
    /// previous call are discarded.
    ///
    /// # Errors
    /// - `PoolError::InvalidSettings` before anything is spawned
    /// - `PoolError::Interrupted` after a shutdown request; all workers have
    ///   been terminated by then
    pub async fn migrate(&mut self, entity: &str, total_records: u64) -> Result<bool, PoolError> {
        self.settings.validate()?;
        self.terminate_all().await;
        self.state = PoolState::default();

        let mut planner = ChunkPlanner::new(
            entity,
            self.settings.start_offset,
            total_records,
            self.settings.max_records_per_process,
        );
        tracing::info!(
            entity,
            total_records,
            start_offset = self.settings.start_offset,
            max_processes = self.settings.max_processes,
            chunk_size = self.settings.max_records_per_process,
            "starting worker pool"
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut shutdown = self.shutdown.clone();

        loop {
            self.fill_slots(&mut planner, &tx);
            if self.state.active.is_empty() {
                break;
            }

            let wake = tokio::select! {
                event = rx.recv() => Wake::Event(event),
                () = shutdown_requested(&mut shutdown) => Wake::Shutdown,
            };

            match wake {
                Wake::Event(Some(event)) => self.handle_event(event, &tx),
                Wake::Event(None) => return Err(PoolError::ChannelClosed),
                Wake::Shutdown => {
                    tracing::warn!(entity, active = self.state.active.len(), "shutdown requested");
                    self.terminate_all().await;
                    return Err(PoolError::Interrupted);
                }
            }
        }

        tracing::info!(
            entity,
            completed = self.state.completed.len(),
            failed = self.state.failed.len(),
            retries = self.total_retries(),
            "worker pool finished"
        );
        Ok(self.state.failed.is_empty())
    }

    /// Stop every live worker
    ///
    /// Each worker gets SIGTERM, then SIGKILL once the grace period passes.
    /// Workers are stopped concurrently and the active set is cleared.
    pub async fn terminate_all(&mut self) {
        let mut workers: Vec<ActiveWorker> = self.state.active.drain().map(|(_, w)| w).collect();
        if workers.is_empty() {
            return;
        }

        tracing::warn!(count = workers.len(), "terminating workers");
        let grace = self.settings.termination_grace;
        futures::future::join_all(workers.iter_mut().map(|w| w.handle.terminate(grace))).await;

        for worker in workers {
            self.output.release_color(worker.color);
        }
    }

    fn fill_slots(&mut self, planner: &mut ChunkPlanner, tx: &EventSender) {
        while self.state.active.len() < self.settings.max_processes {
            let Some(chunk) = planner.next() else {
                break;
            };
            self.state.dispatched.push(chunk.clone());
            self.spawn(chunk, 0, tx);
        }
    }

    fn spawn(&mut self, chunk: Chunk, attempt: u32, tx: &EventSender) {
        let worker = WorkerId(self.state.next_worker);
        self.state.next_worker += 1;

        match self.launcher.launch(&chunk, attempt, worker, tx.clone()) {
            Ok(handle) => {
                tracing::debug!(%worker, %chunk, attempt, pid = ?handle.pid(), "worker started");
                let color = self.output.acquire_color();
                self.state.active.insert(
                    worker,
                    ActiveWorker {
                        chunk,
                        attempt,
                        color,
                        handle,
                        stdout: Vec::new(),
                        stderr: Vec::new(),
                        tallies: Vec::new(),
                    },
                );
                self.state.peak_active = self.state.peak_active.max(self.state.active.len());
            }
            Err(e) => {
                tracing::error!(%chunk, attempt, error = %e, "failed to start worker");
                self.retry_or_fail(chunk, attempt, None, e.to_string(), String::new(), tx);
            }
        }
    }

    fn handle_event(&mut self, event: WorkerEvent, tx: &EventSender) {
        match event {
            WorkerEvent::Line { worker, stream, line } => {
                // Lines of a terminated worker may still be in flight
                let Some(active) = self.state.active.get_mut(&worker) else {
                    return;
                };
                if stream == StreamKind::Stdout {
                    if let Some(tally) = TableRow::from_tally_line(&line) {
                        active.tallies.push(tally);
                        return;
                    }
                }
                self.output.emit(active.chunk.offset, active.color, stream, &line);
                match stream {
                    StreamKind::Stdout => active.stdout.push(line),
                    StreamKind::Stderr => active.stderr.push(line),
                }
            }
            WorkerEvent::Exited { worker, code } => {
                let Some(active) = self.state.active.remove(&worker) else {
                    return;
                };
                self.output.release_color(active.color);
                self.finish(active, code, tx);
            }
        }
    }

    fn finish(&mut self, worker: ActiveWorker, code: Option<i32>, tx: &EventSender) {
        if code == Some(0) {
            tracing::info!(chunk = %worker.chunk, attempts = worker.attempt + 1, "chunk completed");
            for tally in &worker.tallies {
                self.result.absorb(tally);
            }
            self.state.completed.push(CompletedChunk {
                chunk: worker.chunk,
                attempts: worker.attempt + 1,
            });
            return;
        }

        let error = worker.stderr.join("\n");
        let output = worker.stdout.join("\n");
        self.output.notice(
            worker.chunk.offset,
            worker.color,
            &format!("exited with code {}", describe_exit(code)),
        );
        self.retry_or_fail(worker.chunk, worker.attempt, code, error, output, tx);
    }

    fn retry_or_fail(
        &mut self,
        chunk: Chunk,
        attempt: u32,
        exit_code: Option<i32>,
        error: String,
        output: String,
        tx: &EventSender,
    ) {
        if attempt < self.settings.max_retries {
            *self.state.retries.entry(chunk.key()).or_insert(0) += 1;
            tracing::warn!(
                %chunk,
                attempt = attempt + 1,
                max_retries = self.settings.max_retries,
                exit_code = ?exit_code,
                "retrying chunk"
            );
            self.output.sink().write_line(&format!(
                "Retrying chunk at offset {} (attempt {}/{})",
                chunk.offset,
                attempt + 1,
                self.settings.max_retries
            ));
            self.spawn(chunk, attempt + 1, tx);
            return;
        }

        tracing::error!(%chunk, attempts = attempt + 1, exit_code = ?exit_code, "chunk failed");
        let error = if error.trim().is_empty() {
            UNKNOWN_ERROR.to_string()
        } else {
            error
        };
        self.state.failed.push(ChunkFailure {
            chunk,
            attempts: attempt + 1,
            exit_code,
            error,
            output,
        });
    }

    /// Chunks that succeeded, in completion order
    #[inline]
    #[must_use]
    pub fn completed_chunks(&self) -> &[CompletedChunk] {
        &self.state.completed
    }

    /// Chunks that exhausted their retries, in failure order
    #[inline]
    #[must_use]
    pub fn failed_chunks(&self) -> &[ChunkFailure] {
        &self.state.failed
    }

    /// Retries per chunk; chunks that never failed are absent
    #[inline]
    #[must_use]
    pub fn retry_counts(&self) -> &BTreeMap<ChunkKey, u32> {
        &self.state.retries
    }

    #[must_use]
    pub fn retry_count(&self, key: ChunkKey) -> u32 {
        self.state.retries.get(&key).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn total_retries(&self) -> u32 {
        self.state.retries.values().sum()
    }

    /// Most workers alive at the same time
    #[inline]
    #[must_use]
    pub fn peak_concurrency(&self) -> usize {
        self.state.peak_active
    }

    /// Chunks in dispatch order, retries excluded
    #[inline]
    #[must_use]
    pub fn dispatched_chunks(&self) -> &[Chunk] {
        &self.state.dispatched
    }

    #[inline]
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.state.active.len()
    }

    /// End-of-run report: completed and failed chunk tables plus retry total
    #[must_use]
    pub fn report_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();

        lines.push(format!("Completed chunks: {}", self.state.completed.len()));
        if !self.state.completed.is_empty() {
            let mut completed: Vec<&CompletedChunk> = self.state.completed.iter().collect();
            completed.sort_by_key(|c| c.chunk.offset);
            let rows: Vec<Vec<String>> = completed
                .iter()
                .map(|c| {
                    vec![
                        c.chunk.offset.to_string(),
                        c.chunk.limit.to_string(),
                        self.retry_count(c.chunk.key()).to_string(),
                    ]
                })
                .collect();
            lines.extend(render_table(&["Offset", "Limit", "Retries"], &rows));
        }

        if !self.state.failed.is_empty() {
            lines.push(format!("Failed chunks: {}", self.state.failed.len()));
            let rows: Vec<Vec<String>> = self
                .state
                .failed
                .iter()
                .map(|f| {
                    vec![
                        f.chunk.offset.to_string(),
                        f.chunk.limit.to_string(),
                        self.retry_count(f.chunk.key()).to_string(),
                        describe_exit(f.exit_code),
                        first_line(&f.error),
                    ]
                })
                .collect();
            lines.extend(render_table(&["Offset", "Limit", "Retries", "Exit", "Error"], &rows));
        }

        lines.push(format!("Total retries: {}", self.total_retries()));
        lines
    }
}

async fn shutdown_requested(shutdown: &mut Option<watch::Receiver<bool>>) {
    let Some(rx) = shutdown else {
        return std::future::pending().await;
    };
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone: shutdown can no longer be requested
            return std::future::pending().await;
        }
    }
}

fn describe_exit(code: Option<i32>) -> String {
    code.map_or_else(|| "signal".to_string(), |c| c.to_string())
}

fn first_line(text: &str) -> String {
    const MAX: usize = 80;
    let line = text.lines().next().unwrap_or_default();
    if line.chars().count() > MAX {
        let cut: String = line.chars().take(MAX - 3).collect();
        format!("{cut}...")
    } else {
        line.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_follow_run_config() {
        let config = RunConfig::new(["users"]).with_offset(500).with_parallelism(6, 2_000);
        let settings = PoolSettings::from_config(&config);

        assert_eq!(settings.max_processes, 6);
        assert_eq!(settings.max_records_per_process, 2_000);
        assert_eq!(settings.start_offset, 500);
        assert_eq!(settings.max_retries, ferry_core::types::DEFAULT_MAX_RETRIES);
        assert_eq!(settings.termination_grace, DEFAULT_TERMINATION_GRACE);
    }

    #[test]
    fn zero_sized_settings_are_rejected() {
        assert!(PoolSettings::default().with_max_processes(0).validate().is_err());
        assert!(PoolSettings::default().with_max_records_per_process(0).validate().is_err());
        assert!(PoolSettings::default().validate().is_ok());
    }

    #[test]
    fn range_end_applies_limit() {
        let config = RunConfig::new(["users"]);
        assert_eq!(range_end(1_000, &config), 1_000);
        assert_eq!(range_end(1_000, &config.clone().with_limit(300)), 300);
        assert_eq!(range_end(1_000, &config.clone().with_offset(900).with_limit(300)), 1_000);
        assert_eq!(range_end(1_000, &config.with_offset(100).with_limit(300)), 400);
    }

    #[test]
    fn failure_text_is_truncated_to_first_line() {
        assert_eq!(first_line("boom\ntrace"), "boom");
        let long = "x".repeat(120);
        assert_eq!(first_line(&long).chars().count(), 80);
        assert_eq!(describe_exit(Some(2)), "2");
        assert_eq!(describe_exit(None), "signal");
    }
}
