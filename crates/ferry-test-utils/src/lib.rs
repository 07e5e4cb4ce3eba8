//! Testing utilities for the Ferry workspace
//!
//! Shared fakes for orchestrator and worker pool tests: an in-memory source
//! with scriptable importers, capturing sinks, and a launcher that plays back
//! scripted worker runs instead of spawning processes.

#![allow(missing_docs)]

use async_trait::async_trait;
use ferry_core::{
    DependencyEdge, EntityImporter, ImportError, MigrationSource, OutputSink, ProgressSink,
    RunConfig, RunResult,
};
use ferry_pool::{
    Chunk, ChunkKey, EventSender, PoolError, StreamKind, WorkerEvent, WorkerHandle, WorkerId,
    WorkerLauncher,
};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Ordered log of importer calls shared by every fake of one test
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    #[must_use]
    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    /// Entities in import order
    #[must_use]
    pub fn imports(&self) -> Vec<String> {
        self.with_prefix("import:")
    }

    /// Entities in mark-completed order
    #[must_use]
    pub fn completions(&self) -> Vec<String> {
        self.with_prefix("complete:")
    }

    fn with_prefix(&self, prefix: &str) -> Vec<String> {
        self.0
            .lock()
            .iter()
            .filter_map(|e| e.strip_prefix(prefix).map(str::to_string))
            .collect()
    }
}

/// Scriptable importer
///
/// Imports `records` rows (narrowed by the attached config's offset and
/// limit), recording one migrated snapshot per row, unless told to fail.
#[derive(Debug)]
pub struct FakeImporter {
    name: String,
    dependencies: Vec<DependencyEdge>,
    records: u64,
    completed: Mutex<bool>,
    failure: Option<String>,
    config: Mutex<Option<Arc<RunConfig>>>,
    journal: Journal,
}

impl FakeImporter {
    #[must_use]
    pub fn new(name: impl Into<String>, journal: &Journal) -> Self {
        Self {
            name: name.into(),
            dependencies: Vec::new(),
            records: 3,
            completed: Mutex::new(false),
            failure: None,
            config: Mutex::new(None),
            journal: journal.clone(),
        }
    }

    #[must_use]
    pub fn with_dependency(mut self, edge: DependencyEdge) -> Self {
        self.dependencies.push(edge);
        self
    }

    #[must_use]
    pub fn with_records(mut self, records: u64) -> Self {
        self.records = records;
        self
    }

    /// Start out as completed by an earlier run
    #[must_use]
    pub fn completed(self) -> Self {
        *self.completed.lock() = true;
        self
    }

    /// Fail every import with `message`
    #[must_use]
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    /// Configuration attached by the orchestrator, if any
    #[must_use]
    pub fn config(&self) -> Option<Arc<RunConfig>> {
        self.config.lock().clone()
    }

    #[must_use]
    pub fn is_marked_completed(&self) -> bool {
        *self.completed.lock()
    }

    fn window(&self) -> u64 {
        let config = self.config.lock().clone().unwrap_or_default();
        let start = config.offset.unwrap_or(0).min(self.records);
        let available = self.records - start;
        config.limit.map_or(available, |l| l.min(available))
    }
}

#[async_trait]
impl EntityImporter for FakeImporter {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_config(&self, config: Arc<RunConfig>) {
        *self.config.lock() = Some(config);
    }

    fn dependencies(&self) -> Vec<DependencyEdge> {
        self.dependencies.clone()
    }

    async fn total_records(&self) -> Result<u64, ImportError> {
        Ok(self.records)
    }

    async fn is_completed(&self) -> Result<bool, ImportError> {
        Ok(*self.completed.lock())
    }

    async fn mark_completed(&self) -> Result<(), ImportError> {
        self.journal.push(format!("complete:{}", self.name));
        *self.completed.lock() = true;
        Ok(())
    }

    async fn import(
        &self,
        result: &RunResult,
        output: &dyn OutputSink,
        progress: &dyn ProgressSink,
    ) -> Result<u64, ImportError> {
        self.journal.push(format!("import:{}", self.name));
        if let Some(message) = &self.failure {
            return Err(ImportError::Source(message.clone()));
        }

        let rows = self.window();
        progress.start(rows);
        for row in 0..rows {
            result
                .record_migrated(&self.name, &serde_json::json!({ "row": row }))
                .await?;
            progress.advance(1);
        }
        progress.finish();
        result.increment_migrated(&self.name, rows);
        output.write_line(&format!("{}: {rows} rows", self.name));
        Ok(rows)
    }
}

/// In-memory source over a set of fake importers
#[derive(Debug, Default)]
pub struct FakeSource {
    importers: IndexMap<String, Arc<FakeImporter>>,
    query_log_disabled: AtomicUsize,
    cleanups: AtomicUsize,
}

impl FakeSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_importer(mut self, importer: FakeImporter) -> Self {
        self.importers
            .insert(importer.name.clone(), Arc::new(importer));
        self
    }

    /// Concrete importer, for assertions
    #[must_use]
    pub fn fake(&self, name: &str) -> Option<Arc<FakeImporter>> {
        self.importers.get(name).cloned()
    }

    #[must_use]
    pub fn query_log_disabled(&self) -> usize {
        self.query_log_disabled.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn cleanups(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MigrationSource for FakeSource {
    fn name(&self) -> &str {
        "fake"
    }

    fn connection(&self) -> &str {
        "memory"
    }

    fn disable_query_log(&self) {
        self.query_log_disabled.fetch_add(1, Ordering::SeqCst);
    }

    fn importer(&self, name: &str) -> Option<Arc<dyn EntityImporter>> {
        self.importers
            .get(name)
            .map(|i| Arc::clone(i) as Arc<dyn EntityImporter>)
    }

    fn importers(&self) -> IndexMap<String, Arc<dyn EntityImporter>> {
        self.importers
            .iter()
            .map(|(name, i)| (name.clone(), Arc::clone(i) as Arc<dyn EntityImporter>))
            .collect()
    }

    async fn cleanup(&self) -> Result<(), ImportError> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Output sink that keeps every line
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Mutex<Vec<String>>,
    errors: Mutex<Vec<String>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    #[must_use]
    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().clone()
    }

    #[must_use]
    pub fn contains(&self, needle: &str) -> bool {
        self.lines.lock().iter().any(|l| l.contains(needle))
    }
}

impl OutputSink for MemorySink {
    fn write_line(&self, line: &str) {
        self.lines.lock().push(line.to_string());
    }

    fn write_error(&self, line: &str) {
        self.errors.lock().push(line.to_string());
    }
}

/// Progress sink counting advanced steps
#[derive(Debug, Default)]
pub struct CountingProgress {
    steps: AtomicUsize,
}

impl CountingProgress {
    #[must_use]
    pub fn steps(&self) -> usize {
        self.steps.load(Ordering::SeqCst)
    }
}

impl ProgressSink for CountingProgress {
    fn start(&self, _total: u64) {}

    fn advance(&self, step: u64) {
        self.steps
            .fetch_add(usize::try_from(step).unwrap_or(usize::MAX), Ordering::SeqCst);
    }

    fn finish(&self) {}
}

/// One scripted worker run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerScript {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub exit_code: i32,
    pub delay: Duration,
}

impl WorkerScript {
    #[must_use]
    pub fn succeed() -> Self {
        Self::exit(0)
    }

    #[must_use]
    pub fn exit(code: i32) -> Self {
        Self {
            stdout: Vec::new(),
            stderr: Vec::new(),
            exit_code: code,
            delay: Duration::from_millis(5),
        }
    }

    #[must_use]
    pub fn with_stdout(mut self, line: impl Into<String>) -> Self {
        self.stdout.push(line.into());
        self
    }

    #[must_use]
    pub fn with_stderr(mut self, line: impl Into<String>) -> Self {
        self.stderr.push(line.into());
        self
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Launch record kept by [`ScriptedLauncher`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Launch {
    pub key: ChunkKey,
    pub attempt: u32,
}

/// Launcher replaying scripted runs per chunk offset
///
/// Attempt `n` of the chunk at an offset plays the `n`th script registered
/// for that offset; the last script repeats once they run out. Offsets with
/// no script play the default script.
#[derive(Debug)]
pub struct ScriptedLauncher {
    scripts: HashMap<u64, Vec<WorkerScript>>,
    default: WorkerScript,
    refuse: HashMap<u64, u32>,
    launches: Mutex<Vec<Launch>>,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    terminated: Arc<AtomicUsize>,
}

impl Default for ScriptedLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedLauncher {
    #[must_use]
    pub fn new() -> Self {
        Self {
            scripts: HashMap::new(),
            default: WorkerScript::succeed(),
            refuse: HashMap::new(),
            launches: Mutex::new(Vec::new()),
            running: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
            terminated: Arc::new(AtomicUsize::new(0)),
        }
    }

    #[must_use]
    pub fn with_default(mut self, script: WorkerScript) -> Self {
        self.default = script;
        self
    }

    /// Scripts for successive attempts of the chunk at `offset`
    #[must_use]
    pub fn script(mut self, offset: u64, attempts: Vec<WorkerScript>) -> Self {
        self.scripts.insert(offset, attempts);
        self
    }

    /// Fail to start the first `times` launches of the chunk at `offset`
    #[must_use]
    pub fn refuse_spawn(mut self, offset: u64, times: u32) -> Self {
        self.refuse.insert(offset, times);
        self
    }

    #[must_use]
    pub fn launches(&self) -> Vec<Launch> {
        self.launches.lock().clone()
    }

    /// Launches of the chunk at `offset`
    #[must_use]
    pub fn launches_at(&self, offset: u64) -> usize {
        self.launches
            .lock()
            .iter()
            .filter(|l| l.key.offset == offset)
            .count()
    }

    /// Most scripted workers alive at once
    #[must_use]
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn terminated(&self) -> usize {
        self.terminated.load(Ordering::SeqCst)
    }

    fn script_for(&self, offset: u64, attempt: u32) -> WorkerScript {
        let Some(scripts) = self.scripts.get(&offset) else {
            return self.default.clone();
        };
        let index = usize::try_from(attempt).unwrap_or(usize::MAX);
        scripts
            .get(index)
            .or_else(|| scripts.last())
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

impl WorkerLauncher for ScriptedLauncher {
    fn launch(
        &self,
        chunk: &Chunk,
        attempt: u32,
        worker: WorkerId,
        events: EventSender,
    ) -> Result<Box<dyn WorkerHandle>, PoolError> {
        self.launches.lock().push(Launch {
            key: chunk.key(),
            attempt,
        });

        if self.refuse.get(&chunk.offset).is_some_and(|&n| attempt < n) {
            return Err(PoolError::Spawn {
                chunk: chunk.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "scripted spawn failure"),
            });
        }

        let script = self.script_for(chunk.offset, attempt);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let guard = RunningGuard(Arc::clone(&self.running));

        let task = tokio::spawn(async move {
            tokio::time::sleep(script.delay).await;
            for line in script.stdout {
                let _ = events.send(WorkerEvent::Line {
                    worker,
                    stream: StreamKind::Stdout,
                    line,
                });
            }
            for line in script.stderr {
                let _ = events.send(WorkerEvent::Line {
                    worker,
                    stream: StreamKind::Stderr,
                    line,
                });
            }
            drop(guard);
            let _ = events.send(WorkerEvent::Exited {
                worker,
                code: Some(script.exit_code),
            });
        });

        Ok(Box::new(ScriptedHandle {
            task,
            terminated: Arc::clone(&self.terminated),
        }))
    }
}

/// Decrements the running count when a scripted worker ends or is aborted
#[derive(Debug)]
struct RunningGuard(Arc<AtomicUsize>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
struct ScriptedHandle {
    task: tokio::task::JoinHandle<()>,
    terminated: Arc<AtomicUsize>,
}

#[async_trait]
impl WorkerHandle for ScriptedHandle {
    fn pid(&self) -> Option<u32> {
        None
    }

    async fn terminate(&mut self, _grace: Duration) {
        self.terminated.fetch_add(1, Ordering::SeqCst);
        self.task.abort();
        let _ = (&mut self.task).await;
    }
}

/// Two-entity source where `orders` needs `users` first
#[must_use]
pub fn orders_and_users(journal: &Journal) -> FakeSource {
    FakeSource::new()
        .with_importer(FakeImporter::new("users", journal))
        .with_importer(
            FakeImporter::new("orders", journal).with_dependency(DependencyEdge::required_pre("users")),
        )
}
