//! Worker pool scheduler tests over scripted workers

use ferry_core::{OutputSink, RunResult, TableRow, TALLY_MARKER};
use ferry_pool::{ChunkKey, PoolError, PoolSettings, WorkerPoolScheduler};
use ferry_test_utils::{MemorySink, ScriptedLauncher, WorkerScript};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

fn settings(max_processes: usize, per_process: u64) -> PoolSettings {
    PoolSettings::default()
        .with_max_processes(max_processes)
        .with_max_records_per_process(per_process)
        .with_termination_grace(Duration::from_millis(50))
}

fn scheduler(
    settings: PoolSettings,
    launcher: &Arc<ScriptedLauncher>,
    sink: &Arc<MemorySink>,
) -> WorkerPoolScheduler {
    WorkerPoolScheduler::new(
        settings,
        Arc::clone(launcher) as Arc<dyn ferry_pool::WorkerLauncher>,
        Arc::clone(sink) as Arc<dyn OutputSink>,
    )
    .with_colors(false)
}

#[tokio::test]
async fn test_dispatches_uneven_range_in_offset_order() {
    let launcher = Arc::new(ScriptedLauncher::new());
    let sink = Arc::new(MemorySink::new());
    let mut pool = scheduler(settings(2, 100), &launcher, &sink);

    let ok = pool.migrate("users", 250).await.unwrap();

    assert!(ok);
    let dispatched: Vec<ChunkKey> = pool.dispatched_chunks().iter().map(|c| c.key()).collect();
    assert_eq!(
        dispatched,
        vec![
            ChunkKey { offset: 0, limit: 100 },
            ChunkKey { offset: 100, limit: 100 },
            ChunkKey { offset: 200, limit: 50 },
        ]
    );
    assert_eq!(pool.completed_chunks().len(), 3);
    assert!(pool.failed_chunks().is_empty());
    assert_eq!(pool.total_retries(), 0);
}

#[tokio::test]
async fn test_never_exceeds_max_processes() {
    let launcher = Arc::new(
        ScriptedLauncher::new().with_default(WorkerScript::succeed().with_delay(Duration::from_millis(20))),
    );
    let sink = Arc::new(MemorySink::new());
    let mut pool = scheduler(settings(3, 10), &launcher, &sink);

    assert!(pool.migrate("posts", 200).await.unwrap());

    assert_eq!(pool.completed_chunks().len(), 20);
    assert!(pool.peak_concurrency() <= 3);
    assert!(launcher.peak() <= 3);
    assert_eq!(pool.peak_concurrency(), 3);
}

#[tokio::test]
async fn test_retried_success_counts_retries() {
    let launcher = Arc::new(ScriptedLauncher::new().script(
        100,
        vec![WorkerScript::exit(1), WorkerScript::exit(1), WorkerScript::succeed()],
    ));
    let sink = Arc::new(MemorySink::new());
    let mut pool = scheduler(settings(2, 100), &launcher, &sink);

    assert!(pool.migrate("users", 250).await.unwrap());

    assert_eq!(pool.retry_count(ChunkKey { offset: 100, limit: 100 }), 2);
    assert_eq!(pool.total_retries(), 2);
    assert!(pool.failed_chunks().is_empty());
    let retried = pool
        .completed_chunks()
        .iter()
        .find(|c| c.chunk.offset == 100)
        .unwrap();
    assert_eq!(retried.attempts, 3);
    assert_eq!(launcher.launches_at(100), 3);
    assert_eq!(pool.dispatched_chunks().len(), 3);
    assert!(sink.contains("Retrying chunk at offset 100 (attempt 1/3)"));
}

#[tokio::test]
async fn test_exhausted_chunk_is_reported_once() {
    let launcher = Arc::new(ScriptedLauncher::new().script(
        0,
        vec![WorkerScript::exit(2).with_stderr("connection refused")],
    ));
    let sink = Arc::new(MemorySink::new());
    let mut pool = scheduler(settings(2, 100).with_max_retries(3), &launcher, &sink);

    let ok = pool.migrate("users", 250).await.unwrap();

    assert!(!ok);
    assert_eq!(launcher.launches_at(0), 4);
    assert_eq!(pool.failed_chunks().len(), 1);
    let failure = &pool.failed_chunks()[0];
    assert_eq!(failure.chunk.offset, 0);
    assert_eq!(failure.exit_code, Some(2));
    assert_eq!(failure.error, "connection refused");
    assert_eq!(failure.attempts, 4);
    assert_eq!(pool.completed_chunks().len(), 2);
    assert!(pool.completed_chunks().iter().all(|c| c.chunk.offset != 0));
}

#[tokio::test]
async fn test_silent_failure_reports_unknown_error() {
    let launcher = Arc::new(ScriptedLauncher::new().with_default(WorkerScript::exit(1)));
    let sink = Arc::new(MemorySink::new());
    let mut pool = scheduler(settings(1, 100).with_max_retries(0), &launcher, &sink);

    assert!(!pool.migrate("users", 50).await.unwrap());

    assert_eq!(launcher.launches_at(0), 1);
    assert_eq!(pool.failed_chunks()[0].error, "Unknown error");
}

#[tokio::test]
async fn test_spawn_failures_are_retried() {
    let launcher = Arc::new(ScriptedLauncher::new().refuse_spawn(100, 1));
    let sink = Arc::new(MemorySink::new());
    let mut pool = scheduler(settings(2, 100), &launcher, &sink);

    assert!(pool.migrate("users", 200).await.unwrap());

    assert_eq!(pool.retry_count(ChunkKey { offset: 100, limit: 100 }), 1);
    assert_eq!(pool.completed_chunks().len(), 2);
}

#[tokio::test]
async fn test_worker_output_is_prefixed_and_progress_dropped() {
    let launcher = Arc::new(
        ScriptedLauncher::new().with_default(
            WorkerScript::succeed()
                .with_stdout("Migrating users...")
                .with_stdout("5/10 [=============>              ] 50%")
                .with_stdout("│ users │ 10 │")
                .with_stderr("slow query"),
        ),
    );
    let sink = Arc::new(MemorySink::new());
    let mut pool = scheduler(settings(1, 10), &launcher, &sink);

    assert!(pool.migrate("users", 10).await.unwrap());

    assert_eq!(
        sink.lines(),
        vec!["[Worker 0] Migrating users...".to_string(), "│ users │ 10 │".to_string()]
    );
    assert_eq!(sink.errors(), vec!["[Worker 0 ERROR] slow query".to_string()]);
}

#[tokio::test]
async fn test_empty_range_spawns_nothing() {
    let launcher = Arc::new(ScriptedLauncher::new());
    let sink = Arc::new(MemorySink::new());
    let mut pool = scheduler(settings(4, 100).with_start_offset(500), &launcher, &sink);

    assert!(pool.migrate("users", 250).await.unwrap());
    assert!(launcher.launches().is_empty());
    assert_eq!(pool.peak_concurrency(), 0);
}

#[tokio::test]
async fn test_invalid_settings_spawn_nothing() {
    let launcher = Arc::new(ScriptedLauncher::new());
    let sink = Arc::new(MemorySink::new());
    let mut pool = scheduler(settings(0, 100), &launcher, &sink);

    let err = pool.migrate("users", 250).await.unwrap_err();
    assert!(matches!(err, PoolError::InvalidSettings(_)));
    assert!(launcher.launches().is_empty());
}

#[tokio::test]
async fn test_shutdown_terminates_active_workers() {
    let launcher = Arc::new(
        ScriptedLauncher::new().with_default(WorkerScript::succeed().with_delay(Duration::from_secs(60))),
    );
    let sink = Arc::new(MemorySink::new());
    let (tx, rx) = tokio::sync::watch::channel(false);
    let mut pool = scheduler(settings(2, 100), &launcher, &sink).with_shutdown(rx);

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = tx.send(true);
    });

    let err = pool.migrate("users", 1_000).await.unwrap_err();

    assert!(matches!(err, PoolError::Interrupted));
    assert_eq!(launcher.terminated(), 2);
    assert_eq!(pool.active_count(), 0);
    assert!(pool.completed_chunks().is_empty());
}

#[tokio::test]
async fn test_report_lists_completed_and_failed_chunks() {
    let launcher = Arc::new(
        ScriptedLauncher::new().script(100, vec![WorkerScript::exit(3).with_stderr("disk full")]),
    );
    let sink = Arc::new(MemorySink::new());
    let mut pool = scheduler(settings(2, 100).with_max_retries(1), &launcher, &sink);

    assert!(!pool.migrate("users", 200).await.unwrap());

    let report = pool.report_lines();
    assert_eq!(report.first().map(String::as_str), Some("Completed chunks: 1"));
    assert!(report.iter().any(|l| l == "Failed chunks: 1"));
    assert!(report.iter().any(|l| l.contains("disk full")));
    assert_eq!(report.last().map(String::as_str), Some("Total retries: 1"));
}

fn tally(entity: &str, migrated: u64, failed: u64) -> String {
    TableRow {
        entity: entity.to_string(),
        migrated,
        skipped: 0,
        failed,
    }
    .to_tally_line()
}

#[tokio::test]
async fn test_tallies_of_successful_workers_are_summed() {
    let launcher = Arc::new(
        ScriptedLauncher::new()
            .with_default(WorkerScript::succeed().with_stdout(tally("users", 100, 0)))
            .script(
                100,
                vec![
                    WorkerScript::exit(1).with_stdout(tally("users", 40, 0)),
                    WorkerScript::succeed().with_stdout(tally("users", 99, 1)),
                ],
            )
            .script(200, vec![WorkerScript::succeed().with_stdout(tally("users", 50, 0))]),
    );
    let sink = Arc::new(MemorySink::new());
    let result = Arc::new(RunResult::new());
    let mut pool = scheduler(settings(2, 100), &launcher, &sink).with_result(Arc::clone(&result));

    assert!(pool.migrate("users", 250).await.unwrap());

    let users = result.counts("users").unwrap();
    assert_eq!((users.migrated, users.skipped, users.failed), (249, 0, 1));
    assert!(!sink.contains(TALLY_MARKER.trim_end()));
    assert!(Arc::ptr_eq(pool.result(), &result));
}
