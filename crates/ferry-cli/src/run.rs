//! Command execution
//!
//! A `migrate` invocation takes one of three paths:
//! - worker: migrate exactly one chunk of one entity and print its tallies
//! - parallel: fan one entity out across worker processes
//! - sequential: walk the requested entities in dependency order
//!
//! Detail records go to a JSON-lines store under the source's state
//! directory and outlive the run; `ferry records` reads or purges them.

use crate::cli::{Action, MigrateArgs, OptionalArgs, Paths, RecordsArgs};
use crate::manifest::ManifestSource;
use crate::settings::{Settings, DEFAULT_STATE_DIR};
use crate::shutdown::{self, Shutdown};
use crate::telemetry;
use anyhow::Context;
use ferry_core::{
    render_table, ConfigError, ConsoleOutput, ConsoleProgress, DependencyOrchestrator,
    EntityImporter, JsonLinesRecordStore, MigrateError, MigrationSource, OutputSink, Outcome,
    RecordStore, RunConfig, RunResult,
};
use ferry_pool::{range_end, PoolError, PoolSettings, ProcessLauncher, WorkerPoolScheduler};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;

/// Everything succeeded
pub const EXIT_OK: i32 = 0;
/// The run finished with failed chunks, or an importer failed
pub const EXIT_FAILED: i32 = 1;
/// Invalid flags, settings or manifest
pub const EXIT_CONFIG: i32 = 2;
/// Stopped by SIGINT or SIGTERM
pub const EXIT_INTERRUPTED: i32 = 130;

/// Process exit code for an error returned by [`execute`]
#[must_use]
pub fn exit_code(err: &anyhow::Error) -> i32 {
    if let Some(e) = err.downcast_ref::<MigrateError>() {
        if e.is_configuration() {
            return EXIT_CONFIG;
        }
    }
    if err.downcast_ref::<ConfigError>().is_some() {
        return EXIT_CONFIG;
    }
    if matches!(err.downcast_ref::<PoolError>(), Some(PoolError::InvalidSettings(_))) {
        return EXIT_CONFIG;
    }
    EXIT_FAILED
}

/// Load settings, install logging and signal handling, then run `action`
///
/// # Errors
/// Returns configuration and migration errors; see [`exit_code`].
pub async fn execute(action: Action) -> anyhow::Result<i32> {
    let worker = matches!(&action, Action::Migrate(args) if args.worker);
    let settings = Settings::discover(action.paths().config.as_deref()).await?;
    telemetry::init(&settings.logging, worker);

    let shutdown = Shutdown::new();
    shutdown.listen_for_signals();

    match action {
        Action::Migrate(args) => migrate(&args, &settings, &shutdown).await,
        Action::Optional(args) => optional(&args, &settings).await,
        Action::Records(args) => records(&args, &settings).await,
    }
}

/// Open the manifest source named `name`
///
/// Flags override the settings file's `[sources.<name>]` entry.
///
/// # Errors
/// Returns `ConfigError` if no manifest is known or it cannot be loaded.
pub async fn open_source(name: &str, paths: &Paths, settings: &Settings) -> Result<ManifestSource, ConfigError> {
    let configured = settings.source(name);
    let manifest = paths
        .manifest
        .clone()
        .or_else(|| configured.map(|s| s.manifest.clone()))
        .ok_or_else(|| ConfigError::invalid("source", format!("no manifest configured for '{name}'")))?;
    let state_dir = paths
        .state_dir
        .clone()
        .or_else(|| configured.and_then(|s| s.state_dir.clone()))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR));

    let source = ManifestSource::open(&manifest, state_dir).await?;
    if source.name() != name {
        tracing::warn!(requested = name, manifest = source.name(), "source name differs from manifest");
    }
    Ok(source)
}

/// Run `ferry migrate`
///
/// # Errors
/// Returns configuration errors and importer failures.
pub async fn migrate(args: &MigrateArgs, settings: &Settings, shutdown: &Shutdown) -> anyhow::Result<i32> {
    let config = Arc::new(args.run_config(&settings.defaults));
    config.validate()?;
    let source = open_source(&args.source, &args.paths, settings).await?;

    tracing::info!(
        source = %args.source,
        entities = ?config.entities,
        parallel = config.parallel,
        worker = args.worker,
        "migrate invoked"
    );

    let store = Arc::new(JsonLinesRecordStore::new(source.records_dir()));
    if !args.worker {
        match store.purge_expired().await {
            Ok(0) => {}
            Ok(removed) => tracing::debug!(removed, "expired run records purged"),
            Err(e) => tracing::warn!(error = %e, "cannot purge expired run records"),
        }
    }
    let store: Arc<dyn RecordStore> = store;

    let code = if args.worker {
        run_worker(&source, &config, args, store, shutdown).await?
    } else if config.parallel {
        run_parallel(&source, &config, args, store, shutdown).await?
    } else {
        run_sequential(&source, &config, args, store, shutdown).await?
    };

    source.cleanup().await.context("source cleanup failed")?;
    Ok(code)
}

async fn run_worker(
    source: &ManifestSource,
    config: &Arc<RunConfig>,
    args: &MigrateArgs,
    store: Arc<dyn RecordStore>,
    shutdown: &Shutdown,
) -> anyhow::Result<i32> {
    let entity = config
        .entities
        .first()
        .ok_or(ConfigError::NoEntities)?;
    let importer = resolve(source, entity)?;
    importer.set_config(Arc::clone(config));
    if let Some(mb) = config.memory_limit_mb {
        tracing::debug!(memory_limit_mb = mb, "worker memory limit");
    }

    let result = RunResult::with_run_id(args.run_id.unwrap_or_default(), store);
    result.add_entity(entity);
    let output = ConsoleOutput;
    let progress = ConsoleProgress::new();
    tokio::select! {
        imported = importer.import(&result, &output, &progress) => {
            imported.map_err(|e| MigrateError::import(entity, e))?;
        }
        () = shutdown::requested(shutdown.subscribe()) => {
            output.write_error(&format!("Worker for {entity} interrupted"));
            return Ok(EXIT_INTERRUPTED);
        }
    }

    if args.run_id.is_none() {
        print_result(&result, &output, args.show_failed).await?;
    }
    for line in result.tally_lines() {
        output.write_line(&line);
    }
    Ok(EXIT_OK)
}

async fn run_parallel(
    source: &ManifestSource,
    config: &Arc<RunConfig>,
    args: &MigrateArgs,
    store: Arc<dyn RecordStore>,
    shutdown: &Shutdown,
) -> anyhow::Result<i32> {
    let entity = config
        .entities
        .first()
        .ok_or(ConfigError::NoEntities)?;
    let importer = resolve(source, entity)?;
    importer.set_config(Arc::clone(config));

    let output = Arc::new(ConsoleOutput);
    if !config.force && importer.is_completed().await.map_err(|e| MigrateError::import(entity, e))? {
        output.write_line(&format!("Skipping {entity}: already completed"));
        return Ok(EXIT_OK);
    }

    let total_records = importer
        .total_records()
        .await
        .map_err(|e| MigrateError::import(entity, e))?;
    let end = range_end(total_records, config);

    let result = Arc::new(RunResult::with_store(store));
    result.add_entity(entity);
    let launcher = ProcessLauncher::current_exe(&args.source, Arc::clone(config))
        .context("cannot locate the ferry executable for workers")?
        .with_leading_args(["migrate"])
        .with_run_id(result.run_id())
        .with_trailing_args(args.paths.forwarded_args());
    let colored = !args.no_color && std::io::stdout().is_terminal();
    let mut pool = WorkerPoolScheduler::new(
        PoolSettings::from_config(config),
        Arc::new(launcher),
        Arc::clone(&output) as Arc<dyn OutputSink>,
    )
    .with_colors(colored)
    .with_shutdown(shutdown.subscribe())
    .with_result(Arc::clone(&result));

    output.write_line(&format!(
        "Migrating {entity} records {}..{end} with up to {} workers",
        config.offset.unwrap_or(0),
        config.max_processes
    ));
    let ok = match pool.migrate(entity, end).await {
        Ok(ok) => ok,
        Err(PoolError::Interrupted) => {
            output.write_error("Migration interrupted; all workers stopped");
            return Ok(EXIT_INTERRUPTED);
        }
        Err(e) => return Err(e.into()),
    };

    for line in pool.report_lines() {
        output.write_line(&line);
    }
    print_result(&result, output.as_ref(), args.show_failed).await?;
    print_run_location(&result, source, output.as_ref());
    if args.show_failed {
        for failure in pool.failed_chunks() {
            output.write_line(&format!("Chunk {} failed after {} attempts", failure.chunk, failure.attempts));
            output.write_line(&format!("  stderr: {}", failure.error));
            if !failure.output.is_empty() {
                output.write_line(&format!("  stdout: {}", failure.output));
            }
        }
    }

    if !ok {
        return Ok(EXIT_FAILED);
    }
    if config.is_full_run() {
        importer
            .mark_completed()
            .await
            .map_err(|e| MigrateError::import(entity, e))?;
    }
    Ok(EXIT_OK)
}

async fn run_sequential(
    source: &ManifestSource,
    config: &Arc<RunConfig>,
    args: &MigrateArgs,
    store: Arc<dyn RecordStore>,
    shutdown: &Shutdown,
) -> anyhow::Result<i32> {
    let output = Arc::new(ConsoleOutput);
    let orchestrator = DependencyOrchestrator::new()
        .with_config(Arc::clone(config))
        .with_output(Arc::clone(&output) as Arc<dyn OutputSink>)
        .with_progress(Arc::new(ConsoleProgress::new()))
        .with_store(store);

    let result = tokio::select! {
        result = orchestrator.migrate(source) => result?,
        () = shutdown::requested(shutdown.subscribe()) => {
            output.write_error("Migration interrupted");
            return Ok(EXIT_INTERRUPTED);
        }
    };

    print_result(&result, output.as_ref(), args.show_failed).await?;
    print_run_location(&result, source, output.as_ref());
    Ok(EXIT_OK)
}

fn resolve(source: &ManifestSource, entity: &str) -> Result<Arc<dyn EntityImporter>, MigrateError> {
    source
        .importer(entity)
        .ok_or_else(|| MigrateError::UnknownEntity(entity.to_string()))
}

/// Per-entity tallies, then failed record snapshots when asked
async fn print_result(result: &RunResult, output: &dyn OutputSink, show_failed: bool) -> anyhow::Result<()> {
    let mut rows: Vec<Vec<String>> = result
        .to_table_rows()
        .into_iter()
        .map(|r| {
            vec![
                r.entity,
                r.migrated.to_string(),
                r.skipped.to_string(),
                r.failed.to_string(),
            ]
        })
        .collect();
    let totals = result.totals();
    rows.push(vec![
        "Total".to_string(),
        totals.migrated.to_string(),
        totals.skipped.to_string(),
        totals.failed.to_string(),
    ]);
    for line in render_table(&["Entity", "Migrated", "Skipped", "Failed"], &rows) {
        output.write_line(&line);
    }

    if !show_failed {
        return Ok(());
    }
    for entity in result.entities() {
        let failed = result
            .records(&entity, Outcome::Failed)
            .await
            .with_context(|| format!("cannot read failed {entity} records"))?;
        if failed.is_empty() {
            continue;
        }
        output.write_line(&format!("Failed {entity} records:"));
        for record in failed {
            output.write_line(&format!("  {record}"));
        }
    }
    Ok(())
}

fn print_run_location(result: &RunResult, source: &ManifestSource, output: &dyn OutputSink) {
    output.write_line(&format!(
        "Run {}: records kept under {}",
        result.run_id(),
        source.records_dir().display()
    ));
}

/// Run `ferry records`
///
/// # Errors
/// Returns configuration errors and record store failures.
pub async fn records(args: &RecordsArgs, settings: &Settings) -> anyhow::Result<i32> {
    let source = open_source(&args.source, &args.paths, settings).await?;
    let store = Arc::new(JsonLinesRecordStore::new(source.records_dir()));
    let result = RunResult::with_run_id(args.run_id, store);
    let output = ConsoleOutput;

    if args.purge {
        result.cleanup().await.context("cannot purge run records")?;
        output.write_line(&format!("Purged records of run {}", args.run_id));
        return Ok(EXIT_OK);
    }

    let entities: Vec<String> = if args.entities.is_empty() {
        source.importers().keys().cloned().collect()
    } else {
        args.entities.clone()
    };
    let outcome = args.outcome.as_str();
    let mut printed = 0_usize;
    for entity in &entities {
        let records = result
            .records(entity, args.outcome)
            .await
            .with_context(|| format!("cannot read {outcome} {entity} records"))?;
        if records.is_empty() {
            continue;
        }
        output.write_line(&format!("{entity} ({outcome}):"));
        for record in &records {
            output.write_line(&format!("  {record}"));
        }
        printed += records.len();
    }
    if printed == 0 {
        output.write_line(&format!("No {outcome} records for run {}", args.run_id));
    }
    Ok(EXIT_OK)
}

/// Run `ferry optional`
///
/// # Errors
/// Returns configuration errors, including unknown entities.
pub async fn optional(args: &OptionalArgs, settings: &Settings) -> anyhow::Result<i32> {
    let source = open_source(&args.source, &args.paths, settings).await?;
    let config = RunConfig::new(args.entity.iter().cloned()).with_excluded(args.excluded.iter().cloned());
    let orchestrator = DependencyOrchestrator::new().with_config(Arc::new(config));
    let dependencies = orchestrator.optional_dependencies(&source, args.entity.as_deref())?;

    let output = ConsoleOutput;
    if dependencies.is_empty() {
        output.write_line("No optional dependencies");
        return Ok(EXIT_OK);
    }
    let rows: Vec<Vec<String>> = dependencies
        .values()
        .map(|edge| {
            vec![
                edge.entity().to_string(),
                edge.phase().to_string(),
                edge.description().unwrap_or_default().to_string(),
            ]
        })
        .collect();
    for line in render_table(&["Dependency", "Phase", "Description"], &rows) {
        output.write_line(&line);
    }
    output.write_line("Activate with --optional=<name>[,<name>...]");
    Ok(EXIT_OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_classify_errors() {
        let config: anyhow::Error = MigrateError::UnknownEntity("widgets".into()).into();
        assert_eq!(exit_code(&config), EXIT_CONFIG);

        let load: anyhow::Error = ConfigError::load("ferry.toml", "missing").into();
        assert_eq!(exit_code(&load.context("startup")), EXIT_CONFIG);

        let import: anyhow::Error =
            MigrateError::import("users", ferry_core::ImportError::Source("down".into())).into();
        assert_eq!(exit_code(&import), EXIT_FAILED);
    }
}
