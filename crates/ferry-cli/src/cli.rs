//! Command-line surface
//!
//! `ferry migrate <source>` runs a migration, sequentially or fanned out
//! across worker processes; `ferry optional <source>` lists the optional
//! dependencies a run could activate; `ferry records <source>` prints or
//! purges the detail records a run kept.

use crate::settings::RunDefaults;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use ferry_core::{Outcome, RunConfig, RunId};
use std::ffi::OsString;
use std::path::PathBuf;

/// Parsed invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Migrate(MigrateArgs),
    Optional(OptionalArgs),
    Records(RecordsArgs),
}

impl Action {
    #[must_use]
    pub fn paths(&self) -> &Paths {
        match self {
            Self::Migrate(args) => &args.paths,
            Self::Optional(args) => &args.paths,
            Self::Records(args) => &args.paths,
        }
    }
}

/// Locations of settings, manifest and completion state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Paths {
    pub config: Option<PathBuf>,
    pub manifest: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
}

impl Paths {
    /// Flags that make a worker process resolve the same files
    #[must_use]
    pub fn forwarded_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(path) = &self.config {
            args.push(format!("--config={}", path.display()));
        }
        if let Some(path) = &self.manifest {
            args.push(format!("--manifest={}", path.display()));
        }
        if let Some(path) = &self.state_dir {
            args.push(format!("--state-dir={}", path.display()));
        }
        args
    }
}

/// `ferry migrate` arguments
///
/// Numeric flags left unset fall back to the settings file defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrateArgs {
    pub source: String,
    pub entities: Vec<String>,
    pub offset: Option<u64>,
    pub limit: Option<u64>,
    pub batch: Option<u64>,
    pub user_id: Option<u64>,
    pub dry_run: bool,
    pub ssh: bool,
    pub download_media: bool,
    pub base_url: Option<String>,
    pub parallel: bool,
    pub max_processes: Option<usize>,
    pub max_records_per_process: Option<u64>,
    pub memory_limit: Option<u64>,
    pub max_retries: Option<u32>,
    pub excluded: Vec<String>,
    pub optional: Vec<String>,
    pub worker: bool,
    pub force: bool,
    pub show_failed: bool,
    pub no_color: bool,
    /// Run whose records a worker adds to; set by the parent process
    pub run_id: Option<RunId>,
    pub paths: Paths,
}

impl MigrateArgs {
    /// Run configuration from flags over `defaults`
    #[must_use]
    pub fn run_config(&self, defaults: &RunDefaults) -> RunConfig {
        let mut config = RunConfig::new(self.entities.iter().cloned())
            .with_batch_size(self.batch.unwrap_or(defaults.batch_size))
            .with_excluded(self.excluded.iter().cloned())
            .with_optional(self.optional.iter().cloned());

        config.offset = self.offset;
        config.limit = self.limit;
        config.user_id = self.user_id;
        config.dry_run = self.dry_run;
        config.use_ssh = self.ssh;
        config.download_media = self.download_media;
        config.base_url.clone_from(&self.base_url);
        config.parallel = self.parallel && !self.worker;
        config.max_processes = self.max_processes.unwrap_or(defaults.max_processes);
        config.max_records_per_process = self
            .max_records_per_process
            .unwrap_or(defaults.max_records_per_process);
        config.memory_limit_mb = self.memory_limit.or(defaults.memory_limit_mb);
        config.max_retries = self.max_retries.unwrap_or(defaults.max_retries);
        config.force = self.force;
        config
    }
}

/// `ferry optional` arguments
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionalArgs {
    pub source: String,
    pub entity: Option<String>,
    pub excluded: Vec<String>,
    pub paths: Paths,
}

/// `ferry records` arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordsArgs {
    pub source: String,
    pub run_id: RunId,
    pub entities: Vec<String>,
    pub outcome: Outcome,
    pub purge: bool,
    pub paths: Paths,
}

fn path_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("config")
                .long("config")
                .value_parser(value_parser!(PathBuf))
                .help("Settings file (default: ./ferry.toml if present)"),
        )
        .arg(
            Arg::new("manifest")
                .long("manifest")
                .value_parser(value_parser!(PathBuf))
                .help("Source manifest, overriding the settings file"),
        )
        .arg(
            Arg::new("state-dir")
                .long("state-dir")
                .value_parser(value_parser!(PathBuf))
                .help("Directory for completion markers and run records"),
        )
}

fn list_arg(name: &'static str, help: &'static str) -> Arg {
    Arg::new(name)
        .long(name)
        .action(ArgAction::Append)
        .value_delimiter(',')
        .help(help)
}

/// Build the command tree
#[must_use]
pub fn command() -> Command {
    let migrate = Command::new("migrate")
        .about("Migrate entities from a legacy source")
        .arg(Arg::new("source").required(true).help("Source name"))
        .arg(list_arg("entity", "Entity to migrate; repeat or comma separate"))
        .arg(
            Arg::new("offset")
                .long("offset")
                .value_parser(value_parser!(u64))
                .help("Offset of the first record"),
        )
        .arg(
            Arg::new("limit")
                .long("limit")
                .value_parser(value_parser!(u64))
                .help("Maximum number of records"),
        )
        .arg(
            Arg::new("batch")
                .long("batch")
                .value_parser(value_parser!(u64))
                .help("Records per importer batch"),
        )
        .arg(
            Arg::new("id")
                .long("id")
                .value_parser(value_parser!(u64))
                .help("Acting user on the target platform"),
        )
        .arg(
            Arg::new("dry-run")
                .long("dry-run")
                .action(ArgAction::SetTrue)
                .help("Read and transform without writing"),
        )
        .arg(
            Arg::new("ssh")
                .long("ssh")
                .action(ArgAction::SetTrue)
                .help("Reach the legacy platform through an SSH tunnel"),
        )
        .arg(
            Arg::new("download-media")
                .long("download-media")
                .action(ArgAction::SetTrue)
                .help("Download attached media files"),
        )
        .arg(
            Arg::new("base-url")
                .long("base-url")
                .help("Base URL of the legacy platform"),
        )
        .arg(
            Arg::new("parallel")
                .long("parallel")
                .action(ArgAction::SetTrue)
                .help("Fan the entity out across worker processes"),
        )
        .arg(
            Arg::new("max-processes")
                .long("max-processes")
                .value_parser(value_parser!(usize))
                .help("Concurrently running worker processes"),
        )
        .arg(
            Arg::new("max-records-per-process")
                .long("max-records-per-process")
                .value_parser(value_parser!(u64))
                .help("Records handed to one worker process"),
        )
        .arg(
            Arg::new("memory-limit")
                .long("memory-limit")
                .value_parser(value_parser!(u64))
                .help("Memory limit per worker process, in MB"),
        )
        .arg(
            Arg::new("max-retries")
                .long("max-retries")
                .value_parser(value_parser!(u32))
                .help("Retries for a failed chunk"),
        )
        .arg(list_arg("excluded", "Entity never migrated in this run"))
        .arg(list_arg("optional", "Optional dependency to activate"))
        .arg(
            Arg::new("worker")
                .long("worker")
                .action(ArgAction::SetTrue)
                .hide(true)
                .help("Run one chunk as a worker process"),
        )
        .arg(
            Arg::new("force")
                .long("force")
                .action(ArgAction::SetTrue)
                .help("Ignore completion markers"),
        )
        .arg(
            Arg::new("show-failed")
                .long("show-failed")
                .action(ArgAction::SetTrue)
                .help("Print failed records and chunk output"),
        )
        .arg(
            Arg::new("no-color")
                .long("no-color")
                .action(ArgAction::SetTrue)
                .help("Disable colored worker prefixes"),
        )
        .arg(
            Arg::new("run-id")
                .long("run-id")
                .value_parser(value_parser!(RunId))
                .hide(true)
                .help("Record into an existing run"),
        );

    let optional = Command::new("optional")
        .about("List optional dependencies")
        .arg(Arg::new("source").required(true).help("Source name"))
        .arg(
            Arg::new("entity")
                .long("entity")
                .help("Only this entity's optional dependencies"),
        )
        .arg(list_arg("excluded", "Entity left out of the listing"));

    let records = Command::new("records")
        .about("Print or purge the detail records of a run")
        .arg(Arg::new("source").required(true).help("Source name"))
        .arg(
            Arg::new("run")
                .long("run")
                .required(true)
                .value_parser(value_parser!(RunId))
                .help("Run id printed at the end of a migration"),
        )
        .arg(list_arg("entity", "Only these entities (default: all)"))
        .arg(
            Arg::new("outcome")
                .long("outcome")
                .value_parser(["migrated", "skipped", "failed"])
                .default_value("failed")
                .help("Which records to print"),
        )
        .arg(
            Arg::new("purge")
                .long("purge")
                .action(ArgAction::SetTrue)
                .help("Delete the run's records instead of printing them"),
        );

    Command::new("ferry")
        .version(ferry_core::VERSION)
        .about("Dependency-ordered, process-parallel platform migration")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(path_args(migrate))
        .subcommand(path_args(optional))
        .subcommand(path_args(records))
}

/// Parse process arguments
///
/// # Errors
/// Returns the clap error for invalid input, including help and version
/// requests.
pub fn parse_from<I, T>(args: I) -> Result<Action, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let matches = command().try_get_matches_from(args)?;
    match matches.subcommand() {
        Some(("migrate", args)) => Ok(Action::Migrate(migrate_args(args))),
        Some(("optional", args)) => Ok(Action::Optional(OptionalArgs {
            source: string(args, "source").unwrap_or_default(),
            entity: string(args, "entity"),
            excluded: list(args, "excluded"),
            paths: paths(args),
        })),
        Some(("records", args)) => Ok(Action::Records(records_args(args))),
        _ => Err(command().error(
            clap::error::ErrorKind::MissingSubcommand,
            "a subcommand is required",
        )),
    }
}

fn migrate_args(args: &ArgMatches) -> MigrateArgs {
    MigrateArgs {
        source: string(args, "source").unwrap_or_default(),
        entities: list(args, "entity"),
        offset: args.get_one::<u64>("offset").copied(),
        limit: args.get_one::<u64>("limit").copied(),
        batch: args.get_one::<u64>("batch").copied(),
        user_id: args.get_one::<u64>("id").copied(),
        dry_run: args.get_flag("dry-run"),
        ssh: args.get_flag("ssh"),
        download_media: args.get_flag("download-media"),
        base_url: string(args, "base-url"),
        parallel: args.get_flag("parallel"),
        max_processes: args.get_one::<usize>("max-processes").copied(),
        max_records_per_process: args.get_one::<u64>("max-records-per-process").copied(),
        memory_limit: args.get_one::<u64>("memory-limit").copied(),
        max_retries: args.get_one::<u32>("max-retries").copied(),
        excluded: list(args, "excluded"),
        optional: list(args, "optional"),
        worker: args.get_flag("worker"),
        force: args.get_flag("force"),
        show_failed: args.get_flag("show-failed"),
        no_color: args.get_flag("no-color"),
        run_id: args.get_one::<RunId>("run-id").copied(),
        paths: paths(args),
    }
}

fn records_args(args: &ArgMatches) -> RecordsArgs {
    let outcome = match args.get_one::<String>("outcome").map(String::as_str) {
        Some("migrated") => Outcome::Migrated,
        Some("skipped") => Outcome::Skipped,
        _ => Outcome::Failed,
    };
    RecordsArgs {
        source: string(args, "source").unwrap_or_default(),
        run_id: args.get_one::<RunId>("run").copied().unwrap_or_default(),
        entities: list(args, "entity"),
        outcome,
        purge: args.get_flag("purge"),
        paths: paths(args),
    }
}

fn string(args: &ArgMatches, id: &str) -> Option<String> {
    args.get_one::<String>(id).cloned()
}

fn list(args: &ArgMatches, id: &str) -> Vec<String> {
    args.get_many::<String>(id)
        .map(|values| {
            values
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn paths(args: &ArgMatches) -> Paths {
    Paths {
        config: args.get_one::<PathBuf>("config").cloned(),
        manifest: args.get_one::<PathBuf>("manifest").cloned(),
        state_dir: args.get_one::<PathBuf>("state-dir").cloned(),
    }
}
