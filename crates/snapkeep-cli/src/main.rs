// crates/snapkeep-cli/src/main.rs
// ============================================================================
// Module: Snapkeep CLI Entry Point
// Description: Command dispatcher for verification, serving, and backups.
// Purpose: Expose the snapshot, publish, and verification workflows.
// Dependencies: clap, snapkeep-config, snapkeep-verifier, serde_json, tokio.
// ============================================================================

//! ## Overview
//! `snapkeep` loads one TOML configuration and runs a single workflow:
//! - `verify` runs the consistency harness and prints its JSON report.
//! - `serve` restores on startup, backs up periodically, and takes a final
//!   snapshot on Ctrl-C.
//! - `snapshot` takes and publishes one backup.
//! - `restore` fetches the published database when it is missing locally.
//! - `config validate` checks a configuration file.
//!
//! Store and object-store work runs on the blocking pool, and components
//! owning an object-store client are dropped there too. Reports go
//! to stdout as JSON; errors go to stderr with a failing exit code.

// ============================================================================
// SECTION: Modules
// ============================================================================


// ============================================================================
// SECTION: Imports
// ============================================================================

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use clap::Parser;
use clap::Subcommand;
use serde::Serialize;
use snapkeep_config::SnapkeepConfig;
use snapkeep_core::Clock;
use snapkeep_core::Deadline;
use snapkeep_core::EventLog;
use snapkeep_core::StopSignal;
use snapkeep_core::SystemClock;
use snapkeep_publish::BackupJob;
use snapkeep_publish::PeriodicBackup;
use snapkeep_publish::PublishTarget;
use snapkeep_store_sqlite::PrimaryStore;
use snapkeep_store_sqlite::SnapshotEngine;
use snapkeep_verifier::FaultPlan;
use snapkeep_verifier::Harness;
use snapkeep_verifier::HarnessConfig;
use snapkeep_verifier::fresh_store;
use thiserror::Error;

// ============================================================================
// SECTION: CLI Types
// ============================================================================

/// Top-level CLI definition.
#[derive(Parser, Debug)]
#[command(name = "snapkeep", version, disable_help_subcommand = true)]
struct Cli {
    /// Config file path (defaults to snapkeep.toml or `SNAPKEEP_CONFIG`).
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Selected subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the consistency harness and print its report.
    Verify(VerifyCommand),
    /// Run the backup lifecycle until interrupted.
    Serve(ServeCommand),
    /// Take and publish one backup.
    Snapshot,
    /// Fetch the published database if the local one is missing.
    Restore,
    /// Configuration utilities.
    Config {
        /// Selected config subcommand.
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

/// Overrides for the `verify` command.
#[derive(Args, Debug, Default)]
struct VerifyCommand {
    /// Writer threads.
    #[arg(long, value_name = "N")]
    writers: Option<usize>,
    /// Rows per writer transaction.
    #[arg(long, value_name = "N")]
    batch_size: Option<usize>,
    /// Workload duration in milliseconds.
    #[arg(long, value_name = "MS")]
    duration_ms: Option<u64>,
    /// Cycle interval in milliseconds.
    #[arg(long, value_name = "MS")]
    interval_ms: Option<u64>,
    /// Work directory for the primary and snapshot files.
    #[arg(long, value_name = "DIR")]
    work_dir: Option<PathBuf>,
}

/// Options for the `serve` command.
#[derive(Args, Debug, Default)]
struct ServeCommand {
    /// Stop after this many milliseconds instead of waiting for Ctrl-C.
    #[arg(long, value_name = "MS")]
    stop_after_ms: Option<u64>,
}

/// Config subcommands.
#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Validate a configuration file.
    Validate,
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// CLI errors.
#[derive(Debug, Error)]
enum CliError {
    /// Configuration could not be loaded or applied.
    #[error("config error: {0}")]
    Config(String),
    /// A workflow step failed.
    #[error("{command} failed: {message}")]
    Command {
        /// Command name.
        command: &'static str,
        /// Failure description.
        message: String,
    },
    /// Output could not be written.
    #[error("failed to write {stream}: {message}")]
    Output {
        /// Stream name.
        stream: &'static str,
        /// Failure description.
        message: String,
    },
    /// A blocking task did not complete.
    #[error("task join failed: {0}")]
    Join(String),
}

impl CliError {
    /// Wraps a failure of `command`.
    fn command(command: &'static str, error: impl std::fmt::Display) -> Self {
        Self::Command {
            command,
            message: error.to_string(),
        }
    }
}

/// CLI result alias for fallible operations.
type CliResult<T> = Result<T, CliError>;

// ============================================================================
// SECTION: Entry Point
// ============================================================================

/// CLI entry point returning an exit code.
#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    match run(Cli::parse()).await {
        Ok(code) => code,
        Err(err) => emit_error(&err.to_string()),
    }
}

/// Executes the CLI command dispatcher.
async fn run(cli: Cli) -> CliResult<ExitCode> {
    let config_path = cli.config;
    match cli.command {
        Commands::Verify(command) => blocking(move || command_verify(config_path, &command)).await,
        Commands::Serve(command) => command_serve(config_path, command).await,
        Commands::Snapshot => blocking(move || command_snapshot(config_path)).await,
        Commands::Restore => blocking(move || command_restore(config_path)).await,
        Commands::Config {
            command: ConfigCommand::Validate,
        } => command_config_validate(config_path),
    }
}

/// Runs `work` on the blocking pool.
async fn blocking<T, F>(work: F) -> CliResult<T>
where
    F: FnOnce() -> CliResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work).await.map_err(|err| CliError::Join(err.to_string()))?
}

// ============================================================================
// SECTION: Shared Setup
// ============================================================================

/// Everything a workflow builds from the configuration.
struct Components {
    /// Loaded configuration.
    config: SnapkeepConfig,
    /// Time source.
    clock: Arc<dyn Clock>,
    /// Event log.
    log: EventLog,
    /// Publish target.
    target: PublishTarget,
    /// Snapshot engine.
    engine: SnapshotEngine,
}

impl Components {
    /// Loads the configuration and builds the shared components.
    fn load(config_path: Option<PathBuf>) -> CliResult<Self> {
        let config = load_config(config_path)?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let log = config.event_log(Arc::clone(&clock)).map_err(|err| CliError::Config(err.to_string()))?;
        let target =
            config.publish_target(Arc::clone(&clock), &log).map_err(|err| CliError::Config(err.to_string()))?;
        let engine = SnapshotEngine::new(config.snapshot.engine.clone(), &log);
        Ok(Self {
            config,
            clock,
            log,
            target,
            engine,
        })
    }

    /// Builds the backup job used by `serve` and `snapshot`.
    fn backup_job(&self) -> BackupJob {
        BackupJob {
            target: self.target.clone(),
            engine: self.engine.clone(),
            source: self.config.store.path.clone(),
            staging_dir: self.config.snapshot.staging_dir.clone(),
            timeout: self.config.backup.timeout(),
            log: self.log.clone(),
        }
    }
}

/// Loads and validates the configuration.
fn load_config(config_path: Option<PathBuf>) -> CliResult<SnapkeepConfig> {
    SnapkeepConfig::load(config_path.as_deref()).map_err(|err| CliError::Config(err.to_string()))
}

// ============================================================================
// SECTION: Verify Command
// ============================================================================

/// Executes the `verify` command.
fn command_verify(config_path: Option<PathBuf>, command: &VerifyCommand) -> CliResult<ExitCode> {
    let components = Components::load(config_path)?;
    let harness_config = harness_config(&components.config, command);
    let store = fresh_store(&harness_config.work_dir, &components.config.store)
        .map_err(|err| CliError::command("verify", err))?;
    let harness = Harness::new(
        harness_config,
        store.clone(),
        components.engine,
        components.target,
        &components.log,
        components.clock,
    );
    let report = harness.run().map_err(|err| CliError::command("verify", err))?;
    store.close();
    let json = report.to_json().map_err(|err| CliError::command("verify", err))?;
    write_stdout_line(&json)?;
    Ok(if report.passed { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

/// Applies command-line overrides to the `[verifier]` section.
fn harness_config(config: &SnapkeepConfig, command: &VerifyCommand) -> HarnessConfig {
    let verifier = &config.verifier;
    HarnessConfig {
        writers: command.writers.unwrap_or(verifier.writers),
        batch_size: command.batch_size.unwrap_or(verifier.batch_size),
        duration: Duration::from_millis(command.duration_ms.unwrap_or(verifier.duration_ms)),
        interval: Duration::from_millis(command.interval_ms.unwrap_or(verifier.interval_ms)),
        cycle_timeout: config.snapshot.cycle_timeout(),
        work_dir: command.work_dir.clone().unwrap_or_else(|| verifier.work_dir.clone()),
        write_retry: verifier.write_retry(),
        faults: FaultPlan::default(),
    }
}

// ============================================================================
// SECTION: Serve Command
// ============================================================================

/// A store opened by `serve` together with its backup machinery.
struct Serving {
    /// Shared components.
    components: Components,
    /// Open primary store.
    store: PrimaryStore,
    /// Periodic backup timer, when configured.
    timer: Option<PeriodicBackup>,
}

/// Executes the `serve` command.
async fn command_serve(config_path: Option<PathBuf>, command: ServeCommand) -> CliResult<ExitCode> {
    let serving = blocking(move || start_serving(config_path)).await?;
    let waited = match command.stop_after_ms {
        Some(ms) => {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(())
        }
        None => tokio::signal::ctrl_c().await.map_err(|err| CliError::command("serve", err)),
    };
    let stopped = blocking(move || stop_serving(serving)).await;
    waited.and(stopped)
}

/// Restores if needed, opens the store, and starts the periodic timer.
fn start_serving(config_path: Option<PathBuf>) -> CliResult<Serving> {
    let components = Components::load(config_path)?;
    let restored = components
        .target
        .on_startup(&components.config.store.path)
        .map_err(|err| CliError::command("serve", err))?;
    if let Some(outcome) = restored {
        write_json(&outcome)?;
    }
    let store = PrimaryStore::open(components.config.store.clone()).map_err(|err| CliError::command("serve", err))?;
    let timer = match components.config.backup.periodic_interval() {
        Some(interval) => Some(
            PeriodicBackup::start(components.backup_job(), interval).map_err(|err| CliError::command("serve", err))?,
        ),
        None => None,
    };
    components
        .log
        .info("serve_started")
        .field("target", components.target.kind())
        .field("periodic", timer.is_some())
        .emit();
    Ok(Serving {
        components,
        store,
        timer,
    })
}

/// Stops the timer, takes the final snapshot, and closes the store.
fn stop_serving(serving: Serving) -> CliResult<ExitCode> {
    let Serving {
        components,
        store,
        timer,
    } = serving;
    let runs = timer.map_or(0, PeriodicBackup::stop);
    let deadline = Deadline::after(components.config.backup.timeout());
    let report = components
        .target
        .on_shutdown(&components.engine, store.path(), &components.config.snapshot.staging_dir, &deadline)
        .map_err(|err| CliError::command("serve", err))?;
    store.close();
    components.log.info("serve_stopped").field("periodic_runs", runs).emit();
    write_json(&report)?;
    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// SECTION: Snapshot and Restore Commands
// ============================================================================

/// Executes the `snapshot` command.
fn command_snapshot(config_path: Option<PathBuf>) -> CliResult<ExitCode> {
    let components = Components::load(config_path)?;
    let job = components.backup_job();
    let report = job.run_once(&StopSignal::new()).map_err(|err| CliError::command("snapshot", err))?;
    write_json(&report)?;
    Ok(ExitCode::SUCCESS)
}

/// Executes the `restore` command.
fn command_restore(config_path: Option<PathBuf>) -> CliResult<ExitCode> {
    let components = Components::load(config_path)?;
    let outcome = components
        .target
        .on_startup(&components.config.store.path)
        .map_err(|err| CliError::command("restore", err))?;
    match outcome {
        Some(outcome) => write_json(&outcome)?,
        None => write_stdout_line(&format!("target {} has nothing to restore", components.target.kind()))?,
    }
    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// SECTION: Config Commands
// ============================================================================

/// Executes the config validation command.
fn command_config_validate(config_path: Option<PathBuf>) -> CliResult<ExitCode> {
    let _config = load_config(config_path)?;
    write_stdout_line("config ok")?;
    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// SECTION: Output Helpers
// ============================================================================

/// Writes `value` as pretty JSON to stdout.
fn write_json<T: Serialize>(value: &T) -> CliResult<()> {
    let json = serde_json::to_string_pretty(value).map_err(|err| CliError::Output {
        stream: "stdout",
        message: err.to_string(),
    })?;
    write_stdout_line(&json)
}

/// Writes a line to stdout.
fn write_stdout_line(message: &str) -> CliResult<()> {
    let mut stdout = std::io::stdout();
    writeln!(&mut stdout, "{message}").map_err(|err| CliError::Output {
        stream: "stdout",
        message: err.to_string(),
    })
}

/// Writes a line to stderr.
fn write_stderr_line(message: &str) -> std::io::Result<()> {
    let mut stderr = std::io::stderr();
    writeln!(&mut stderr, "{message}")
}

/// Emits an error message to stderr and returns a failure exit code.
fn emit_error(message: &str) -> ExitCode {
    let _ = write_stderr_line(message);
    ExitCode::FAILURE
}
