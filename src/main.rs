use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;

use sitebackup_lib::db::DefaultConnector;
use sitebackup_lib::{Action, AppError, BackupEngine, Settings};

/// Exit status when the operation itself failed (the error was reported).
const OPERATION_FAILED_EXIT_CODE: i32 = 1;
/// Exit status when configuration or arguments could not be used.
const USAGE_EXIT_CODE: i32 = 2;

#[derive(Debug, Parser)]
#[command(name = "sitebackup", about = "Database dump and file archive backups", version)]
struct Cli {
    /// JSON settings file; `SITEBACKUP_*` environment variables are used otherwise.
    #[arg(long, global = true, env = "SITEBACKUP_CONFIG")]
    config: Option<PathBuf>,

    /// Directory for the daily-rolling JSON log file.
    #[arg(long, global = true, env = "SITEBACKUP_LOG_DIR")]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Dump the database into MyFiles/Backups.
    Export {
        /// File name of the dump; `.sql` is appended when missing.
        #[arg(long)]
        name: Option<String>,
    },
    /// Zip the application tree into MyFiles/Backups.
    Archive {
        #[arg(long)]
        name: Option<String>,
    },
    /// Replace the whole database with a dump (`.sql` or `.sql.gz`).
    ImportDb { file: PathBuf },
    /// Restore files from a zip without overwriting existing ones.
    ImportFiles { file: PathBuf },
    /// Convert the database and its tables to another charset.
    CharsetSwitch {
        #[arg(long)]
        charset: Option<String>,
        #[arg(long)]
        collation: Option<String>,
    },
    /// Compare the application tree size with the memory limit.
    CheckCapacity,
    /// Run the weekly backup job if it is due.
    Cron {
        /// Run even when the last run is less than a week old.
        #[arg(long)]
        force: bool,
    },
    /// List stored artifacts and report an outdated database backup.
    Status,
}

fn main() {
    let cli = Cli::parse();
    let _log_guard = sitebackup_lib::init_logging(cli.log_dir.as_deref());

    let settings = match load_settings(cli.config.as_ref()) {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("Error: {err:#}");
            process::exit(USAGE_EXIT_CODE);
        }
    };

    match run(cli.command, settings) {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("Error: {err:#}");
            process::exit(OPERATION_FAILED_EXIT_CODE);
        }
    }
}

fn load_settings(path: Option<&PathBuf>) -> Result<Settings> {
    let settings = match path {
        Some(path) => Settings::from_json_file(path)
            .with_context(|| format!("load settings from {}", path.display()))?,
        None => Settings::from_env().context("load settings from the environment")?,
    };
    Ok(settings)
}

fn run(command: Command, settings: Settings) -> Result<i32> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("start async runtime")?;
    let engine = BackupEngine::new(settings, DefaultConnector::default());

    let action = match command {
        Command::Export { name } => Action::Export { file_name: name },
        Command::Archive { name } => Action::Archive { file_name: name },
        Command::ImportDb { file } => Action::ImportDatabase { source: file },
        Command::ImportFiles { file } => Action::ImportFiles { archive: file },
        Command::CharsetSwitch { charset, collation } => {
            Action::CharsetSwitch { charset, collation }
        }
        Command::CheckCapacity => {
            let warning = engine.check_capacity().map_err(anyhow::Error::from)?;
            print_json(&json!({
                "memory_limit": engine.settings().memory_limit,
                "warning": warning,
            }))?;
            return Ok(0);
        }
        Command::Cron { force } => {
            let state = runtime
                .block_on(engine.run_scheduled(Utc::now(), force))
                .map_err(anyhow::Error::from)?;
            print_json(&json!({ "ran": state.is_some(), "state": state }))?;
            return Ok(0);
        }
        Command::Status => {
            let artifacts = engine.artifacts().map_err(anyhow::Error::from)?;
            let stale = engine
                .check_stale_backup(Utc::now())
                .map_err(anyhow::Error::from)?;
            print_json(&json!({ "artifacts": artifacts, "stale": stale }))?;
            return Ok(0);
        }
    };

    match runtime.block_on(engine.dispatch(action)) {
        Ok(outcome) => {
            print_json(&outcome)?;
            Ok(0)
        }
        Err(err) => {
            print_error(&err);
            Ok(OPERATION_FAILED_EXIT_CODE)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("serialize output")?;
    println!("{text}");
    Ok(())
}

fn print_error(err: &AppError) {
    eprintln!("Error: {err}");
    let mut cause = err.cause();
    while let Some(inner) = cause {
        eprintln!("  caused by: {inner}");
        cause = inner.cause();
    }
}
