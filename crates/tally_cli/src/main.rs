//! Command line front end for the count engine.
//!
//! # Responsibility
//! - Provide a health check for `tally_core` linkage.
//! - Run group and task submissions from JSON request files and print the
//!   JSON result.
//!
//! # Invariants
//! - Results go to stdout; errors go to stderr with a non-zero exit code.

use clap::{Parser, Subcommand};
use log::info;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tally_core::model::flag::TargetKind;
use tally_core::{
    init_logging, open_configured, Actor, ConfigError, EngineConfig, FlagTarget,
    GroupSubmission, LoggingError, SubmissionError, SubmissionService, TaskCountSubmission,
};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "tally_cli")]
#[command(about = "Submit demographic counts and inspect dependency flags", long_about = None)]
#[command(version)]
struct Cli {
    /// Defaults to `ping`.
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Check that tally_core is linked.
    Ping,
    /// Print the tally_core version.
    Version,
    /// Validate and store one aggregate group.
    #[command(name = "submit-group")]
    SubmitGroup {
        /// Engine config file (JSON).
        config: PathBuf,
        /// Request file with `actor` and `submission`.
        request: PathBuf,
    },
    /// Upsert the task counts of one event.
    #[command(name = "submit-tasks")]
    SubmitTasks {
        config: PathBuf,
        request: PathBuf,
    },
    /// Print the flag history of one target.
    Flags {
        config: PathBuf,
        /// count, aggregate_group, event, task or indicator.
        #[arg(value_parser = parse_target_kind)]
        kind: TargetKind,
        id: Uuid,
    },
}

fn parse_target_kind(value: &str) -> Result<TargetKind, String> {
    TargetKind::parse(value).ok_or_else(|| format!("unknown target kind `{value}`"))
}

/// Request file: the acting user plus the submission body.
#[derive(Debug, Deserialize)]
struct Request<T> {
    actor: Actor,
    submission: T,
}

#[derive(Debug, Serialize)]
struct ErrorReport<'a> {
    error: &'a str,
    status: u16,
    message: String,
}

#[derive(Debug)]
enum CliError {
    Io { path: PathBuf, source: std::io::Error },
    Json(serde_json::Error),
    Config(ConfigError),
    Logging(LoggingError),
    Submission(SubmissionError),
}

impl Display for CliError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "cannot read `{}`: {source}", path.display()),
            Self::Json(err) => write!(f, "invalid request: {err}"),
            Self::Config(err) => write!(f, "{err}"),
            Self::Logging(err) => write!(f, "{err}"),
            Self::Submission(err) => write!(f, "{err}"),
        }
    }
}

impl Error for CliError {}

impl From<serde_json::Error> for CliError {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

impl From<ConfigError> for CliError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

impl From<LoggingError> for CliError {
    fn from(value: LoggingError) -> Self {
        Self::Logging(value)
    }
}

impl From<SubmissionError> for CliError {
    fn from(value: SubmissionError) -> Self {
        Self::Submission(value)
    }
}

fn main() -> ExitCode {
    // Argument errors exit with status 2 from clap.
    let cli = Cli::parse();
    match run(cli.command.unwrap_or(Command::Ping)) {
        Ok(output) => {
            println!("{output}");
            ExitCode::SUCCESS
        }
        Err(CliError::Submission(err)) => {
            let report = ErrorReport {
                error: err.code(),
                status: err.status_code(),
                message: err.to_string(),
            };
            match serde_json::to_string_pretty(&report) {
                Ok(json) => eprintln!("{json}"),
                Err(_) => eprintln!("{err}"),
            }
            ExitCode::FAILURE
        }
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn run(command: Command) -> Result<String, CliError> {
    match command {
        Command::Ping => Ok(format!("tally_core ping={}", tally_core::ping())),
        Command::Version => Ok(format!("tally_core version={}", tally_core::core_version())),
        Command::SubmitGroup { config, request } => {
            let config = load_config(&config)?;
            let request: Request<GroupSubmission> = read_json(&request)?;
            let conn = open_configured(&config)?;
            let result =
                SubmissionService::new(&conn).submit_group(&request.actor, &request.submission)?;
            info!("event=cli_submit_group module=cli status=ok");
            Ok(serde_json::to_string_pretty(&result)?)
        }
        Command::SubmitTasks { config, request } => {
            let config = load_config(&config)?;
            let request: Request<TaskCountSubmission> = read_json(&request)?;
            let conn = open_configured(&config)?;
            let result = SubmissionService::new(&conn)
                .submit_task_counts(&request.actor, &request.submission)?;
            info!("event=cli_submit_tasks module=cli status=ok");
            Ok(serde_json::to_string_pretty(&result)?)
        }
        Command::Flags { config, kind, id } => {
            let config = load_config(&config)?;
            let conn = open_configured(&config)?;
            let flags = SubmissionService::new(&conn).flags_for(FlagTarget::new(kind, id))?;
            Ok(serde_json::to_string_pretty(&flags)?)
        }
    }
}

fn load_config(path: &Path) -> Result<EngineConfig, CliError> {
    let config = EngineConfig::load(path)?;
    if let Some(dir) = &config.logging.dir {
        init_logging(&config.logging.level, dir)?;
    }
    Ok(config)
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, CliError> {
    let content = std::fs::read_to_string(path).map_err(|source| CliError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_json::from_str(&content)?)
}
