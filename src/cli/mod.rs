//! CLI module for the kiln test-execution engine
//!
//! This module provides the command-line interface for the controller
//! process.
//!
//! ## Commands
//!
//! - `run <settings.json>` - Execute the configured test sets across forked
//!   workers
//!
//! ## Design
//!
//! The CLI uses clap for argument parsing with derive macros.
//! Command functions return `CliResult<T>` instead of calling
//! `process::exit`. Only the top-level `run()` function handles errors and
//! exits.

// Enforce explicit error handling - no panicking in production code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod commands;

use std::fmt;
use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};

// ============================================================================
// CLI Error handling
// ============================================================================

/// Exit code for CLI operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCode(pub i32);

impl ExitCode {
    pub const SUCCESS: ExitCode = ExitCode(0);
    pub const FAILURE: ExitCode = ExitCode(1);
}

/// Error type for CLI operations.
///
/// Contains a user-facing message and an exit code. The CLI entry point
/// catches these errors, prints the message, and exits with the code.
#[derive(Debug)]
pub struct CliError {
    /// User-facing error message (already formatted for display)
    pub message: String,
    /// Exit code to return to the shell
    pub exit_code: ExitCode,
}

impl CliError {
    /// Create a new CLI error with a message and exit code.
    pub fn new(message: impl Into<String>, exit_code: ExitCode) -> Self {
        Self {
            message: message.into(),
            exit_code,
        }
    }

    /// Create a failure error (exit code 1).
    pub fn failure(message: impl Into<String>) -> Self {
        Self::new(message, ExitCode::FAILURE)
    }

    /// Create an error with a custom exit code.
    pub fn with_code(message: impl Into<String>, code: i32) -> Self {
        Self::new(message, ExitCode(code))
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

/// Result type for CLI operations.
pub type CliResult<T> = Result<T, CliError>;

const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// Clap CLI definition
// ============================================================================

/// Forked test execution engine
#[derive(Parser, Debug)]
#[command(name = "kiln")]
#[command(version = VERSION)]
#[command(about = "Forked test execution engine", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Execute the configured test sets across forked workers
    Run(RunArgs),
}

#[derive(clap::Args, Debug)]
pub struct RunArgs {
    /// Run-settings file describing the test sets
    #[arg(value_name = "SETTINGS")]
    pub settings: PathBuf,

    /// Execute only these test sets (default: all in the settings file)
    #[arg(long, value_delimiter = ',', value_name = "NAMES")]
    pub test_sets: Vec<String>,

    // Fork policy
    /// Number of worker processes; 0 runs in-process
    #[arg(long, default_value_t = 1)]
    pub forks: u32,

    /// Spawn a fresh worker per test set instead of reusing workers
    #[arg(long)]
    pub no_reuse: bool,

    /// Kill a worker that runs longer than this many seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Fail the run when no tests were executed
    #[arg(long)]
    pub fail_if_no_tests: bool,

    // Worker process assembly
    /// Worker executable (default: kiln-worker next to this binary)
    #[arg(long, value_name = "PATH")]
    pub worker_bin: Option<PathBuf>,

    /// Boot resource path entries handed to each worker
    #[arg(long = "boot-path", value_name = "PATH")]
    pub boot_paths: Vec<PathBuf>,

    /// Extra worker arguments; {fork.index}/{thread.index} are substituted
    #[arg(long, value_name = "LINE")]
    pub argline: Option<String>,

    /// Deliver the boot path through a manifest archive
    #[arg(long)]
    pub modular: bool,

    /// Worker working directory (default: current directory)
    #[arg(long, value_name = "DIR")]
    pub working_dir: Option<PathBuf>,

    /// Directory for reports and diagnostic dumps
    #[arg(long, value_name = "DIR", default_value = "kiln-reports")]
    pub reports_dir: PathBuf,

    /// Log the assembled worker command lines
    #[arg(long)]
    pub debug_forks: bool,

    // In-worker parallelism
    /// Levels to run in parallel: suites, classes, methods
    #[arg(long, value_delimiter = ',', value_name = "LEVELS")]
    pub parallel: Vec<String>,

    /// Overall thread budget distributed across the parallel levels
    #[arg(long, value_name = "N")]
    pub threads: Option<u32>,

    /// Thread count for the suites level
    #[arg(long, value_name = "N")]
    pub threads_suites: Option<u32>,

    /// Thread count for the classes level
    #[arg(long, value_name = "N")]
    pub threads_classes: Option<u32>,

    /// Thread count for the methods level
    #[arg(long, value_name = "N")]
    pub threads_methods: Option<u32>,

    /// Let pools grow to the number of ready tasks
    #[arg(long)]
    pub unlimited: bool,

    /// Multiply thread counts by the number of cores
    #[arg(long)]
    pub per_core: bool,

    /// Re-run failing tests up to N extra attempts
    #[arg(long, value_name = "N")]
    pub rerun_failing: Option<u32>,
}

/// Main CLI entry point. Parses arguments, dispatches, exits.
pub fn run() {
    let cli = Cli::parse();
    let outcome = match cli.command {
        Command::Run(args) => commands::run_command(&args),
    };
    match outcome {
        Ok(code) => process::exit(code.0),
        Err(e) => {
            if !e.message.is_empty() {
                eprintln!("{e}");
            }
            process::exit(e.exit_code.0);
        }
    }
}
