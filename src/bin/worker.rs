//! Kiln worker entry point.
//!
//! Spawned by the controller with the run-settings path as its single
//! positional argument. Stdout carries the framed event stream, so logging
//! goes to stderr and is off unless `KILN_WORKER_LOG` says otherwise.

use std::path::PathBuf;

use clap::Parser;

use kiln::fork::archive;

#[derive(Parser, Debug)]
#[command(name = "kiln-worker")]
#[command(version, about = "Kiln forked worker", long_about = None)]
struct WorkerCli {
    /// Run-settings file written by the controller
    #[arg(value_name = "SETTINGS")]
    settings: PathBuf,

    /// Boot resource paths, platform-separator joined
    #[arg(long, value_name = "PATHS")]
    boot_path: Option<std::ffi::OsString>,

    /// File containing the joined boot path
    #[arg(long, value_name = "FILE")]
    boot_path_file: Option<PathBuf>,

    /// Manifest archive carrying the boot path
    #[arg(long, value_name = "ZIP")]
    boot_archive: Option<PathBuf>,

    /// Launcher-supplied arg-line tokens after `--`; accepted and logged
    #[arg(last = true, hide = true)]
    extra: Vec<String>,
}

fn main() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("KILN_WORKER_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("off")),
        )
        .with_writer(std::io::stderr)
        .try_init();

    let cli = WorkerCli::parse();
    for path in resolve_boot_paths(&cli) {
        tracing::debug!(path = %path.display(), "boot path entry");
    }
    if !cli.extra.is_empty() {
        tracing::debug!(tokens = cli.extra.len(), "arg-line tokens received");
    }

    std::process::exit(kiln::exec::worker::run(&cli.settings));
}

/// The boot path arrives one of three ways; resolution failures are logged,
/// not fatal — the scripted provider does not load from it.
fn resolve_boot_paths(cli: &WorkerCli) -> Vec<PathBuf> {
    if let Some(joined) = &cli.boot_path {
        return std::env::split_paths(joined).collect();
    }
    if let Some(file) = &cli.boot_path_file {
        return match std::fs::read_to_string(file) {
            Ok(joined) => std::env::split_paths(&joined).collect(),
            Err(e) => {
                tracing::warn!(error = %e, "cannot read boot path file");
                Vec::new()
            }
        };
    }
    if let Some(zip) = &cli.boot_archive {
        return match archive::read_boot_paths(zip) {
            Ok(paths) => paths,
            Err(e) => {
                tracing::warn!(error = %e, "cannot read boot archive");
                Vec::new()
            }
        };
    }
    Vec::new()
}
