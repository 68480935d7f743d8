//! Command implementations for the kiln CLI.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::exec::planner::ConcurrencyIntent;
use crate::fork::config::PathDelivery;
use crate::fork::result::EXIT_NO_TESTS;
use crate::fork::{ForkConfiguration, ForkPool, RunOutcome, RunResult};
use crate::settings::RunSettings;

use super::{CliError, CliResult, ExitCode, RunArgs};

/// `kiln run`: load settings, apply flag overrides, orchestrate, report.
pub fn run_command(args: &RunArgs) -> CliResult<ExitCode> {
    let started = Instant::now();

    let mut settings = RunSettings::from_file(&args.settings)
        .map_err(|e| CliError::failure(format!("cannot load '{}': {e}", args.settings.display())))?;
    if !args.test_sets.is_empty() {
        settings = settings.partition(&args.test_sets);
        for name in &args.test_sets {
            if settings.suite(name).is_none() {
                return Err(CliError::failure(format!(
                    "test set '{name}' is not defined in {}",
                    args.settings.display()
                )));
            }
        }
    }
    settings.intent = intent_from_args(args, settings.intent)?;
    if let Some(rerun) = args.rerun_failing {
        settings.rerun_failing_count = rerun;
    }

    let config = config_from_args(args)?;
    let pool = ForkPool::new(config, settings);
    let (result, handles) = pool
        .run()
        .map_err(|e| CliError::failure(format!("run failed: {e}")))?;

    for handle in &handles {
        tracing::debug!(
            fork_index = handle.fork_index,
            pid = handle.pid,
            state = ?handle.state,
            stdout_bytes = handle.stdout_bytes,
            stderr_bytes = handle.stderr_bytes,
            "worker reaped"
        );
    }
    print_summary(&result, started.elapsed());

    if result.no_tests {
        return if args.fail_if_no_tests {
            Err(CliError::with_code("no tests were executed", EXIT_NO_TESTS))
        } else {
            eprintln!("No tests executed");
            Ok(ExitCode::SUCCESS)
        };
    }
    match result.outcome {
        RunOutcome::Success => Ok(ExitCode::SUCCESS),
        RunOutcome::Failures => Err(CliError::new("", ExitCode::FAILURE)),
        RunOutcome::Timeout => Err(CliError::with_code("run timed out", 2)),
        RunOutcome::Crashed(code) => Err(CliError::with_code(
            format!("worker crashed with exit code {code}"),
            2,
        )),
    }
}

fn intent_from_args(args: &RunArgs, base: ConcurrencyIntent) -> CliResult<ConcurrencyIntent> {
    let mut intent = base;
    for level in &args.parallel {
        match level.as_str() {
            "suites" => intent.parallel_suites = true,
            "classes" => intent.parallel_classes = true,
            "methods" => intent.parallel_methods = true,
            other => {
                return Err(CliError::failure(format!(
                    "unknown parallel level '{other}' (expected suites, classes, methods)"
                )));
            }
        }
    }
    if args.threads.is_some() {
        intent.thread_count = args.threads;
    }
    if args.threads_suites.is_some() {
        intent.thread_count_suites = args.threads_suites;
    }
    if args.threads_classes.is_some() {
        intent.thread_count_classes = args.threads_classes;
    }
    if args.threads_methods.is_some() {
        intent.thread_count_methods = args.threads_methods;
    }
    intent.unlimited |= args.unlimited;
    intent.per_core |= args.per_core;
    Ok(intent)
}

fn config_from_args(args: &RunArgs) -> CliResult<ForkConfiguration> {
    let working_dir = match &args.working_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()
            .map_err(|e| CliError::failure(format!("cannot determine working directory: {e}")))?,
    };
    let entry = match &args.worker_bin {
        Some(path) => path.clone(),
        None => default_worker_bin()?,
    };
    Ok(ForkConfiguration {
        entry,
        boot_paths: args.boot_paths.clone(),
        working_dir,
        arg_line: args.argline.clone(),
        env: BTreeMap::new(),
        debug: args.debug_forks,
        fork_count: args.forks,
        reuse_forks: !args.no_reuse,
        timeout: args.timeout.map(Duration::from_secs),
        delivery: PathDelivery::Auto,
        modular: args.modular,
        reports_dir: args.reports_dir.clone(),
    })
}

/// The worker binary ships next to the controller binary.
fn default_worker_bin() -> CliResult<PathBuf> {
    let me = std::env::current_exe()
        .map_err(|e| CliError::failure(format!("cannot locate own executable: {e}")))?;
    let worker = me.with_file_name("kiln-worker");
    if !worker.exists() {
        return Err(CliError::failure(format!(
            "worker binary not found at {}; pass --worker-bin",
            worker.display()
        )));
    }
    Ok(worker)
}

fn print_summary(result: &RunResult, elapsed: Duration) {
    let c = &result.counters;
    let ok = matches!(result.outcome, RunOutcome::Success);
    let color = if ok { "\x1b[1;32m" } else { "\x1b[1;31m" };

    let mut parts = vec![format!("{} run", c.completed)];
    if c.failures > 0 {
        parts.push(format!("{} failed", c.failures));
    }
    if c.errors > 0 {
        parts.push(format!("{} errors", c.errors));
    }
    if c.skipped > 0 {
        parts.push(format!("{} skipped", c.skipped));
    }
    if c.flakes > 0 {
        parts.push(format!("{} flaky", c.flakes));
    }
    match result.outcome {
        RunOutcome::Timeout => parts.push("TIMED OUT".to_string()),
        RunOutcome::Crashed(code) => parts.push(format!("CRASHED ({code})")),
        _ => {}
    }

    println!(
        "{color}=================== {} in {:.2}s ===================\x1b[0m",
        parts.join(", "),
        elapsed.as_secs_f64()
    );
    if let Some(dump) = &result.dump_path {
        println!("Protocol errors were dumped to {}", dump.display());
    }
}
