//! Spawns one worker process, streams its events, and reaps it.
//!
//! Lifecycle: `NotStarted → Starting → Running` and then one of
//! `NormalExit`, `Crashed`, or `TimedOut → Killed`, before settling in
//! `Closed` once both consumer threads have drained and the process handle
//! is released.
//!
//! The goodbye handshake is enforced here: a worker that exits 0 without
//! having sent `bye` violated the protocol and is recorded as crashed, not
//! successful. Crashes and timeouts are data in the returned [`RunResult`],
//! never panics — retry policy belongs to the caller.

use std::collections::BTreeMap;
use std::io::Write;
use std::process::{Child, ChildStdin};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_utils::sync::WaitGroup;
use parking_lot::Mutex;
use thiserror::Error;

use kiln_wire::{
    encode_command, Command, ConsoleLevel, Event, EventData, MalformedFrame, StackTrace,
};

use crate::settings::{RunSettings, SettingsError};

use super::config::{ConfigError, ForkConfiguration};
use super::consumer::{spawn_consumer, EventHandler};
use super::dump::DumpFile;
use super::result::{RunCounters, RunOutcome, RunResult, EXIT_NO_TESTS, EXIT_SUCCESS};

/// How often the launcher polls the child while waiting.
const WAIT_POLL: Duration = Duration::from_millis(25);

/// Where a worker ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerLifecycle {
    NotStarted,
    Starting,
    Running,
    NormalExit,
    Crashed(i32),
    TimedOut,
    /// Final sub-state after a timeout: the process was forcibly killed.
    Killed,
    Closed,
}

/// Diagnostic summary of one reaped worker.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub pid: u32,
    pub fork_index: u32,
    pub state: WorkerLifecycle,
    pub stdout_bytes: u64,
    pub stderr_bytes: u64,
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("cannot write worker settings: {0}")]
    Settings(#[from] SettingsError),
    #[error("cannot spawn worker process: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("worker I/O setup failed: {0}")]
    Io(#[from] std::io::Error),
}

/// The single writer on the controller → worker command channel.
pub struct CommandWriter {
    stdin: Mutex<Option<ChildStdin>>,
}

impl CommandWriter {
    fn new(stdin: ChildStdin) -> Self {
        CommandWriter {
            stdin: Mutex::new(Some(stdin)),
        }
    }

    pub fn send(&self, command: &Command) -> std::io::Result<()> {
        let mut guard = self.stdin.lock();
        let Some(stdin) = guard.as_mut() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "command channel already closed",
            ));
        };
        stdin.write_all(&encode_command(command))?;
        stdin.flush()
    }

    /// Close the channel; the worker sees EOF.
    pub fn close(&self) {
        self.stdin.lock().take();
    }
}

/// Controller-side state accumulated from one worker's event stream.
struct ForkClient {
    counters: Mutex<RunCounters>,
    bye_seen: AtomicBool,
    exit_error: Mutex<Option<StackTrace>>,
    system_properties: Mutex<BTreeMap<String, String>>,
    dump: Arc<DumpFile>,
    writer: Arc<CommandWriter>,
}

impl ForkClient {
    fn new(dump: Arc<DumpFile>, writer: Arc<CommandWriter>) -> Self {
        ForkClient {
            counters: Mutex::new(RunCounters::default()),
            bye_seen: AtomicBool::new(false),
            exit_error: Mutex::new(None),
            system_properties: Mutex::new(BTreeMap::new()),
            dump,
            writer,
        }
    }
}

impl EventHandler for ForkClient {
    fn on_event(&self, event: Event) {
        self.counters.lock().record(&event);
        match event.data {
            EventData::TestSucceeded(_)
            | EventData::TestFailed(_)
            | EventData::TestError(_)
            | EventData::TestSkipped(_)
            | EventData::AssumptionFailure(_) => {}
            EventData::SuiteStarting(ref re) => {
                tracing::debug!(suite = %re.source, "test set starting");
            }
            EventData::SuiteCompleted(ref re) => {
                tracing::debug!(
                    suite = %re.source,
                    elapsed_ms = re.elapsed_ms,
                    "test set completed"
                );
            }
            EventData::TestStarting(_) | EventData::AcquireNextTest => {}
            EventData::StopOnNextTest => {
                tracing::debug!("worker will stop before the next test");
            }
            EventData::Console { level, ref text } => match level {
                ConsoleLevel::Debug => tracing::debug!(target: "kiln::worker", "{text}"),
                ConsoleLevel::Info => tracing::info!(target: "kiln::worker", "{text}"),
                ConsoleLevel::Warning => tracing::warn!(target: "kiln::worker", "{text}"),
                ConsoleLevel::Error => tracing::error!(target: "kiln::worker", "{text}"),
            },
            EventData::StdOut { ref text, .. } | EventData::StdErr { ref text, .. } => {
                if let Some(text) = text {
                    tracing::info!(target: "kiln::worker", "{text}");
                }
            }
            EventData::SystemProperty { key, value } => {
                self.system_properties.lock().insert(key, value);
            }
            EventData::ExitError { trace } => {
                *self.exit_error.lock() = trace;
            }
            EventData::Bye => {
                self.bye_seen.store(true, Ordering::SeqCst);
                // Acknowledge so the worker may exit; a failed write means
                // it is already gone, which the exit code will show.
                let _ = self.writer.send(&Command::ByeAck);
            }
        }
    }

    fn on_malformed(&self, frame: MalformedFrame) {
        tracing::warn!(
            reason = %frame.reason,
            dump = %self.dump.path().display(),
            "malformed worker output"
        );
        self.dump.dump_once(&frame.reason, &frame.raw);
    }
}

/// Launches workers for one fork configuration.
pub struct ForkLauncher {
    config: Arc<ForkConfiguration>,
    scratch: Arc<tempfile::TempDir>,
}

impl ForkLauncher {
    pub fn new(config: Arc<ForkConfiguration>, scratch: Arc<tempfile::TempDir>) -> Self {
        ForkLauncher { config, scratch }
    }

    /// Run one worker over `units` and block until it is fully reaped.
    ///
    /// Everything that happens after the spawn — crash, timeout, protocol
    /// violation — is reported through the `RunResult`, never as an `Err`.
    pub fn launch(
        &self,
        fork_index: u32,
        settings: &RunSettings,
        units: &[String],
    ) -> Result<(RunResult, WorkerHandle), LaunchError> {
        // STARTING: settings file, command line, spawn, channel wiring.
        let settings_path = self
            .scratch
            .path()
            .join(format!("settings-{fork_index}.json"));
        settings.write_to(&settings_path)?;
        let mut command = self
            .config
            .command(fork_index, &settings_path, self.scratch.path())?;
        let mut child = command.spawn().map_err(LaunchError::Spawn)?;
        let pid = child.id();
        tracing::info!(fork_index, pid, "worker started");

        let stdin = child.stdin.take().ok_or_else(|| {
            LaunchError::Io(std::io::Error::other("worker stdin was not piped"))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            LaunchError::Io(std::io::Error::other("worker stdout was not piped"))
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            LaunchError::Io(std::io::Error::other("worker stderr was not piped"))
        })?;

        let writer = Arc::new(CommandWriter::new(stdin));
        let dump = Arc::new(DumpFile::new(&self.config.reports_dir, fork_index));
        let client = Arc::new(ForkClient::new(Arc::clone(&dump), Arc::clone(&writer)));

        // Both output channels share one decoded-event sink; the WaitGroup
        // counts down as each channel drains.
        let drained = WaitGroup::new();
        let stdout_thread = spawn_consumer(
            "stdout",
            stdout,
            Arc::clone(&client) as Arc<dyn EventHandler>,
            drained.clone(),
        )?;
        let stderr_thread = spawn_consumer(
            "stderr",
            stderr,
            Arc::clone(&client) as Arc<dyn EventHandler>,
            drained.clone(),
        )?;

        // RUNNING: feed the test set, then block on completion.
        tracing::trace!(fork_index, state = ?WorkerLifecycle::Running, "worker running");
        for unit in units {
            if let Err(e) = writer.send(&Command::RunClass(unit.clone())) {
                tracing::warn!(error = %e, "worker stopped accepting commands");
                break;
            }
        }
        if let Err(e) = writer.send(&Command::TestSetFinished) {
            tracing::warn!(error = %e, "could not finish test set handshake");
        }

        let timed_out = self.wait_with_timeout(&mut child);
        let status = child.wait()?;

        // CLOSED only after both consumers have drained all output.
        drained.wait();
        writer.close();
        let stdout_bytes = stdout_thread.join().unwrap_or(0);
        let stderr_bytes = stderr_thread.join().unwrap_or(0);

        let bye_seen = client.bye_seen.load(Ordering::SeqCst);
        let counters = *client.counters.lock();
        let exit_code = status.code().unwrap_or(-1);
        tracing::debug!(
            fork_index,
            properties = client.system_properties.lock().len(),
            "worker reported system properties"
        );

        let state;
        let mut result;
        if timed_out {
            state = WorkerLifecycle::Killed;
            result = RunResult {
                counters,
                outcome: RunOutcome::Timeout,
                no_tests: false,
                dump_path: None,
            };
            tracing::error!(fork_index, "worker timed out and was killed");
        } else if bye_seen && exit_code == EXIT_SUCCESS {
            state = WorkerLifecycle::NormalExit;
            result = RunResult::success(counters);
        } else if bye_seen && exit_code == EXIT_NO_TESTS {
            state = WorkerLifecycle::NormalExit;
            result = RunResult::success(counters);
            result.no_tests = true;
        } else {
            // Includes exit 0 without bye: the missing goodbye handshake is
            // a protocol violation, not a clean run.
            state = WorkerLifecycle::Crashed(exit_code);
            result = RunResult {
                counters,
                outcome: RunOutcome::Crashed(exit_code),
                no_tests: false,
                dump_path: None,
            };
            if let Some(trace) = client.exit_error.lock().as_ref() {
                tracing::error!(
                    fork_index,
                    exit_code,
                    error = trace.message.as_deref().unwrap_or("<no message>"),
                    "worker crashed"
                );
            } else {
                tracing::error!(fork_index, exit_code, bye_seen, "worker crashed");
            }
        }
        if dump.is_dirty() {
            result.dump_path = Some(dump.path().to_path_buf());
        }

        // Both consumers drained and the process reaped: the handle is
        // released, which is what Closed means; the exit state is kept in
        // the handle for diagnostics.
        let handle = WorkerHandle {
            pid,
            fork_index,
            state,
            stdout_bytes,
            stderr_bytes,
        };
        Ok((result, handle))
    }

    /// Poll the child until it exits or the configured timeout elapses, in
    /// which case it is forcibly killed. Returns whether the timeout fired.
    fn wait_with_timeout(&self, child: &mut Child) -> bool {
        let deadline = self.config.timeout.map(|t| Instant::now() + t);
        loop {
            match child.try_wait() {
                Ok(Some(_)) => return false,
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "cannot poll worker status");
                    return false;
                }
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    if let Err(e) = child.kill() {
                        tracing::warn!(error = %e, "cannot kill timed-out worker");
                    }
                    return true;
                }
            }
            std::thread::sleep(WAIT_POLL);
        }
    }
}
