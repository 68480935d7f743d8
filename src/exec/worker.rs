//! Worker-process main loop.
//!
//! A worker is started by the controller with one positional argument: the
//! path of its run-settings file. It announces a fixed set of system
//! properties, consumes commands from stdin, executes the commanded test
//! sets through the dispatcher, and finishes with the `bye` handshake:
//! emit `bye`, wait briefly for `bye-ack`, exit.
//!
//! Exit codes: 0 for a completed run, 254 when no tests ran, 255 for an
//! internal failure. A panic escaping the run is reported as an
//! `exit-error` event before the nonzero exit.

use std::io::{Read, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use kiln_wire::{
    encode_event, Command, ConsoleLevel, DecodeOutcome, Decoded, Event, EventData, FrameDecoder,
    ShutdownMode, StackTrace,
};

use crate::fork::result::{EXIT_FAILURE, EXIT_NO_TESTS, EXIT_SUCCESS};
use crate::settings::{RunSettings, ENV_FORK_ID};

use super::dispatcher::{EventDispatcher, EventSink};
use super::planner::{self, ConcurrencyPlan};
use super::provider::provider_for;
use super::scheduler::Scheduler;

/// How long the worker waits for `bye-ack` before giving up and exiting.
const BYE_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Serializes frames onto the worker's stdout. The pipe has exactly one
/// writer: every event goes through this lock.
struct WireSink {
    out: Mutex<Box<dyn Write + Send>>,
    trouble: AtomicBool,
}

impl WireSink {
    fn stdout() -> Self {
        WireSink {
            out: Mutex::new(Box::new(std::io::stdout())),
            trouble: AtomicBool::new(false),
        }
    }
}

impl EventSink for WireSink {
    fn emit(&self, event: Event) {
        let bytes = encode_event(&event);
        let mut out = self.out.lock();
        let result = out.write_all(&bytes).and_then(|()| out.flush());
        if result.is_err() && !self.trouble.swap(true, Ordering::SeqCst) {
            // Stdout is gone; the controller will see the missing bye.
            tracing::error!("event channel closed while writing");
        }
    }
}

/// Entry point for the `kiln-worker` binary.
pub fn run(settings_path: &Path) -> i32 {
    let sink: Arc<WireSink> = Arc::new(WireSink::stdout());

    let settings = match RunSettings::from_file(settings_path) {
        Ok(settings) => settings,
        Err(e) => {
            sink.emit(Event::normal(EventData::Console {
                level: ConsoleLevel::Error,
                text: format!("cannot load run settings: {e}"),
            }));
            return EXIT_FAILURE;
        }
    };

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        run_session(&settings, Arc::clone(&sink) as Arc<dyn EventSink>)
    }));
    match outcome {
        Ok(code) => code,
        Err(payload) => {
            let message = panic_message(&payload);
            sink.emit(Event::normal(EventData::ExitError {
                trace: StackTrace {
                    message: Some(message),
                    ..StackTrace::default()
                }
                .normalized(),
            }));
            EXIT_FAILURE
        }
    }
}

fn run_session(settings: &RunSettings, sink: Arc<dyn EventSink>) -> i32 {
    emit_system_properties(settings, sink.as_ref());

    let provider = match provider_for(settings) {
        Ok(provider) => provider,
        Err(e) => {
            sink.emit(Event::normal(EventData::Console {
                level: ConsoleLevel::Error,
                text: e.to_string(),
            }));
            return EXIT_FAILURE;
        }
    };

    // Commands are split into two paths: lifecycle commands flow through the
    // channel into the batch loop below, while shutdown is acted on directly
    // by the reader thread so a busy dispatcher can still be stopped.
    let (tx, rx) = crossbeam_channel::unbounded();
    let stop_handle: Arc<Mutex<Option<Scheduler>>> = Arc::new(Mutex::new(None));
    let stop_requested = Arc::new(AtomicBool::new(false));
    spawn_command_reader(
        std::io::stdin(),
        tx,
        Arc::clone(&stop_handle),
        Arc::clone(&stop_requested),
        Arc::clone(&sink),
    );

    // Collect one batch of test sets, then run it.
    let mut batch: Vec<String> = Vec::new();
    let mut total_tests = 0u32;
    loop {
        match rx.recv() {
            Ok(Command::RunClass(name)) => {
                batch.push(name);
                sink.emit(Event::normal(EventData::AcquireNextTest));
            }
            Ok(Command::TestSetFinished) => {
                if !stop_requested.load(Ordering::SeqCst) {
                    match execute_batch(settings, &provider, &sink, &stop_handle, &batch) {
                        Ok(tests) => total_tests += tests,
                        Err(code) => return code,
                    }
                }
                batch.clear();
                break;
            }
            Ok(Command::Shutdown(_)) => break,
            Ok(Command::ByeAck) => {}
            // Controller hung up without finishing the handshake.
            Err(_) => break,
        }
    }

    sink.emit(Event::normal(EventData::Bye));
    await_bye_ack(&rx);

    if total_tests == 0 {
        EXIT_NO_TESTS
    } else {
        EXIT_SUCCESS
    }
}

fn execute_batch(
    settings: &RunSettings,
    provider: &Arc<dyn super::provider::TestProvider>,
    sink: &Arc<dyn EventSink>,
    stop_handle: &Arc<Mutex<Option<Scheduler>>>,
    batch: &[String],
) -> Result<u32, i32> {
    let plan = if settings.intent.any_parallel() {
        match planner::resolve(&settings.intent, settings.counter_for(batch)) {
            Ok(plan) => plan,
            Err(e) => {
                sink.emit(Event::normal(EventData::Console {
                    level: ConsoleLevel::Error,
                    text: format!("cannot resolve concurrency: {e}"),
                }));
                return Err(EXIT_FAILURE);
            }
        }
    } else {
        ConcurrencyPlan::serial()
    };

    let dispatcher = EventDispatcher::new(
        Arc::clone(provider),
        Arc::clone(sink),
        plan,
        settings.rerun_failing_count,
        settings.trim_stack_traces,
    );
    *stop_handle.lock() = Some(dispatcher.stop_handle());
    let summary = dispatcher.execute(batch);
    *stop_handle.lock() = None;
    dispatcher.shutdown();
    Ok(summary.tests)
}

fn spawn_command_reader(
    mut input: impl Read + Send + 'static,
    tx: Sender<Command>,
    stop_handle: Arc<Mutex<Option<Scheduler>>>,
    stop_requested: Arc<AtomicBool>,
    sink: Arc<dyn EventSink>,
) {
    let builder = std::thread::Builder::new().name("kiln-commands".to_string());
    let spawned = builder.spawn(move || {
        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; 4096];
        'reading: loop {
            let n = match input.read(&mut buf) {
                Ok(0) | Err(_) => break 'reading,
                Ok(n) => n,
            };
            decoder.feed(&buf[..n]);
            loop {
                match decoder.next() {
                    DecodeOutcome::Item(Decoded::Command(command)) => {
                        if let Command::Shutdown(mode) = &command {
                            stop_requested.store(true, Ordering::SeqCst);
                            if *mode == ShutdownMode::Exit {
                                sink.emit(Event::normal(EventData::StopOnNextTest));
                            }
                            let handle = stop_handle.lock().clone();
                            if let Some(scheduler) = handle {
                                scheduler.describe_stopped(*mode == ShutdownMode::Kill);
                            }
                        }
                        if tx.send(command).is_err() {
                            break 'reading;
                        }
                    }
                    DecodeOutcome::Item(Decoded::Event(event)) => {
                        tracing::warn!(opcode = event.opcode(), "event on the command channel");
                    }
                    DecodeOutcome::Malformed(frame) => {
                        tracing::warn!(
                            reason = %frame.reason,
                            bytes = frame.raw.len(),
                            "malformed command input"
                        );
                    }
                    DecodeOutcome::NeedMoreBytes => break,
                }
            }
        }
    });
    if let Err(e) = spawned {
        tracing::error!(error = %e, "failed to spawn command reader");
    }
}

fn await_bye_ack(rx: &Receiver<Command>) {
    let deadline = std::time::Instant::now() + BYE_ACK_TIMEOUT;
    loop {
        let now = std::time::Instant::now();
        if now >= deadline {
            tracing::debug!("no bye-ack before timeout");
            return;
        }
        match rx.recv_timeout(deadline - now) {
            Ok(Command::ByeAck) => return,
            Ok(_) => continue,
            Err(_) => return,
        }
    }
}

fn emit_system_properties(settings: &RunSettings, sink: &dyn EventSink) {
    let fork_id = std::env::var(ENV_FORK_ID).unwrap_or_else(|_| "0".to_string());
    let cwd = std::env::current_dir()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    let mut props: Vec<(String, String)> = vec![
        ("kiln.version".to_string(), env!("CARGO_PKG_VERSION").to_string()),
        ("kiln.fork.id".to_string(), fork_id),
        ("os.name".to_string(), std::env::consts::OS.to_string()),
        ("os.arch".to_string(), std::env::consts::ARCH.to_string()),
        ("user.dir".to_string(), cwd),
    ];
    props.extend(
        settings
            .report_properties
            .iter()
            .map(|(k, v)| (k.clone(), v.clone())),
    );
    for (key, value) in props {
        sink.emit(Event::normal(EventData::SystemProperty { key, value }));
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "worker panicked".to_string()
    }
}
