//! Events emitted by a worker process while executing tests.
//!
//! An [`Event`] pairs a [`RunMode`] tag with the payload data. Report-bearing
//! events carry a [`ReportEntry`]; console and standard-stream events carry
//! text; the control events (`bye`, `stop-on-next-test`, `next-test`) carry
//! nothing. Events are immutable once decoded and are consumed exactly once
//! by the controller.

use std::fmt;

/// Whether an event was produced during the normal run or while re-running a
/// previously failed test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    #[default]
    Normal,
    Rerun,
}

impl RunMode {
    /// Wire token for this run mode.
    pub fn token(self) -> &'static str {
        match self {
            RunMode::Normal => "normal-run",
            RunMode::Rerun => "rerun",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "normal-run" => Some(RunMode::Normal),
            "rerun" => Some(RunMode::Rerun),
            _ => None,
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// Severity of a worker console message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// Structured stack trace attached to a report entry or exit error.
///
/// All four variants are optional on the wire; a trace with every variant
/// absent is normalized away during decoding (see [`StackTrace::normalized`]).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StackTrace {
    /// Localized exception message.
    pub message: Option<String>,
    /// Trace trimmed down to the single most relevant frame.
    pub smart_trimmed: Option<String>,
    /// Full untrimmed trace.
    pub full: Option<String>,
    /// Trace trimmed to the test class boundary.
    pub trimmed: Option<String>,
}

impl StackTrace {
    /// `None` when every variant is absent, so that an all-null trace and a
    /// missing trace are the same value after a decode round trip.
    pub fn normalized(self) -> Option<Self> {
        let empty = self.message.is_none()
            && self.smart_trimmed.is_none()
            && self.full.is_none()
            && self.trimmed.is_none();
        if empty { None } else { Some(self) }
    }
}

/// One reported test unit: a suite, class, or method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportEntry {
    /// Source identifier (class name or suite id). Never absent.
    pub source: String,
    /// Human-readable name, when it differs from the source.
    pub display_name: Option<String>,
    /// Group/category the unit belongs to.
    pub group: Option<String>,
    /// Elapsed wall-clock milliseconds, absent for `*Starting` events.
    pub elapsed_ms: Option<u32>,
    /// Failure detail, absent for passing units.
    pub stack_trace: Option<StackTrace>,
}

impl ReportEntry {
    /// Entry with only a source id, the shape every lifecycle event starts
    /// from.
    pub fn named(source: impl Into<String>) -> Self {
        ReportEntry {
            source: source.into(),
            display_name: None,
            group: None,
            elapsed_ms: None,
            stack_trace: None,
        }
    }

    pub fn with_elapsed(mut self, millis: u32) -> Self {
        self.elapsed_ms = Some(millis);
        self
    }

    pub fn with_stack_trace(mut self, trace: StackTrace) -> Self {
        self.stack_trace = trace.normalized();
        self
    }
}

/// The payload of one worker event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventData {
    SuiteStarting(ReportEntry),
    SuiteCompleted(ReportEntry),
    TestStarting(ReportEntry),
    TestSucceeded(ReportEntry),
    TestFailed(ReportEntry),
    TestError(ReportEntry),
    TestSkipped(ReportEntry),
    AssumptionFailure(ReportEntry),
    Console {
        level: ConsoleLevel,
        text: String,
    },
    StdOut {
        text: Option<String>,
        newline: bool,
    },
    StdErr {
        text: Option<String>,
        newline: bool,
    },
    SystemProperty {
        key: String,
        value: String,
    },
    StopOnNextTest,
    AcquireNextTest,
    ExitError {
        trace: Option<StackTrace>,
    },
    Bye,
}

/// A decoded worker event: run-mode tag plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub run_mode: RunMode,
    pub data: EventData,
}

impl Event {
    pub fn new(run_mode: RunMode, data: EventData) -> Self {
        Event { run_mode, data }
    }

    /// Normal-run event, the common case.
    pub fn normal(data: EventData) -> Self {
        Event::new(RunMode::Normal, data)
    }

    /// Wire opcode for this event's payload.
    pub fn opcode(&self) -> &'static str {
        match &self.data {
            EventData::SuiteStarting(_) => "testset-starting",
            EventData::SuiteCompleted(_) => "testset-completed",
            EventData::TestStarting(_) => "test-starting",
            EventData::TestSucceeded(_) => "test-succeeded",
            EventData::TestFailed(_) => "test-failed",
            EventData::TestError(_) => "test-error",
            EventData::TestSkipped(_) => "test-skipped",
            EventData::AssumptionFailure(_) => "test-assumption-failure",
            EventData::Console { level, .. } => match level {
                ConsoleLevel::Debug => "console-debug",
                ConsoleLevel::Info => "console-info",
                ConsoleLevel::Warning => "console-warning",
                ConsoleLevel::Error => "console-error",
            },
            EventData::StdOut { newline: false, .. } => "std-out",
            EventData::StdOut { newline: true, .. } => "std-out-line",
            EventData::StdErr { newline: false, .. } => "std-err",
            EventData::StdErr { newline: true, .. } => "std-err-line",
            EventData::SystemProperty { .. } => "sys-prop",
            EventData::StopOnNextTest => "stop-on-next-test",
            EventData::AcquireNextTest => "next-test",
            EventData::ExitError { .. } => "exit-error",
            EventData::Bye => "bye",
        }
    }

    /// The report entry, for report-bearing events.
    pub fn report(&self) -> Option<&ReportEntry> {
        match &self.data {
            EventData::SuiteStarting(re)
            | EventData::SuiteCompleted(re)
            | EventData::TestStarting(re)
            | EventData::TestSucceeded(re)
            | EventData::TestFailed(re)
            | EventData::TestError(re)
            | EventData::TestSkipped(re)
            | EventData::AssumptionFailure(re) => Some(re),
            _ => None,
        }
    }
}
