//! Aggregated outcome of one or more worker executions.

use kiln_wire::{Event, EventData, RunMode};

/// Worker exit code for a completed run.
pub const EXIT_SUCCESS: i32 = 0;
/// Worker exit code meaning "no tests were found to run".
pub const EXIT_NO_TESTS: i32 = 254;
/// Worker exit code for an internal failure.
pub const EXIT_FAILURE: i32 = 255;

/// Counters accumulated from a worker's report events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunCounters {
    pub completed: u32,
    pub errors: u32,
    pub failures: u32,
    pub skipped: u32,
    pub flakes: u32,
}

impl RunCounters {
    pub fn add(&mut self, other: &RunCounters) {
        self.completed += other.completed;
        self.errors += other.errors;
        self.failures += other.failures;
        self.skipped += other.skipped;
        self.flakes += other.flakes;
    }

    /// Fold one worker event into the counters. Terminal events of the
    /// normal run count directly; a re-run success retracts the failure it
    /// follows and records a flake instead.
    pub fn record(&mut self, event: &Event) {
        let rerun = event.run_mode == RunMode::Rerun;
        match &event.data {
            EventData::TestSucceeded(_) => {
                if rerun {
                    self.flakes += 1;
                    if self.failures > 0 {
                        self.failures -= 1;
                    } else {
                        self.errors = self.errors.saturating_sub(1);
                    }
                } else {
                    self.completed += 1;
                }
            }
            EventData::TestFailed(_) if !rerun => {
                self.completed += 1;
                self.failures += 1;
            }
            EventData::TestError(_) if !rerun => {
                self.completed += 1;
                self.errors += 1;
            }
            EventData::TestSkipped(_) | EventData::AssumptionFailure(_) if !rerun => {
                self.completed += 1;
                self.skipped += 1;
            }
            _ => {}
        }
    }
}

/// Terminal outcome of one invocation, ordered by severity:
/// `Success < Failures < Timeout/Crashed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunOutcome {
    #[default]
    Success,
    Failures,
    Timeout,
    Crashed(i32),
}

impl RunOutcome {
    fn severity(self) -> u8 {
        match self {
            RunOutcome::Success => 0,
            RunOutcome::Failures => 1,
            RunOutcome::Timeout | RunOutcome::Crashed(_) => 2,
        }
    }

    /// The worse of the two; on equal severity the left operand wins, so the
    /// first recorded crash keeps its exit code.
    pub fn worst_of(self, other: RunOutcome) -> RunOutcome {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }
}

/// Immutable result of one or more worker executions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunResult {
    pub counters: RunCounters,
    pub outcome: RunOutcome,
    /// True when a worker reported the no-tests sentinel.
    pub no_tests: bool,
    /// Diagnostic dump file, present when protocol errors occurred.
    pub dump_path: Option<std::path::PathBuf>,
}

impl RunResult {
    pub fn success(counters: RunCounters) -> Self {
        let outcome = if counters.failures > 0 || counters.errors > 0 {
            RunOutcome::Failures
        } else {
            RunOutcome::Success
        };
        RunResult {
            counters,
            outcome,
            no_tests: false,
            dump_path: None,
        }
    }

    /// Fold another invocation's result into this aggregate: counters are
    /// summed, the outcome is the worst of the two.
    pub fn aggregate(&mut self, other: &RunResult) {
        self.counters.add(&other.counters);
        self.outcome = self.outcome.worst_of(other.outcome);
        self.no_tests &= other.no_tests;
        if self.dump_path.is_none() {
            self.dump_path = other.dump_path.clone();
        }
    }

    /// Aggregate of many results; the identity element reports no tests.
    pub fn aggregate_all<'a>(results: impl IntoIterator<Item = &'a RunResult>) -> RunResult {
        let mut total = RunResult {
            no_tests: true,
            ..RunResult::default()
        };
        for result in results {
            total.aggregate(result);
        }
        total
    }
}
