//! Orchestrates how many workers run and what each one owns.
//!
//! Three modes, selected by the fork configuration: *Never* runs everything
//! in the controller process; *Once* spawns `fork_count` long-lived workers
//! up front, each owning a fixed partition of the discovered test sets;
//! *Always* spawns a fresh worker per test set, with at most `fork_count`
//! in flight and no reuse.
//!
//! One worker crashing never aborts its siblings: every invocation's result
//! is recorded and the aggregate is the worst of them, counters summed.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use kiln_wire::Event;

use crate::exec::dispatcher::{EventDispatcher, EventSink};
use crate::exec::planner::{self, ConcurrencyPlan, PlanError};
use crate::exec::provider::{provider_for, ProviderError};
use crate::settings::RunSettings;

use super::config::{ConfigError, ForkConfiguration};
use super::launcher::{ForkLauncher, LaunchError, WorkerHandle};
use super::result::{RunCounters, RunResult};

/// Process-reuse policy derived from the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkMode {
    /// No worker processes; tests run in the controller.
    Never,
    /// `fork_count` reusable workers, each handling its whole partition.
    Once,
    /// A fresh worker per test set, capped to `fork_count` in flight.
    Always,
}

impl ForkMode {
    pub fn from_config(config: &ForkConfiguration) -> Self {
        if config.fork_count == 0 {
            ForkMode::Never
        } else if config.reuse_forks {
            ForkMode::Once
        } else {
            ForkMode::Always
        }
    }
}

#[derive(Debug, Error)]
pub enum OrchestrateError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("cannot create scratch directory: {0}")]
    Scratch(#[from] std::io::Error),
}

/// Allocator for fork indices, scoped to one orchestrator run. Released
/// numbers are reused lowest-first, so a rolling *Always* run keeps its
/// indices dense.
pub struct ForkNumberPool {
    free: Mutex<BinaryHeap<Reverse<u32>>>,
    next: Mutex<u32>,
}

impl ForkNumberPool {
    pub fn new() -> Self {
        ForkNumberPool {
            free: Mutex::new(BinaryHeap::new()),
            next: Mutex::new(1),
        }
    }

    pub fn claim(&self) -> u32 {
        if let Some(Reverse(n)) = self.free.lock().pop() {
            return n;
        }
        let mut next = self.next.lock();
        let n = *next;
        *next += 1;
        n
    }

    pub fn release(&self, n: u32) {
        self.free.lock().push(Reverse(n));
    }
}

impl Default for ForkNumberPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Event sink that only keeps score, used for in-process (Never) runs.
#[derive(Default)]
pub struct CounterSink {
    counters: Mutex<RunCounters>,
}

impl CounterSink {
    pub fn snapshot(&self) -> RunCounters {
        *self.counters.lock()
    }
}

impl EventSink for CounterSink {
    fn emit(&self, event: Event) {
        self.counters.lock().record(&event);
    }
}

/// Top-level run orchestrator.
pub struct ForkPool {
    config: Arc<ForkConfiguration>,
    settings: RunSettings,
}

impl ForkPool {
    pub fn new(config: ForkConfiguration, settings: RunSettings) -> Self {
        ForkPool {
            config: Arc::new(config),
            settings,
        }
    }

    pub fn mode(&self) -> ForkMode {
        ForkMode::from_config(&self.config)
    }

    /// Execute the whole run. Only configuration problems surface as `Err`;
    /// everything after a worker spawns is folded into the `RunResult`.
    pub fn run(&self) -> Result<(RunResult, Vec<WorkerHandle>), OrchestrateError> {
        // Configuration errors are fatal before any process is spawned.
        self.config.prepare()?;
        self.settings.intent.validate()?;

        let units = self.settings.suite_names();
        if units.is_empty() {
            return Ok((
                RunResult {
                    no_tests: true,
                    ..RunResult::default()
                },
                Vec::new(),
            ));
        }

        match self.mode() {
            ForkMode::Never => self.run_in_process(&units).map(|r| (r, Vec::new())),
            ForkMode::Once => self.run_once(&units),
            ForkMode::Always => self.run_per_test_set(&units),
        }
    }

    /// Degenerate mode: the controller is the worker.
    fn run_in_process(&self, units: &[String]) -> Result<RunResult, OrchestrateError> {
        let provider = provider_for(&self.settings)?;
        let plan = if self.settings.intent.any_parallel() {
            planner::resolve(&self.settings.intent, self.settings.counter_for(units))?
        } else {
            ConcurrencyPlan::serial()
        };
        let sink = Arc::new(CounterSink::default());
        let dispatcher = EventDispatcher::new(
            provider,
            Arc::clone(&sink) as Arc<dyn EventSink>,
            plan,
            self.settings.rerun_failing_count,
            self.settings.trim_stack_traces,
        );
        let summary = dispatcher.execute(units);
        dispatcher.shutdown();

        let mut result = RunResult::success(sink.snapshot());
        result.no_tests = summary.tests == 0;
        Ok(result)
    }

    /// One long-lived worker per fork index; each gets its partition as a
    /// single test set batch.
    fn run_once(&self, units: &[String]) -> Result<(RunResult, Vec<WorkerHandle>), OrchestrateError> {
        let scratch = Arc::new(tempfile::tempdir()?);
        let fork_numbers = ForkNumberPool::new();
        let workers = (self.config.fork_count as usize).min(units.len()).max(1);

        // Round-robin partition keeps bucket sizes within one of each other.
        let mut buckets: Vec<Vec<String>> = vec![Vec::new(); workers];
        for (i, unit) in units.iter().enumerate() {
            buckets[i % workers].push(unit.clone());
        }

        let mut results: Vec<Result<(RunResult, WorkerHandle), LaunchError>> = Vec::new();
        std::thread::scope(|scope| {
            let mut joins = Vec::new();
            for bucket in &buckets {
                let launcher = ForkLauncher::new(Arc::clone(&self.config), Arc::clone(&scratch));
                let partition = self.settings.partition(bucket);
                let fork_index = fork_numbers.claim();
                joins.push(scope.spawn(move || {
                    let outcome = launcher.launch(fork_index, &partition, bucket);
                    (fork_index, outcome)
                }));
            }
            for join in joins {
                match join.join() {
                    Ok((fork_index, outcome)) => {
                        fork_numbers.release(fork_index);
                        results.push(outcome);
                    }
                    Err(_) => tracing::error!("fork thread panicked"),
                }
            }
        });
        collect(results)
    }

    /// A fresh worker per test set, never reused, bounded in flight.
    fn run_per_test_set(
        &self,
        units: &[String],
    ) -> Result<(RunResult, Vec<WorkerHandle>), OrchestrateError> {
        let scratch = Arc::new(tempfile::tempdir()?);
        let fork_numbers = Arc::new(ForkNumberPool::new());
        let in_flight = (self.config.fork_count as usize).max(1);

        let (tx, rx) = crossbeam_channel::unbounded::<String>();
        for unit in units {
            // Send cannot fail while we hold the receiver.
            let _ = tx.send(unit.clone());
        }
        drop(tx);

        let mut results: Vec<Result<(RunResult, WorkerHandle), LaunchError>> = Vec::new();
        std::thread::scope(|scope| {
            let mut joins = Vec::new();
            for _ in 0..in_flight {
                let rx = rx.clone();
                let launcher = ForkLauncher::new(Arc::clone(&self.config), Arc::clone(&scratch));
                let fork_numbers = Arc::clone(&fork_numbers);
                let settings = &self.settings;
                joins.push(scope.spawn(move || {
                    let mut mine = Vec::new();
                    while let Ok(unit) = rx.recv() {
                        let fork_index = fork_numbers.claim();
                        let batch = vec![unit];
                        let partition = settings.partition(&batch);
                        mine.push(launcher.launch(fork_index, &partition, &batch));
                        fork_numbers.release(fork_index);
                    }
                    mine
                }));
            }
            for join in joins {
                match join.join() {
                    Ok(mine) => results.extend(mine),
                    Err(_) => tracing::error!("fork thread panicked"),
                }
            }
        });
        collect(results)
    }
}

/// Fold per-invocation outcomes into the aggregate; launch failures surface
/// as `Err` only because they mean a worker never spawned.
fn collect(
    results: Vec<Result<(RunResult, WorkerHandle), LaunchError>>,
) -> Result<(RunResult, Vec<WorkerHandle>), OrchestrateError> {
    let mut runs = Vec::new();
    let mut handles = Vec::new();
    let mut first_error = None;
    for result in results {
        match result {
            Ok((run, handle)) => {
                runs.push(run);
                handles.push(handle);
            }
            Err(e) => {
                tracing::error!(error = %e, "worker could not be launched");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }
    if runs.is_empty() {
        if let Some(e) = first_error {
            return Err(e.into());
        }
    }
    Ok((RunResult::aggregate_all(runs.iter()), handles))
}
