//! Drives test sets through the scheduler tree and emits lifecycle events.
//!
//! The dispatcher owns the root of the scheduler tree for one worker run.
//! Each executed batch builds one node per hierarchy level instance
//! (test sets → classes → methods) according to the resolved
//! [`ConcurrencyPlan`], schedules leaves through it, and reports progress
//! through an [`EventSink`]. A test set's `SuiteCompleted` is emitted only
//! after every one of its scheduled children has drained.
//!
//! Pool wiring: a bounded overall capacity uses one shared pool for every
//! level, with per-node fair balancers enforcing the level ceilings. The
//! shared pool grows with demand — suite- and class-level tasks spend their
//! time blocked in `finished()` waiting for children, and a fixed pool would
//! deadlock on exactly that nesting — while the balancers keep the number of
//! *runnable* tasks at the planned ceiling. An unbounded capacity gives each
//! node a private pool instead.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use kiln_wire::{Event, EventData, ReportEntry, RunMode, StackTrace};

use super::balancer::Balancer;
use super::planner::{Capacity, ConcurrencyPlan};
use super::pool::ThreadPool;
use super::provider::{ClassPlan, SuitePlan, TestOutcome, TestProvider};
use super::scheduler::{Scheduler, ShutdownResult};
use super::strategy::SchedulingStrategy;

/// Where decoded-side consumers receive the worker's events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

/// Counters accumulated across one worker run.
#[derive(Debug, Default)]
struct Counters {
    tests: AtomicU32,
    failures: AtomicU32,
    errors: AtomicU32,
    skipped: AtomicU32,
    flakes: AtomicU32,
}

/// Snapshot of the dispatcher's counters after a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub tests: u32,
    pub failures: u32,
    pub errors: u32,
    pub skipped: u32,
    pub flakes: u32,
}

struct DispatchContext {
    sink: Arc<dyn EventSink>,
    provider: Arc<dyn TestProvider>,
    plan: ConcurrencyPlan,
    shared_pool: Option<Arc<ThreadPool>>,
    counters: Counters,
    rerun_failing_count: u32,
    trim_stack_traces: bool,
}

/// Worker-side executor for one run.
pub struct EventDispatcher {
    ctx: Arc<DispatchContext>,
    root: Scheduler,
}

impl EventDispatcher {
    pub fn new(
        provider: Arc<dyn TestProvider>,
        sink: Arc<dyn EventSink>,
        plan: ConcurrencyPlan,
        rerun_failing_count: u32,
        trim_stack_traces: bool,
    ) -> Self {
        let shared_pool = match plan.capacity {
            Capacity::Bounded(_) => Some(Arc::new(ThreadPool::growable("kiln-exec"))),
            _ => None,
        };
        EventDispatcher {
            ctx: Arc::new(DispatchContext {
                sink,
                provider,
                plan,
                shared_pool,
                counters: Counters::default(),
                rerun_failing_count,
                trim_stack_traces,
            }),
            root: Scheduler::new(None, SchedulingStrategy::invoke(), Balancer::Noop),
        }
    }

    /// Handle for stopping the whole tree from another thread (the command
    /// reader reacting to a shutdown command).
    pub fn stop_handle(&self) -> Scheduler {
        self.root.clone()
    }

    /// Execute one batch of test sets and wait for it to drain.
    pub fn execute(&self, unit_names: &[String]) -> DispatchSummary {
        let suites_node = self.ctx.node(Some("test-sets"), self.ctx.plan.suites);
        self.root.register(&suites_node);

        for name in unit_names {
            match self.ctx.provider.suite(name) {
                Some(suite) => {
                    let ctx = Arc::clone(&self.ctx);
                    let parent = suites_node.clone();
                    suites_node.schedule(move || run_suite(&ctx, &parent, suite));
                }
                None => {
                    tracing::warn!(%name, "no such test set");
                    self.ctx.emit(
                        RunMode::Normal,
                        EventData::Console {
                            level: kiln_wire::ConsoleLevel::Warning,
                            text: format!("no such test set: {name}"),
                        },
                    );
                }
            }
        }
        suites_node.finished();
        self.summary()
    }

    pub fn summary(&self) -> DispatchSummary {
        let c = &self.ctx.counters;
        DispatchSummary {
            tests: c.tests.load(Ordering::SeqCst),
            failures: c.failures.load(Ordering::SeqCst),
            errors: c.errors.load(Ordering::SeqCst),
            skipped: c.skipped.load(Ordering::SeqCst),
            flakes: c.flakes.load(Ordering::SeqCst),
        }
    }

    /// Stop everything, recording what had started.
    pub fn stop(&self, now: bool) -> ShutdownResult {
        self.root.describe_stopped(now)
    }

    /// Tear down every pool; the dispatcher is unusable afterwards.
    pub fn shutdown(&self) {
        self.root.shutdown_pools();
        if let Some(pool) = &self.ctx.shared_pool {
            pool.shutdown();
            pool.join();
        }
    }
}

impl DispatchContext {
    fn emit(&self, run_mode: RunMode, data: EventData) {
        self.sink.emit(Event::new(run_mode, data));
    }

    /// Build a scheduler node for one level instance.
    fn node(&self, description: Option<&str>, capacity: Capacity) -> Scheduler {
        let (strategy, balancer) = match (capacity, &self.shared_pool) {
            (Capacity::Off, _) => (SchedulingStrategy::invoke(), Balancer::Noop),
            (Capacity::Bounded(n), Some(pool)) => (
                SchedulingStrategy::shared_pool(Arc::clone(pool)),
                Balancer::new_fair(n as usize),
            ),
            (Capacity::Bounded(n), None) => (
                SchedulingStrategy::private_pool(ThreadPool::fixed("kiln-exec", n as usize)),
                Balancer::new(n as usize),
            ),
            (Capacity::Unbounded, Some(pool)) => (
                SchedulingStrategy::shared_pool(Arc::clone(pool)),
                Balancer::Noop,
            ),
            (Capacity::Unbounded, None) => (
                SchedulingStrategy::private_pool(ThreadPool::growable("kiln-exec")),
                Balancer::Noop,
            ),
        };
        Scheduler::new(description, strategy, balancer)
    }

    /// Strip the full trace variant when trimming is on.
    fn shaped(&self, trace: StackTrace) -> Option<StackTrace> {
        let mut trace = trace;
        if self.trim_stack_traces {
            trace.full = None;
        }
        trace.normalized()
    }
}

fn run_suite(ctx: &Arc<DispatchContext>, parent: &Scheduler, suite: SuitePlan) {
    let started = Instant::now();
    ctx.emit(
        RunMode::Normal,
        EventData::SuiteStarting(ReportEntry::named(&suite.name)),
    );

    let class_node = ctx.node(Some(&suite.name), ctx.plan.classes);
    parent.register(&class_node);
    for class in suite.classes {
        let ctx = Arc::clone(ctx);
        let node = class_node.clone();
        class_node.schedule(move || run_class(&ctx, &node, class));
    }
    class_node.finished();

    let elapsed = started.elapsed().as_millis() as u32;
    ctx.emit(
        RunMode::Normal,
        EventData::SuiteCompleted(ReportEntry::named(&suite.name).with_elapsed(elapsed)),
    );
}

fn run_class(ctx: &Arc<DispatchContext>, parent: &Scheduler, class: ClassPlan) {
    let method_node = ctx.node(Some(&class.name), ctx.plan.methods);
    parent.register(&method_node);
    for method in class.methods {
        let ctx = Arc::clone(ctx);
        let class_name = class.name.clone();
        let group = class.group.clone();
        method_node.schedule(move || run_leaf(&ctx, &class_name, group.as_deref(), &method));
    }
    method_node.finished();
}

fn run_leaf(ctx: &Arc<DispatchContext>, class: &str, group: Option<&str>, method: &str) {
    let mut attempt = 0u32;
    let mut failed_before = false;
    loop {
        let run_mode = if attempt == 0 {
            RunMode::Normal
        } else {
            RunMode::Rerun
        };
        let entry = || {
            let mut re = ReportEntry::named(class);
            re.display_name = Some(method.to_string());
            re.group = group.map(str::to_string);
            re
        };
        ctx.emit(run_mode, EventData::TestStarting(entry()));

        let started = Instant::now();
        let outcome = ctx.provider.run(class, method, attempt);
        let elapsed = started.elapsed().as_millis() as u32;
        let timed = entry().with_elapsed(elapsed);
        let is_error = matches!(outcome, TestOutcome::Errored(_));

        match outcome {
            TestOutcome::Passed => {
                ctx.emit(run_mode, EventData::TestSucceeded(timed));
                ctx.counters.tests.fetch_add(1, Ordering::SeqCst);
                if failed_before {
                    ctx.counters.flakes.fetch_add(1, Ordering::SeqCst);
                }
                return;
            }
            TestOutcome::Skipped(reason) => {
                let mut re = timed;
                re.stack_trace = reason.and_then(|r| {
                    StackTrace {
                        message: Some(r),
                        ..StackTrace::default()
                    }
                    .normalized()
                });
                ctx.emit(run_mode, EventData::TestSkipped(re));
                ctx.counters.tests.fetch_add(1, Ordering::SeqCst);
                ctx.counters.skipped.fetch_add(1, Ordering::SeqCst);
                return;
            }
            TestOutcome::AssumptionFailed(trace) => {
                let mut re = timed;
                re.stack_trace = ctx.shaped(trace);
                ctx.emit(run_mode, EventData::AssumptionFailure(re));
                ctx.counters.tests.fetch_add(1, Ordering::SeqCst);
                ctx.counters.skipped.fetch_add(1, Ordering::SeqCst);
                return;
            }
            TestOutcome::Failed(trace) | TestOutcome::Errored(trace) => {
                let mut re = timed;
                re.stack_trace = ctx.shaped(trace);
                let data = if is_error {
                    EventData::TestError(re)
                } else {
                    EventData::TestFailed(re)
                };
                ctx.emit(run_mode, data);
                failed_before = true;
                if attempt < ctx.rerun_failing_count {
                    attempt += 1;
                    continue;
                }
                ctx.counters.tests.fetch_add(1, Ordering::SeqCst);
                if is_error {
                    ctx.counters.errors.fetch_add(1, Ordering::SeqCst);
                } else {
                    ctx.counters.failures.fetch_add(1, Ordering::SeqCst);
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::planner::ConcurrencyPlan;
    use crate::exec::provider::ScriptedProvider;
    use crate::settings::{BehaviorSpec, ClassSpec, MethodSpec, RunSettings, SuiteSpec};
    use parking_lot::Mutex;

    /// Collects events in arrival order.
    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<Event>>,
    }

    impl EventSink for RecordingSink {
        fn emit(&self, event: Event) {
            self.events.lock().push(event);
        }
    }

    fn settings() -> RunSettings {
        RunSettings {
            suites: vec![SuiteSpec {
                name: "alpha".to_string(),
                classes: vec![ClassSpec {
                    name: "AlphaTest".to_string(),
                    group: None,
                    methods: vec![
                        MethodSpec {
                            name: "ok".to_string(),
                            behavior: BehaviorSpec::Pass,
                            delay_ms: 0,
                        },
                        MethodSpec {
                            name: "bad".to_string(),
                            behavior: BehaviorSpec::Fail {
                                message: "nope".to_string(),
                            },
                            delay_ms: 0,
                        },
                        MethodSpec {
                            name: "meh".to_string(),
                            behavior: BehaviorSpec::Skip { reason: None },
                            delay_ms: 0,
                        },
                    ],
                }],
            }],
            ..RunSettings::default()
        }
    }

    fn dispatcher(plan: ConcurrencyPlan, sink: Arc<RecordingSink>) -> EventDispatcher {
        let provider = Arc::new(ScriptedProvider::new(settings()));
        EventDispatcher::new(provider, sink, plan, 0, false)
    }

    #[test]
    fn serial_run_reports_each_outcome() {
        let sink = Arc::new(RecordingSink::default());
        let d = dispatcher(ConcurrencyPlan::serial(), Arc::clone(&sink));
        let summary = d.execute(&["alpha".to_string()]);
        d.shutdown();

        assert_eq!(summary.tests, 3);
        assert_eq!(summary.failures, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.errors, 0);

        let events = sink.events.lock();
        assert!(matches!(events[0].data, EventData::SuiteStarting(_)));
        assert!(matches!(
            events.last().map(|e| &e.data),
            Some(EventData::SuiteCompleted(_))
        ));
    }

    #[test]
    fn starting_always_precedes_terminal_event() {
        let sink = Arc::new(RecordingSink::default());
        let plan = ConcurrencyPlan {
            suites: Capacity::Off,
            classes: Capacity::Off,
            methods: Capacity::Bounded(2),
            capacity: Capacity::Bounded(2),
        };
        let d = dispatcher(plan, Arc::clone(&sink));
        d.execute(&["alpha".to_string()]);
        d.shutdown();

        let events = sink.events.lock();
        for (i, event) in events.iter().enumerate() {
            if let Some(re) = event.report() {
                if matches!(
                    event.data,
                    EventData::TestSucceeded(_)
                        | EventData::TestFailed(_)
                        | EventData::TestSkipped(_)
                ) {
                    let started_earlier = events[..i].iter().any(|e| {
                        matches!(&e.data, EventData::TestStarting(prior)
                            if prior.display_name == re.display_name)
                    });
                    assert!(started_earlier, "terminal without starting: {event:?}");
                }
            }
        }
    }

    #[test]
    fn suite_completed_is_last_suite_event() {
        let sink = Arc::new(RecordingSink::default());
        let plan = ConcurrencyPlan {
            suites: Capacity::Bounded(2),
            classes: Capacity::Bounded(2),
            methods: Capacity::Bounded(2),
            capacity: Capacity::Bounded(6),
        };
        let d = dispatcher(plan, Arc::clone(&sink));
        d.execute(&["alpha".to_string()]);
        d.shutdown();

        let events = sink.events.lock();
        let completed_at = events
            .iter()
            .position(|e| matches!(e.data, EventData::SuiteCompleted(_)))
            .expect("suite completed");
        let last_test_event = events
            .iter()
            .rposition(|e| e.report().is_some_and(|re| re.source == "AlphaTest"))
            .expect("test events");
        assert!(completed_at > last_test_event);
    }

    #[test]
    fn flaky_test_counts_once_as_flake() {
        let sink = Arc::new(RecordingSink::default());
        let mut s = settings();
        s.suites[0].classes[0].methods = vec![MethodSpec {
            name: "flaky".to_string(),
            behavior: BehaviorSpec::FailOnce {
                message: "transient".to_string(),
            },
            delay_ms: 0,
        }];
        let provider = Arc::new(ScriptedProvider::new(s));
        let d = EventDispatcher::new(
            provider,
            Arc::clone(&sink) as Arc<dyn EventSink>,
            ConcurrencyPlan::serial(),
            1,
            false,
        );
        let summary = d.execute(&["alpha".to_string()]);
        d.shutdown();

        assert_eq!(summary.tests, 1);
        assert_eq!(summary.failures, 0);
        assert_eq!(summary.flakes, 1);

        let events = sink.events.lock();
        let rerun_success = events.iter().any(|e| {
            e.run_mode == RunMode::Rerun && matches!(e.data, EventData::TestSucceeded(_))
        });
        assert!(rerun_success);
    }

    #[test]
    fn unknown_test_set_warns_instead_of_failing() {
        let sink = Arc::new(RecordingSink::default());
        let d = dispatcher(ConcurrencyPlan::serial(), Arc::clone(&sink));
        let summary = d.execute(&["ghost".to_string()]);
        d.shutdown();
        assert_eq!(summary.tests, 0);
        let events = sink.events.lock();
        assert!(events
            .iter()
            .any(|e| matches!(&e.data, EventData::Console { text, .. } if text.contains("ghost"))));
    }
}
