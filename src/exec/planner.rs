//! Resolution of user-level parallelism intent into concrete pool sizes.
//!
//! The planner is a pure function: given which of {suites, classes, methods}
//! run in parallel, the raw thread-count knobs, and the discovered unit
//! counts, it produces a [`ConcurrencyPlan`] the dispatcher wires into a
//! scheduler tree. It never consults the environment directly — the core
//! count is a parameter — so every rule is unit-testable.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which hierarchy levels execute in parallel and with how many threads.
///
/// Deserialized from the run settings; assembled by the CLI from the
/// `--parallel`/`--threads`/… flags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyIntent {
    pub parallel_suites: bool,
    pub parallel_classes: bool,
    pub parallel_methods: bool,
    /// One overall thread budget distributed across the parallel levels.
    pub thread_count: Option<u32>,
    /// Independent per-level thread counts.
    pub thread_count_suites: Option<u32>,
    pub thread_count_classes: Option<u32>,
    pub thread_count_methods: Option<u32>,
    /// Pools grow to the number of ready tasks.
    pub unlimited: bool,
    /// Multiply every raw thread-count input by the number of cores.
    pub per_core: bool,
}

impl ConcurrencyIntent {
    pub fn any_parallel(&self) -> bool {
        self.parallel_suites || self.parallel_classes || self.parallel_methods
    }

    fn parallel_levels(&self) -> u32 {
        u32::from(self.parallel_suites)
            + u32::from(self.parallel_classes)
            + u32::from(self.parallel_methods)
    }

    fn has_level_counts(&self) -> bool {
        self.thread_count_suites.is_some()
            || self.thread_count_classes.is_some()
            || self.thread_count_methods.is_some()
    }

    /// Fast configuration check run by the controller before any worker is
    /// spawned, so a bad intent never costs a fork.
    pub fn validate(&self) -> Result<(), PlanError> {
        if !self.any_parallel() {
            return Ok(());
        }
        if !self.unlimited && self.thread_count.is_none() && !self.has_level_counts() {
            return Err(PlanError::MissingThreadCounts);
        }
        if let Some(total) = self.thread_count {
            if total == 0 {
                return Err(PlanError::ZeroThreads);
            }
        }
        Ok(())
    }
}

/// Discovered unit counts used to weight thread distribution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunnerCounter {
    pub suites: u32,
    pub classes: u32,
    pub methods: u32,
}

/// Capacity of one pool in the resolved plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capacity {
    /// Level is not parallel: children run inline on the parent's thread.
    Off,
    Bounded(u32),
    Unbounded,
}

impl Capacity {
    pub fn is_parallel(self) -> bool {
        !matches!(self, Capacity::Off)
    }
}

/// Resolved pool sizes per level plus the overall ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyPlan {
    pub suites: Capacity,
    pub classes: Capacity,
    pub methods: Capacity,
    /// Ceiling on threads across all levels together.
    pub capacity: Capacity,
}

impl ConcurrencyPlan {
    /// Plan for a fully serial run.
    pub fn serial() -> Self {
        ConcurrencyPlan {
            suites: Capacity::Off,
            classes: Capacity::Off,
            methods: Capacity::Off,
            capacity: Capacity::Off,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("no parallel levels selected; nothing to resolve")]
    NoParallelLevels,
    #[error(
        "parallel execution requested but no thread counts given; \
         set a thread count, per-level counts, or the unlimited flag"
    )]
    MissingThreadCounts,
    #[error("thread count must be positive")]
    ZeroThreads,
    #[error("thread count {given} cannot cover {needed} parallel levels")]
    ThreadCountTooSmall { given: u32, needed: u32 },
}

/// Resolve using the machine's core count.
pub fn resolve(
    intent: &ConcurrencyIntent,
    counts: RunnerCounter,
) -> Result<ConcurrencyPlan, PlanError> {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1);
    resolve_with_cores(intent, counts, cores)
}

/// Resolve with an explicit core count (the testable entry point).
pub fn resolve_with_cores(
    intent: &ConcurrencyIntent,
    counts: RunnerCounter,
    cores: u32,
) -> Result<ConcurrencyPlan, PlanError> {
    if !intent.any_parallel() {
        return Err(PlanError::NoParallelLevels);
    }
    intent.validate()?;

    let factor = if intent.per_core { cores.max(1) } else { 1 };

    if intent.unlimited {
        return Ok(ConcurrencyPlan {
            suites: unlimited_level(intent.parallel_suites),
            classes: unlimited_level(intent.parallel_classes),
            methods: unlimited_level(intent.parallel_methods),
            capacity: Capacity::Unbounded,
        });
    }

    match intent.thread_count {
        Some(total) => from_overall_count(intent, counts, total * factor),
        None => Ok(from_level_counts(intent, factor)),
    }
}

fn unlimited_level(parallel: bool) -> Capacity {
    if parallel {
        Capacity::Unbounded
    } else {
        Capacity::Off
    }
}

/// Mode (a): independent per-level counts. A parallel level without its own
/// count degenerates to unbounded — it is only constrained elsewhere.
fn from_level_counts(intent: &ConcurrencyIntent, factor: u32) -> ConcurrencyPlan {
    let level = |parallel: bool, count: Option<u32>| -> Capacity {
        if !parallel {
            Capacity::Off
        } else {
            match count {
                Some(n) if n > 0 => Capacity::Bounded(n * factor),
                _ => Capacity::Unbounded,
            }
        }
    };
    let suites = level(intent.parallel_suites, intent.thread_count_suites);
    let classes = level(intent.parallel_classes, intent.thread_count_classes);
    let methods = level(intent.parallel_methods, intent.thread_count_methods);

    let mut sum = 0u32;
    let mut any_unbounded = false;
    for capacity in [suites, classes, methods] {
        match capacity {
            Capacity::Bounded(n) => sum += n,
            Capacity::Unbounded => any_unbounded = true,
            Capacity::Off => {}
        }
    }
    ConcurrencyPlan {
        suites,
        classes,
        methods,
        capacity: if any_unbounded {
            Capacity::Unbounded
        } else {
            Capacity::Bounded(sum)
        },
    }
}

/// Mode (b): one overall budget distributed over the parallel levels.
fn from_overall_count(
    intent: &ConcurrencyIntent,
    counts: RunnerCounter,
    total: u32,
) -> Result<ConcurrencyPlan, PlanError> {
    let levels = intent.parallel_levels();

    // A single parallel level is the only contention point: it takes the
    // whole budget and the overall ceiling disappears.
    if levels == 1 {
        let own = Capacity::Bounded(total);
        return Ok(ConcurrencyPlan {
            suites: pick(intent.parallel_suites, own),
            classes: pick(intent.parallel_classes, own),
            methods: pick(intent.parallel_methods, own),
            capacity: Capacity::Unbounded,
        });
    }

    if total < levels {
        return Err(PlanError::ThreadCountTooSmall {
            given: total,
            needed: levels,
        });
    }

    // Weight each parallel level by its explicit count when given, else by
    // the discovered unit count; a zero weight still deserves one thread.
    let weight = |parallel: bool, explicit: Option<u32>, discovered: u32| -> Option<u64> {
        parallel.then(|| u64::from(explicit.unwrap_or(discovered)).max(1))
    };
    let w_suites = weight(intent.parallel_suites, intent.thread_count_suites, counts.suites);
    let w_classes = weight(
        intent.parallel_classes,
        intent.thread_count_classes,
        counts.classes,
    );
    let w_methods = weight(
        intent.parallel_methods,
        intent.thread_count_methods,
        counts.methods,
    );
    let w_sum: u64 = [w_suites, w_classes, w_methods].iter().flatten().sum();

    // The deepest parallel level absorbs the rounding remainder so the
    // shares never sum above the budget.
    let mut remaining = total;
    let mut shares = [0u32; 3];
    let weights = [w_suites, w_classes, w_methods];
    let leaf = weights
        .iter()
        .rposition(Option::is_some)
        .unwrap_or_default();
    for (i, weight) in weights.iter().enumerate() {
        let Some(w) = weight else { continue };
        let share = if i == leaf {
            remaining
        } else {
            // Leave at least one thread for every parallel level below us.
            let levels_after = weights[i + 1..].iter().flatten().count() as u32;
            let proportional = (u64::from(total) * w / w_sum) as u32;
            proportional.clamp(1, remaining - levels_after)
        };
        shares[i] = share;
        remaining -= share;
    }

    let level = |parallel: bool, share: u32| -> Capacity {
        if parallel {
            Capacity::Bounded(share)
        } else {
            Capacity::Off
        }
    };
    Ok(ConcurrencyPlan {
        suites: level(intent.parallel_suites, shares[0]),
        classes: level(intent.parallel_classes, shares[1]),
        methods: level(intent.parallel_methods, shares[2]),
        capacity: Capacity::Bounded(total),
    })
}

fn pick(parallel: bool, capacity: Capacity) -> Capacity {
    if parallel {
        capacity
    } else {
        Capacity::Off
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(suites: u32, classes: u32, methods: u32) -> RunnerCounter {
        RunnerCounter {
            suites,
            classes,
            methods,
        }
    }

    #[test]
    fn single_parallel_level_takes_whole_budget() {
        let intent = ConcurrencyIntent {
            parallel_suites: true,
            thread_count: Some(4),
            ..ConcurrencyIntent::default()
        };
        let plan = resolve_with_cores(&intent, counts(10, 0, 0), 8).expect("plan");
        assert_eq!(plan.suites, Capacity::Bounded(4));
        assert_eq!(plan.classes, Capacity::Off);
        assert_eq!(plan.methods, Capacity::Off);
        assert_eq!(plan.capacity, Capacity::Unbounded);
    }

    #[test]
    fn unlimited_makes_every_parallel_level_unbounded() {
        let intent = ConcurrencyIntent {
            parallel_classes: true,
            parallel_methods: true,
            unlimited: true,
            ..ConcurrencyIntent::default()
        };
        let plan = resolve_with_cores(&intent, counts(0, 5, 50), 4).expect("plan");
        assert_eq!(plan.suites, Capacity::Off);
        assert_eq!(plan.classes, Capacity::Unbounded);
        assert_eq!(plan.methods, Capacity::Unbounded);
        assert_eq!(plan.capacity, Capacity::Unbounded);
    }

    #[test]
    fn leaf_level_absorbs_rounding_remainder() {
        let intent = ConcurrencyIntent {
            parallel_classes: true,
            parallel_methods: true,
            thread_count: Some(7),
            ..ConcurrencyIntent::default()
        };
        // classes weight 3, methods weight 9: classes get 7*3/12 = 1,
        // methods absorb the remaining 6.
        let plan = resolve_with_cores(&intent, counts(0, 3, 9), 1).expect("plan");
        assert_eq!(plan.classes, Capacity::Bounded(1));
        assert_eq!(plan.methods, Capacity::Bounded(6));
        assert_eq!(plan.capacity, Capacity::Bounded(7));
    }

    #[test]
    fn shares_never_exceed_overall_count() {
        for total in 2..30u32 {
            let intent = ConcurrencyIntent {
                parallel_suites: true,
                parallel_classes: true,
                parallel_methods: true,
                thread_count: Some(total),
                ..ConcurrencyIntent::default()
            };
            if total < 3 {
                assert!(resolve_with_cores(&intent, counts(2, 7, 31), 1).is_err());
                continue;
            }
            let plan = resolve_with_cores(&intent, counts(2, 7, 31), 1).expect("plan");
            let mut sum = 0;
            for capacity in [plan.suites, plan.classes, plan.methods] {
                match capacity {
                    Capacity::Bounded(n) => {
                        assert!(n >= 1);
                        sum += n;
                    }
                    other => panic!("unexpected capacity {other:?}"),
                }
            }
            assert_eq!(sum, total);
        }
    }

    #[test]
    fn per_core_multiplies_raw_inputs() {
        let intent = ConcurrencyIntent {
            parallel_methods: true,
            thread_count: Some(2),
            per_core: true,
            ..ConcurrencyIntent::default()
        };
        let plan = resolve_with_cores(&intent, counts(0, 0, 10), 4).expect("plan");
        assert_eq!(plan.methods, Capacity::Bounded(8));
    }

    #[test]
    fn per_level_counts_resolve_independently() {
        let intent = ConcurrencyIntent {
            parallel_classes: true,
            parallel_methods: true,
            thread_count_classes: Some(3),
            thread_count_methods: Some(5),
            ..ConcurrencyIntent::default()
        };
        let plan = resolve_with_cores(&intent, counts(0, 9, 90), 1).expect("plan");
        assert_eq!(plan.classes, Capacity::Bounded(3));
        assert_eq!(plan.methods, Capacity::Bounded(5));
        assert_eq!(plan.capacity, Capacity::Bounded(8));
    }

    #[test]
    fn missing_thread_counts_fail_resolution() {
        let intent = ConcurrencyIntent {
            parallel_methods: true,
            ..ConcurrencyIntent::default()
        };
        assert_eq!(
            resolve_with_cores(&intent, counts(0, 0, 10), 4),
            Err(PlanError::MissingThreadCounts)
        );
    }

    #[test]
    fn no_parallel_levels_is_an_error() {
        let intent = ConcurrencyIntent::default();
        assert_eq!(
            resolve_with_cores(&intent, counts(1, 1, 1), 4),
            Err(PlanError::NoParallelLevels)
        );
    }
}
