//! How a scheduler node turns an admitted task into running code.
//!
//! The three variants form a closed set with a fixed capability surface:
//! schedule, finished, stop, stop_now, disable, has_shared_pool, destroy.
//! *Invoke* runs the task on the calling thread. *Private* owns a pool and
//! tears it down when done. *Shared* borrows a pool owned by someone else:
//! its `finished` waits only for tasks this strategy submitted, and it never
//! shuts the pool down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use super::pool::{Job, Rejected, ThreadPool};

/// Counts this strategy's in-flight tasks so `finished` can drain only its
/// own work on a pool used by many.
#[derive(Default)]
struct TaskLatch {
    count: Mutex<usize>,
    cond: Condvar,
}

impl TaskLatch {
    fn add(&self) {
        *self.count.lock() += 1;
    }

    fn done(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.cond.notify_all();
        }
    }

    fn wait_idle(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.cond.wait(&mut count);
        }
    }
}

/// State of the invoke-inline variant.
pub struct InvokeState {
    disabled: AtomicBool,
}

/// State of the private-pool variant.
pub struct PrivateState {
    pool: ThreadPool,
    disabled: AtomicBool,
    latch: Arc<TaskLatch>,
}

/// State of the shared-pool variant.
pub struct SharedState {
    pool: Arc<ThreadPool>,
    disabled: AtomicBool,
    /// Raised by stop: queued-but-not-started tasks become no-ops.
    cancelled: Arc<AtomicBool>,
    latch: Arc<TaskLatch>,
}

/// Closed set of scheduling strategies.
pub enum SchedulingStrategy {
    /// Run each task synchronously on the scheduling thread.
    Invoke(InvokeState),
    /// Own a pool exclusively; shut it down when this node is done.
    Private(PrivateState),
    /// Borrow a pool owned elsewhere; never shut it down.
    Shared(SharedState),
}

impl SchedulingStrategy {
    pub fn invoke() -> Self {
        SchedulingStrategy::Invoke(InvokeState {
            disabled: AtomicBool::new(false),
        })
    }

    pub fn private_pool(pool: ThreadPool) -> Self {
        SchedulingStrategy::Private(PrivateState {
            pool,
            disabled: AtomicBool::new(false),
            latch: Arc::new(TaskLatch::default()),
        })
    }

    pub fn shared_pool(pool: Arc<ThreadPool>) -> Self {
        SchedulingStrategy::Shared(SharedState {
            pool,
            disabled: AtomicBool::new(false),
            cancelled: Arc::new(AtomicBool::new(false)),
            latch: Arc::new(TaskLatch::default()),
        })
    }

    /// Whether new tasks may still be handed to [`schedule`](Self::schedule).
    pub fn can_schedule(&self) -> bool {
        !self.disabled_flag().load(Ordering::SeqCst)
    }

    /// Atomically stop accepting new tasks.
    pub fn disable(&self) {
        self.disabled_flag().store(true, Ordering::SeqCst);
    }

    /// Run or enqueue one task.
    pub fn schedule(&self, task: Job) -> Result<(), Rejected> {
        match self {
            SchedulingStrategy::Invoke(_) => {
                task();
                Ok(())
            }
            SchedulingStrategy::Private(state) => {
                state.latch.add();
                let latch = Arc::clone(&state.latch);
                let result = state.pool.submit(Box::new(move || {
                    task();
                    latch.done();
                }));
                if result.is_err() {
                    // Never submitted, so it will never call done().
                    state.latch.done();
                }
                result
            }
            SchedulingStrategy::Shared(state) => {
                state.latch.add();
                let latch = Arc::clone(&state.latch);
                let cancelled = Arc::clone(&state.cancelled);
                let result = state.pool.submit(Box::new(move || {
                    // A stopped strategy lets queued tasks fall through; the
                    // shared pool keeps serving its other users.
                    if !cancelled.load(Ordering::SeqCst) {
                        task();
                    }
                    latch.done();
                }));
                if result.is_err() {
                    state.latch.done();
                }
                result
            }
        }
    }

    /// Wait until every task this strategy submitted has completed. New
    /// tasks are not prevented; callers stop scheduling first.
    pub fn finished(&self) {
        match self {
            SchedulingStrategy::Invoke(_) => {}
            SchedulingStrategy::Private(state) => state.latch.wait_idle(),
            SchedulingStrategy::Shared(state) => state.latch.wait_idle(),
        }
    }

    /// Graceful stop: reject new work, let admitted work finish. On a shared
    /// pool, queued-but-unstarted tasks of this strategy are cancelled.
    /// Returns `false` if the strategy was already stopped.
    pub fn stop(&self) -> bool {
        let was_enabled = !self.disabled_flag().swap(true, Ordering::SeqCst);
        match self {
            SchedulingStrategy::Invoke(_) => {}
            SchedulingStrategy::Private(state) => state.pool.shutdown(),
            SchedulingStrategy::Shared(state) => {
                state.cancelled.store(true, Ordering::SeqCst);
            }
        }
        was_enabled
    }

    /// Forced stop: additionally discard queued work on a private pool.
    /// Running tasks are never interrupted on a shared pool.
    pub fn stop_now(&self) -> bool {
        let was_enabled = !self.disabled_flag().swap(true, Ordering::SeqCst);
        match self {
            SchedulingStrategy::Invoke(_) => {}
            SchedulingStrategy::Private(state) => {
                let discarded = state.pool.shutdown_now();
                // Discarded jobs can no longer report completion themselves.
                for _ in 0..discarded {
                    state.latch.done();
                }
            }
            SchedulingStrategy::Shared(state) => {
                state.cancelled.store(true, Ordering::SeqCst);
            }
        }
        was_enabled
    }

    /// Whether this strategy schedules onto a pool it does not own.
    pub fn has_shared_pool(&self) -> bool {
        matches!(self, SchedulingStrategy::Shared(_))
    }

    /// Tear down owned resources. A shared pool is left running for its
    /// other users.
    pub fn destroy(&self) {
        if let SchedulingStrategy::Private(state) = self {
            state.pool.shutdown();
            state.pool.join();
        }
    }

    fn disabled_flag(&self) -> &AtomicBool {
        match self {
            SchedulingStrategy::Invoke(state) => &state.disabled,
            SchedulingStrategy::Private(state) => &state.disabled,
            SchedulingStrategy::Shared(state) => &state.disabled,
        }
    }
}
