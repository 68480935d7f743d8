//! Scheduler tree: master/slave nodes mirroring suite → class → method
//! nesting.
//!
//! A node owns a [`Balancer`] and a [`SchedulingStrategy`] and keeps a set of
//! registered slave nodes. Stopping a master cascades depth-first through
//! every registered slave, records which descriptions had started but not
//! finished, and releases all permits so blocked schedulers can observe the
//! stop flag. A slave holds only a weak back-reference to its master, used
//! exclusively to ask "may I still schedule?" — it never extends the
//! master's lifetime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use super::balancer::Balancer;
use super::pool::Job;
use super::strategy::SchedulingStrategy;

/// Descriptions captured at the moment of a cascading stop.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ShutdownResult {
    /// Descriptions that had started (finished or not) before the stop.
    pub executed: Vec<String>,
    /// Descriptions that had started but not finished.
    pub incomplete: Vec<String>,
}

struct SchedulerInner {
    description: Option<String>,
    balancer: Balancer,
    strategy: SchedulingStrategy,
    slaves: RwLock<Vec<Arc<SchedulerInner>>>,
    master: RwLock<Option<Weak<SchedulerInner>>>,
    shutdown: AtomicBool,
    started: AtomicBool,
    finished: AtomicBool,
}

/// One node of the scheduler tree. Cheap to clone; clones share the node.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

/// Releases the balancer permit when the task completes, panicking or not.
struct PermitGuard {
    inner: Arc<SchedulerInner>,
}

impl Drop for PermitGuard {
    fn drop(&mut self) {
        self.inner.balancer.release();
    }
}

impl Scheduler {
    pub fn new(
        description: Option<&str>,
        strategy: SchedulingStrategy,
        balancer: Balancer,
    ) -> Self {
        Scheduler {
            inner: Arc::new(SchedulerInner {
                description: description.map(str::to_string),
                balancer,
                strategy,
                slaves: RwLock::new(Vec::new()),
                master: RwLock::new(None),
                shutdown: AtomicBool::new(false),
                started: AtomicBool::new(false),
                finished: AtomicBool::new(false),
            }),
        }
    }

    /// Register `slave` under this node. Each slave belongs to exactly one
    /// master; re-registration and self-registration are refused.
    pub fn register(&self, slave: &Scheduler) -> bool {
        if Arc::ptr_eq(&self.inner, &slave.inner) {
            return false;
        }
        {
            let mut master = slave.inner.master.write();
            if master.is_some() {
                return false;
            }
            *master = Some(Arc::downgrade(&self.inner));
        }
        self.inner.slaves.write().push(Arc::clone(&slave.inner));
        true
    }

    /// Whether this node (and transitively its master) still admits tasks.
    pub fn can_schedule(&self) -> bool {
        self.inner.can_schedule()
    }

    /// Admit and run one task under this node's concurrency ceiling.
    ///
    /// No-ops once this node or its master has been stopped. Blocks while
    /// the balancer is out of permits. A rejected submission (the underlying
    /// pool shut down externally) triggers the same cascading stop a master
    /// would, and is not surfaced to the caller.
    pub fn schedule<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.can_schedule() || !self.inner.strategy.can_schedule() {
            return;
        }
        if !self.inner.balancer.acquire() {
            // Drained while waiting: stop was requested.
            return;
        }
        if self.inner.shutdown.load(Ordering::SeqCst) {
            self.inner.balancer.release();
            return;
        }
        let guard = PermitGuard {
            inner: Arc::clone(&self.inner),
        };
        let wrapped: Job = Box::new(move || {
            let _guard = guard;
            task();
        });
        self.inner.started.store(true, Ordering::SeqCst);
        if self.inner.strategy.schedule(wrapped).is_err() {
            tracing::debug!(
                description = self.inner.description.as_deref().unwrap_or("<root>"),
                "submission rejected, treating as stop request"
            );
            self.inner.stop(&Collector::default(), false);
        }
    }

    /// Wait for this node's own outstanding tasks (not descendants').
    pub fn finished(&self) {
        self.inner.strategy.finished();
        self.inner.finished.store(true, Ordering::SeqCst);
    }

    /// Stop this node and every registered slave, depth-first.
    ///
    /// With `stop_now`, queued work on private pools is discarded; on shared
    /// pools only not-yet-started tasks are cancelled, since other users may
    /// still be running on the same threads.
    pub fn describe_stopped(&self, stop_now: bool) -> ShutdownResult {
        let collector = Collector::default();
        self.inner.stop(&collector, stop_now);
        collector.into_result()
    }

    /// Master-only teardown: stop the whole tree and destroy every owned
    /// thread pool. No-op on nodes registered under a master.
    pub fn shutdown_pools(&self) {
        if self.inner.master.read().is_some() {
            tracing::warn!("shutdown_pools called on a slave scheduler");
            return;
        }
        self.inner.stop(&Collector::default(), false);
        self.inner.destroy_all();
    }

    #[cfg(test)]
    fn is_shut_down(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }
}

/// Thread-safe accumulators threaded through a cascading stop.
#[derive(Default)]
struct Collector {
    executed: Mutex<Vec<String>>,
    incomplete: Mutex<Vec<String>>,
}

impl Collector {
    fn into_result(self) -> ShutdownResult {
        ShutdownResult {
            executed: self.executed.into_inner(),
            incomplete: self.incomplete.into_inner(),
        }
    }
}

impl SchedulerInner {
    fn can_schedule(&self) -> bool {
        if self.shutdown.load(Ordering::SeqCst) {
            return false;
        }
        match self.master.read().as_ref() {
            None => true,
            // A dangling master means the tree above us is already gone.
            Some(weak) => weak.upgrade().is_some_and(|master| master.can_schedule()),
        }
    }

    fn stop(&self, collector: &Collector, stop_now: bool) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(description) = &self.description {
            if self.started.load(Ordering::SeqCst) {
                collector.executed.lock().push(description.clone());
                if !self.finished.load(Ordering::SeqCst) {
                    collector.incomplete.lock().push(description.clone());
                }
            }
        }
        for slave in self.slaves.read().iter() {
            slave.stop(collector, stop_now);
        }
        self.balancer.release_all();
        if stop_now {
            self.strategy.stop_now();
        } else {
            self.strategy.stop();
        }
    }

    fn destroy_all(&self) {
        self.strategy.destroy();
        for slave in self.slaves.read().iter() {
            slave.destroy_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::pool::ThreadPool;
    use std::sync::atomic::AtomicU32;
    use std::thread;
    use std::time::Duration;

    fn inline_node(name: &str) -> Scheduler {
        Scheduler::new(Some(name), SchedulingStrategy::invoke(), Balancer::Noop)
    }

    #[test]
    fn register_refuses_self_and_second_master() {
        let master = inline_node("master");
        let other = inline_node("other");
        let slave = inline_node("slave");

        assert!(!master.register(&master.clone()));
        assert!(master.register(&slave));
        assert!(!other.register(&slave));
    }

    #[test]
    fn stop_cascades_to_all_slaves() {
        let master = inline_node("master");
        let mut slaves = Vec::new();
        for i in 0..5 {
            let slave = inline_node(&format!("slave-{i}"));
            assert!(master.register(&slave));
            slaves.push(slave);
        }
        // Mark a couple as started to exercise the description capture.
        slaves[0].schedule(|| {});
        slaves[1].schedule(|| {});
        slaves[1].finished();

        let result = master.describe_stopped(false);
        for slave in &slaves {
            assert!(slave.is_shut_down());
            assert!(!slave.can_schedule());
        }
        assert!(result.executed.contains(&"slave-0".to_string()));
        assert!(result.executed.contains(&"slave-1".to_string()));
        assert!(result.incomplete.contains(&"slave-0".to_string()));
        assert!(!result.incomplete.contains(&"slave-1".to_string()));
    }

    #[test]
    fn no_task_admitted_after_stop() {
        let master = inline_node("master");
        let slave = inline_node("slave");
        master.register(&slave);
        master.describe_stopped(true);

        let ran = Arc::new(AtomicU32::new(0));
        let ran_clone = Arc::clone(&ran);
        slave.schedule(move || {
            ran_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn slave_follows_master_schedulability() {
        let master = inline_node("master");
        let slave = inline_node("slave");
        master.register(&slave);
        assert!(slave.can_schedule());
        master.describe_stopped(false);
        assert!(!slave.can_schedule());
    }

    #[test]
    fn externally_shut_pool_triggers_implicit_stop() {
        let pool = Arc::new(ThreadPool::fixed("ext", 2));
        let node = Scheduler::new(
            Some("shared"),
            SchedulingStrategy::shared_pool(Arc::clone(&pool)),
            Balancer::new(2),
        );
        // Someone else owns the pool and shuts it down.
        pool.shutdown();
        node.schedule(|| {});
        assert!(node.is_shut_down());
        assert!(!node.can_schedule());
    }

    #[test]
    fn permits_come_back_after_task_completion() {
        let node = Scheduler::new(
            Some("bounded"),
            SchedulingStrategy::private_pool(ThreadPool::fixed("p", 4)),
            Balancer::new(2),
        );
        let ran = Arc::new(AtomicU32::new(0));
        for _ in 0..8 {
            let ran = Arc::clone(&ran);
            node.schedule(move || {
                thread::sleep(Duration::from_millis(5));
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }
        node.finished();
        assert_eq!(ran.load(Ordering::SeqCst), 8);
    }
}
