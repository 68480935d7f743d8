//! Worker thread pool backing the scheduling strategies.
//!
//! Jobs travel through a `crossbeam-channel` queue to a set of OS threads.
//! A fixed pool keeps exactly `n` workers; a growable pool spawns another
//! worker whenever a job arrives and nobody is idle, which is the unbounded
//! "grows to the number of ready tasks" shape the planner produces for
//! unlimited levels.
//!
//! Shutdown is cooperative: Rust cannot interrupt a running thread, so
//! [`ThreadPool::shutdown_now`] discards queued jobs and lets running ones
//! finish, which is exactly the cancellation §shared-pool rule requires.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use thiserror::Error;

/// A job submitted to the pool.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Submission failed because the pool stopped accepting work.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("thread pool is shut down")]
pub struct Rejected;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolKind {
    Fixed,
    Growable,
}

struct PoolShared {
    receiver: Receiver<Job>,
    idle: AtomicUsize,
    shut_down: AtomicBool,
}

/// Thread pool with graceful and forced shutdown.
pub struct ThreadPool {
    name: String,
    kind: PoolKind,
    sender: Mutex<Option<Sender<Job>>>,
    shared: Arc<PoolShared>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl ThreadPool {
    /// Pool with exactly `threads` workers, all started eagerly.
    pub fn fixed(name: &str, threads: usize) -> Self {
        let pool = Self::build(name, PoolKind::Fixed);
        for _ in 0..threads.max(1) {
            pool.spawn_worker();
        }
        pool
    }

    /// Pool that grows by one worker whenever a job arrives with no idle
    /// worker to take it.
    pub fn growable(name: &str) -> Self {
        Self::build(name, PoolKind::Growable)
    }

    fn build(name: &str, kind: PoolKind) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        ThreadPool {
            name: name.to_string(),
            kind,
            sender: Mutex::new(Some(sender)),
            shared: Arc::new(PoolShared {
                receiver,
                idle: AtomicUsize::new(0),
                shut_down: AtomicBool::new(false),
            }),
            handles: Mutex::new(Vec::new()),
        }
    }

    fn spawn_worker(&self) {
        let shared = Arc::clone(&self.shared);
        let builder = thread::Builder::new().name(format!("{}-worker", self.name));
        let handle = builder.spawn(move || {
            loop {
                shared.idle.fetch_add(1, Ordering::SeqCst);
                let job = shared.receiver.recv();
                shared.idle.fetch_sub(1, Ordering::SeqCst);
                match job {
                    Ok(job) => {
                        let run = std::panic::catch_unwind(std::panic::AssertUnwindSafe(job));
                        if run.is_err() {
                            tracing::error!("pool job panicked");
                        }
                    }
                    // All senders gone: queue drained, worker retires.
                    Err(_) => break,
                }
            }
        });
        match handle {
            Ok(handle) => self.handles.lock().push(handle),
            Err(e) => tracing::error!(pool = %self.name, error = %e, "failed to spawn pool worker"),
        }
    }

    /// Submit a job. Fails once the pool has begun shutting down.
    pub fn submit(&self, job: Job) -> Result<(), Rejected> {
        if self.shared.shut_down.load(Ordering::SeqCst) {
            return Err(Rejected);
        }
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return Err(Rejected);
        };
        if self.kind == PoolKind::Growable && self.shared.idle.load(Ordering::SeqCst) == 0 {
            self.spawn_worker();
        }
        sender.send(job).map_err(|_| Rejected)
    }

    /// Stop accepting work; queued and running jobs still complete.
    pub fn shutdown(&self) {
        self.shared.shut_down.store(true, Ordering::SeqCst);
        // Dropping the sender lets workers drain the queue and retire.
        self.sender.lock().take();
    }

    /// Stop accepting work and discard everything still queued. Running jobs
    /// finish; returns the number of jobs that never started.
    pub fn shutdown_now(&self) -> usize {
        self.shutdown();
        let mut discarded = 0;
        while self.shared.receiver.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            tracing::debug!(pool = %self.name, discarded, "discarded queued jobs");
        }
        discarded
    }

    /// Wait for every worker thread to retire. Call after a shutdown.
    pub fn join(&self) {
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!(pool = %self.name, "pool worker panicked");
            }
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shut_down.load(Ordering::SeqCst)
    }
}
