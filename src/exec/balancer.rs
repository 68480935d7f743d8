//! Permit-based admission control for scheduler nodes.
//!
//! A [`Balancer`] bounds how many tasks a scheduler may have in flight at
//! once. Acquisition blocks; [`Balancer::release_all`] is the shutdown hatch
//! that unblocks every waiter so it can observe the scheduler's stop flag.

use parking_lot::{Condvar, Mutex};

/// Counting permit pool, optionally FIFO-fair.
///
/// An unbounded configuration (zero or `usize::MAX` permits) degenerates to a
/// pass-through that never blocks.
#[derive(Debug)]
pub enum Balancer {
    /// Pass-through: every acquire succeeds immediately.
    Noop,
    /// Bounded pool of permits.
    Counting(CountingBalancer),
}

impl Balancer {
    /// Balancer with the given ceiling; `0` and `usize::MAX` mean unbounded.
    pub fn new(permits: usize) -> Self {
        Self::build(permits, false)
    }

    /// FIFO-fair variant: waiters acquire in arrival order.
    pub fn new_fair(permits: usize) -> Self {
        Self::build(permits, true)
    }

    fn build(permits: usize, fair: bool) -> Self {
        if permits == 0 || permits == usize::MAX {
            Balancer::Noop
        } else {
            Balancer::Counting(CountingBalancer::new(permits, fair))
        }
    }

    /// Blocks until a permit is free. Returns `false` when the balancer was
    /// drained by [`release_all`](Balancer::release_all), which callers must
    /// treat as "stop requested", never as success.
    #[must_use]
    pub fn acquire(&self) -> bool {
        match self {
            Balancer::Noop => true,
            Balancer::Counting(inner) => inner.acquire(),
        }
    }

    /// Returns one permit to the pool.
    pub fn release(&self) {
        if let Balancer::Counting(inner) = self {
            inner.release();
        }
    }

    /// Unblocks every waiter and makes all future acquires fail fast.
    /// Only used during forced shutdown.
    pub fn release_all(&self) {
        if let Balancer::Counting(inner) = self {
            inner.release_all();
        }
    }

    /// Configured ceiling, `None` for the pass-through.
    pub fn ceiling(&self) -> Option<usize> {
        match self {
            Balancer::Noop => None,
            Balancer::Counting(inner) => Some(inner.max),
        }
    }
}

#[derive(Debug)]
pub struct CountingBalancer {
    max: usize,
    state: Mutex<State>,
    cond: Condvar,
    fair: bool,
}

#[derive(Debug)]
struct State {
    available: usize,
    /// Next ticket to hand out (fair mode).
    next_ticket: u64,
    /// Ticket currently allowed to take a permit (fair mode).
    now_serving: u64,
    drained: bool,
}

impl CountingBalancer {
    fn new(max: usize, fair: bool) -> Self {
        CountingBalancer {
            max,
            state: Mutex::new(State {
                available: max,
                next_ticket: 0,
                now_serving: 0,
                drained: false,
            }),
            cond: Condvar::new(),
            fair,
        }
    }

    fn acquire(&self) -> bool {
        let mut state = self.state.lock();
        if self.fair {
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            while !state.drained && (state.available == 0 || state.now_serving != ticket) {
                self.cond.wait(&mut state);
            }
            if state.drained {
                // Let the tickets behind us through as well.
                self.cond.notify_all();
                return false;
            }
            state.available -= 1;
            state.now_serving += 1;
            self.cond.notify_all();
            true
        } else {
            while !state.drained && state.available == 0 {
                self.cond.wait(&mut state);
            }
            if state.drained {
                return false;
            }
            state.available -= 1;
            true
        }
    }

    fn release(&self) {
        let mut state = self.state.lock();
        if !state.drained && state.available < self.max {
            state.available += 1;
        }
        drop(state);
        self.cond.notify_all();
    }

    fn release_all(&self) {
        let mut state = self.state.lock();
        state.drained = true;
        state.available = self.max;
        drop(state);
        self.cond.notify_all();
    }
}
