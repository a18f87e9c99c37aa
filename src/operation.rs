// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! The unit of work behind every transaction.
use parking_lot::{Condvar, Mutex};
use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::{Duration, Instant},
};

/// Where an [`Operation`] is in its life.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperationState {
    NotStarted,
    Executing,
    Finished,
}

/// A cooperative unit of work.
///
/// An operation is started at most once and finished at most once. Finishing is idempotent:
/// every path through a run (success, rejection, cancellation, panic) calls
/// [`finish`](Operation::finish), and only the first call has an effect. Waiters blocked in
/// [`wait`](Operation::wait) are released on finish.
///
/// Cancellation is advisory. Canceling an operation that has not started yet prevents it from
/// ever starting; canceling an executing operation only raises the flag, which the work is
/// expected to poll.
#[derive(Debug)]
pub struct Operation {
    state: Mutex<OperationState>,
    finished: Condvar,
    canceled: AtomicBool,
}

impl Default for Operation {
    fn default() -> Self {
        Self::new()
    }
}

impl Operation {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(OperationState::NotStarted),
            finished: Condvar::new(),
            canceled: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> OperationState {
        *self.state.lock()
    }

    /// Moves from `NotStarted` to `Executing`.
    ///
    /// Returns false, and leaves the state untouched, if the operation was canceled or has
    /// already been started.
    pub fn start(&self) -> bool {
        let mut state = self.state.lock();
        if *state != OperationState::NotStarted || self.is_canceled() {
            return false;
        }
        *state = OperationState::Executing;
        true
    }

    /// Marks the operation finished and wakes all waiters. Subsequent calls do nothing.
    ///
    /// Returns true for the call that actually finished the operation.
    pub fn finish(&self) -> bool {
        let mut state = self.state.lock();
        if *state == OperationState::Finished {
            return false;
        }
        *state = OperationState::Finished;
        self.finished.notify_all();
        true
    }

    /// Requests cancellation.
    ///
    /// An operation that has not started is finished right away, and true is returned. An
    /// executing operation keeps running with the flag raised.
    pub fn cancel(&self) -> bool {
        let mut state = self.state.lock();
        self.canceled.store(true, Ordering::Release);
        if *state != OperationState::NotStarted {
            return false;
        }
        *state = OperationState::Finished;
        self.finished.notify_all();
        true
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.state() == OperationState::Finished
    }

    /// Blocks until the operation is finished.
    pub fn wait(&self) {
        let mut state = self.state.lock();
        while *state != OperationState::Finished {
            self.finished.wait(&mut state);
        }
    }

    /// Blocks until the operation is finished or `timeout` elapsed. Returns true if finished.
    ///
    /// A timeout too long to represent as a deadline waits without one.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            self.wait();
            return true;
        };
        let mut state = self.state.lock();
        while *state != OperationState::Finished {
            if self.finished.wait_until(&mut state, deadline).timed_out() {
                return *state == OperationState::Finished;
            }
        }
        true
    }
}
