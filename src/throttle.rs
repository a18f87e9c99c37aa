// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! Collapse bursts of requests into one execution per time window.
//!
//! The [`Throttler`] keeps, per [`ActionId`], the instant the id last ran and at most one
//! pending request. A new request for an id always replaces the pending one (whose cancellation
//! callback runs). The request then either fires right away, if at least the minimum delay
//! passed since the id last ran, or is scheduled to fire once it has. An id that never ran
//! opens its window with its first request.
//!
//! Delayed requests fire on a single timer thread, so the execution callbacks should hand
//! heavy work off rather than run it inline.
use crate::{
    error::{Error, Result},
    id::ActionId,
};
use parking_lot::{Condvar, Mutex};
use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tracing::{debug, trace};

/// How a throttled request ended up firing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fired {
    /// On the requesting thread, from within [`Throttler::throttle`].
    Immediately,
    /// On the timer thread, once the window elapsed.
    AfterDelay,
}

type Execution = Box<dyn FnOnce(Fired) + Send>;
type Cancellation = Box<dyn FnOnce() + Send>;

struct Pending {
    ticket: u64,
    execution: Execution,
    cancellation: Cancellation,
}

struct Entry {
    window_start: Instant,
    last_run: Option<Instant>,
    pending: Option<Pending>,
}

#[derive(Default)]
struct State {
    entries: HashMap<ActionId, Entry, ahash::RandomState>,
    deadlines: BinaryHeap<Reverse<(Instant, u64, ActionId)>>,
    next_ticket: u64,
    shutdown: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    wake: Condvar,
}

/// Per-action-id throttling with a single timer thread.
pub struct Throttler {
    shared: Arc<Shared>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl Throttler {
    /// Creates a throttler whose timer thread is called `thread_name`.
    pub fn new(thread_name: impl Into<String>) -> Result<Self> {
        let shared = Arc::new(Shared::default());
        let timer = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(thread_name.into())
                .spawn(move || run_timer(&shared))
                .map_err(Error::Spawn)?
        };
        Ok(Self {
            shared,
            timer: Mutex::new(Some(timer)),
        })
    }

    /// Requests `execution` for `id`, at most once per `minimum_delay`.
    ///
    /// A request still waiting for `id` is dropped and its cancellation runs, on this thread.
    /// If the id's window already elapsed (or `minimum_delay` is zero), `execution` runs on this
    /// thread before `throttle` returns. Otherwise it runs on the timer thread when the window
    /// elapses, unless a newer request replaces it first.
    pub fn throttle(
        &self,
        id: ActionId,
        minimum_delay: Duration,
        execution: impl FnOnce(Fired) + Send + 'static,
        cancellation: impl FnOnce() + Send + 'static,
    ) {
        let now = Instant::now();
        let (superseded, fire_now) = {
            let mut guard = self.shared.state.lock();
            if guard.shutdown {
                drop(guard);
                debug!(action = %id, "throttler shut down; canceling request");
                cancellation();
                return;
            }
            let state = &mut *guard;

            let entry = state.entries.entry(id.clone()).or_insert_with(|| Entry {
                window_start: now,
                last_run: None,
                pending: None,
            });
            let superseded = entry.pending.take();
            let reference = entry.last_run.unwrap_or(entry.window_start);

            if minimum_delay.is_zero() || now.saturating_duration_since(reference) >= minimum_delay {
                entry.last_run = Some(now);
                (superseded, Some(execution))
            } else {
                let ticket = state.next_ticket;
                state.next_ticket += 1;
                entry.pending = Some(Pending {
                    ticket,
                    execution: Box::new(execution),
                    cancellation: Box::new(cancellation),
                });
                // A window too long to represent never elapses: the request waits until it is
                // superseded, canceled or shut down.
                match reference.checked_add(minimum_delay) {
                    Some(deadline) => {
                        state.deadlines.push(Reverse((deadline, ticket, id.clone())));
                        self.shared.wake.notify_one();
                        trace!(
                            action = %id,
                            delay_ms = deadline.saturating_duration_since(now).as_millis() as u64,
                            "request deferred"
                        );
                    }
                    None => trace!(action = %id, "request deferred indefinitely"),
                }
                (superseded, None)
            }
        };

        if let Some(superseded) = superseded {
            debug!(action = %id, "superseded throttled request");
            (superseded.cancellation)();
        }
        if let Some(execution) = fire_now {
            execution(Fired::Immediately);
        }
    }

    /// Drops the pending request for `id`, if any, running its cancellation.
    ///
    /// Returns true if there was one.
    pub fn cancel(&self, id: &ActionId) -> bool {
        let pending = self
            .shared
            .state
            .lock()
            .entries
            .get_mut(id)
            .and_then(|entry| entry.pending.take());
        match pending {
            Some(pending) => {
                (pending.cancellation)();
                true
            }
            None => false,
        }
    }

    /// Returns true if a request for `id` is waiting for its window to elapse.
    pub fn is_pending(&self, id: &ActionId) -> bool {
        self.shared
            .state
            .lock()
            .entries
            .get(id)
            .is_some_and(|entry| entry.pending.is_some())
    }

    /// Cancels every pending request and stops the timer thread. Later requests are canceled
    /// right away.
    pub fn shutdown(&self) {
        let pending: Vec<Pending> = {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            state.deadlines.clear();
            self.shared.wake.notify_all();
            state
                .entries
                .values_mut()
                .filter_map(|entry| entry.pending.take())
                .collect()
        };
        for pending in pending {
            (pending.cancellation)();
        }
        let timer = self.timer.lock().take();
        if let Some(timer) = timer {
            if timer.thread().id() != thread::current().id() && timer.join().is_err() {
                tracing::error!("throttle timer panicked");
            }
        }
    }
}

impl Drop for Throttler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_timer(shared: &Shared) {
    let mut state = shared.state.lock();
    loop {
        if state.shutdown {
            return;
        }
        let next = state
            .deadlines
            .peek()
            .map(|Reverse((deadline, ticket, _))| (*deadline, *ticket));
        let Some((deadline, ticket)) = next else {
            shared.wake.wait(&mut state);
            continue;
        };
        let now = Instant::now();
        if now < deadline {
            shared.wake.wait_until(&mut state, deadline);
            continue;
        }

        let Some(Reverse((_, _, id))) = state.deadlines.pop() else {
            continue;
        };
        // Superseded or canceled requests leave stale heap entries behind.
        let due = state.entries.get_mut(&id).and_then(|entry| {
            if entry.pending.as_ref().is_some_and(|p| p.ticket == ticket) {
                entry.last_run = Some(now);
                entry.pending.take()
            } else {
                None
            }
        });
        if let Some(due) = due {
            debug!(action = %id, "firing throttled request");
            drop(due.cancellation);
            let execution = due.execution;
            parking_lot::MutexGuard::unlocked(&mut state, || execution(Fired::AfterDelay));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc,
    };

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    #[test]
    fn zero_delay_fires_immediately() {
        let throttler = Throttler::new("test-throttle").unwrap();
        let fired = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..3 {
            let fired = Arc::clone(&fired);
            throttler.throttle(
                "id".into(),
                Duration::ZERO,
                move |how| fired.lock().push(how),
                || panic!("nothing to cancel"),
            );
        }
        assert_eq!(*fired.lock(), [Fired::Immediately; 3]);
    }

    #[test]
    fn burst_collapses_to_last_request() {
        let throttler = Throttler::new("test-throttle").unwrap();
        let canceled = counter();
        let (tx, rx) = mpsc::channel();

        for i in 0..5 {
            let tx = tx.clone();
            let canceled = Arc::clone(&canceled);
            throttler.throttle(
                "burst".into(),
                Duration::from_millis(50),
                move |how| tx.send((i, how)).unwrap(),
                move || {
                    canceled.fetch_add(1, Ordering::SeqCst);
                },
            );
        }
        assert!(throttler.is_pending(&"burst".into()));

        let (which, how) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!((which, how), (4, Fired::AfterDelay));
        assert_eq!(canceled.load(Ordering::SeqCst), 4);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert!(!throttler.is_pending(&"burst".into()));
    }

    #[test]
    fn elapsed_window_fires_immediately() {
        let throttler = Throttler::new("test-throttle").unwrap();
        let (tx, rx) = mpsc::channel();
        {
            let tx = tx.clone();
            throttler.throttle("id".into(), Duration::from_millis(20), move |how| tx.send(how).unwrap(), || {});
        }
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Fired::AfterDelay);

        thread::sleep(Duration::from_millis(40));
        throttler.throttle("id".into(), Duration::from_millis(20), move |how| tx.send(how).unwrap(), || {});
        assert_eq!(rx.try_recv().unwrap(), Fired::Immediately);
    }

    #[test]
    fn ids_are_independent() {
        let throttler = Throttler::new("test-throttle").unwrap();
        let (tx, rx) = mpsc::channel();
        for id in ["a", "b"] {
            let tx = tx.clone();
            throttler.throttle(id.into(), Duration::from_millis(20), move |_| tx.send(id).unwrap(), || {});
        }
        let mut fired = vec![
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        ];
        fired.sort();
        assert_eq!(fired, ["a", "b"]);
    }

    #[test]
    fn unrepresentable_window_waits_until_superseded() {
        let throttler = Throttler::new("test-throttle").unwrap();
        let canceled = counter();
        {
            let canceled = Arc::clone(&canceled);
            throttler.throttle(
                "forever".into(),
                Duration::MAX,
                |_| panic!("must not fire"),
                move || {
                    canceled.fetch_add(1, Ordering::SeqCst);
                },
            );
        }
        assert!(throttler.is_pending(&"forever".into()));

        let (tx, rx) = mpsc::channel();
        throttler.throttle(
            "forever".into(),
            Duration::ZERO,
            move |how| tx.send(how).unwrap(),
            || panic!("nothing to cancel"),
        );
        assert_eq!(canceled.load(Ordering::SeqCst), 1);
        assert_eq!(rx.try_recv().unwrap(), Fired::Immediately);
        assert!(!throttler.is_pending(&"forever".into()));
    }

    #[test]
    fn cancel_and_shutdown_run_cancellations() {
        let throttler = Throttler::new("test-throttle").unwrap();
        let canceled = counter();
        for id in ["a", "b"] {
            let canceled = Arc::clone(&canceled);
            throttler.throttle(
                id.into(),
                Duration::from_secs(60),
                |_| panic!("must not fire"),
                move || {
                    canceled.fetch_add(1, Ordering::SeqCst);
                },
            );
        }
        assert!(throttler.cancel(&"a".into()));
        assert!(!throttler.cancel(&"a".into()));
        assert_eq!(canceled.load(Ordering::SeqCst), 1);

        throttler.shutdown();
        assert_eq!(canceled.load(Ordering::SeqCst), 2);

        let late = Arc::clone(&canceled);
        throttler.throttle("c".into(), Duration::ZERO, |_| panic!("shut down"), move || {
            late.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(canceled.load(Ordering::SeqCst), 3);
    }
}
