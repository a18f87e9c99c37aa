// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! Transactions: one action run against one store.
//!
//! A [`Transaction`] is created by [`Store::run`](crate::Store::run) and friends and handed back
//! to the caller. It moves through its states strictly forward:
//!
//! ```text
//! Pending ──start──► Started ──fulfill──► Completed
//!    │                  │
//!    └──cancel──► Canceled ◄──cancel, then fulfill
//! ```
//!
//! Completed and Canceled are terminal. Every transition is reported to the store's
//! [middleware](crate::Middleware), and reaching a terminal state runs the completion handlers
//! registered with [`on_complete`](Transaction::on_complete).
use crate::{
    BatchContext, Middleware, Operation, Strategy,
    id::{ActionId, StoreId, TransactionId},
};
use parking_lot::{Condvar, Mutex};
use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, error};

/// The lifecycle state of a [`Transaction`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransactionState {
    Pending,
    Started,
    Completed,
    Canceled,
}

impl TransactionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransactionState::Completed | TransactionState::Canceled)
    }

    fn rank(self) -> u8 {
        match self {
            TransactionState::Pending => 0,
            TransactionState::Started => 1,
            TransactionState::Completed | TransactionState::Canceled => 2,
        }
    }
}

type Completion = Box<dyn FnOnce(&Transaction) + Send>;
type CancelHook = Box<dyn FnOnce() + Send>;

/// A handle to one action instance bound to one store.
///
/// Handles are cheap to clone; all clones refer to the same transaction.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<Inner>,
}

struct Inner {
    id: TransactionId,
    action: ActionId,
    store: StoreId,
    strategy: Strategy,
    #[cfg(feature = "chrono")]
    submitted_at: chrono::DateTime<chrono::Utc>,
    lifecycle: Mutex<Lifecycle>,
    settled: Condvar,
    operation: Operation,
    middleware: Vec<Arc<dyn Middleware>>,
    batch: Option<BatchContext>,
    cancel_hook: Mutex<Option<CancelHook>>,
}

struct Lifecycle {
    state: TransactionState,
    completions: Vec<Completion>,
    // Set once the terminal state was reached and every completion handler ran.
    settled: bool,
}

impl Transaction {
    pub(crate) fn new(
        action: ActionId,
        store: StoreId,
        strategy: Strategy,
        middleware: Vec<Arc<dyn Middleware>>,
        batch: Option<BatchContext>,
    ) -> Self {
        if let Some(batch) = &batch {
            batch.enter();
        }
        Self {
            inner: Arc::new(Inner {
                id: TransactionId::generate(),
                action,
                store,
                strategy,
                #[cfg(feature = "chrono")]
                submitted_at: chrono::Utc::now(),
                lifecycle: Mutex::new(Lifecycle {
                    state: TransactionState::Pending,
                    completions: Vec::new(),
                    settled: false,
                }),
                settled: Condvar::new(),
                operation: Operation::new(),
                middleware,
                batch,
                cancel_hook: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.inner.id
    }

    pub fn action_id(&self) -> &ActionId {
        &self.inner.action
    }

    pub fn store_id(&self) -> &StoreId {
        &self.inner.store
    }

    pub fn strategy(&self) -> &Strategy {
        &self.inner.strategy
    }

    /// When the transaction was created.
    #[cfg(feature = "chrono")]
    pub fn submitted_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.inner.submitted_at
    }

    pub fn state(&self) -> TransactionState {
        self.inner.lifecycle.lock().state
    }

    pub fn batch(&self) -> Option<&BatchContext> {
        self.inner.batch.as_ref()
    }

    pub(crate) fn operation(&self) -> &Operation {
        &self.inner.operation
    }

    /// Returns true if cancellation of this transaction, or of its batch, was requested.
    pub fn is_canceled(&self) -> bool {
        self.inner.operation.is_canceled()
            || self.inner.batch.as_ref().is_some_and(BatchContext::is_canceled)
    }

    /// Requests cancellation.
    ///
    /// A pending transaction is canceled right away and will never start. A started transaction
    /// keeps running: the action's cancel hook is invoked, and the transaction ends up Canceled
    /// once its reducer fulfills. Canceling a settled transaction does nothing.
    pub fn cancel(&self) {
        if self.inner.operation.cancel() {
            self.transition(TransactionState::Canceled);
            return;
        }
        let hook = self.inner.cancel_hook.lock().take();
        if let Some(hook) = hook {
            debug!(transaction = %self.id(), action = %self.action_id(), "cancel requested while running");
            hook();
        }
    }

    /// Registers a handler that runs once the transaction reached a terminal state.
    ///
    /// If the transaction already settled, the handler runs immediately on the calling thread.
    /// Otherwise it runs on the thread that settles the transaction.
    pub fn on_complete(&self, completion: impl FnOnce(&Transaction) + Send + 'static) {
        let mut lifecycle = self.inner.lifecycle.lock();
        if lifecycle.settled {
            drop(lifecycle);
            completion(self);
        } else {
            lifecycle.completions.push(Box::new(completion));
        }
    }

    /// Blocks until the transaction settled, and returns its terminal state.
    pub fn wait(&self) -> TransactionState {
        let mut lifecycle = self.inner.lifecycle.lock();
        while !lifecycle.settled {
            self.inner.settled.wait(&mut lifecycle);
        }
        lifecycle.state
    }

    /// Like [`wait`](Transaction::wait), but gives up after `timeout`.
    ///
    /// A timeout too long to represent as a deadline (such as `Duration::MAX`) waits like
    /// [`wait`](Transaction::wait).
    pub fn wait_timeout(&self, timeout: Duration) -> Option<TransactionState> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return Some(self.wait());
        };
        let mut lifecycle = self.inner.lifecycle.lock();
        while !lifecycle.settled {
            if self
                .inner
                .settled
                .wait_until(&mut lifecycle, deadline)
                .timed_out()
            {
                break;
            }
        }
        lifecycle.settled.then_some(lifecycle.state)
    }

    pub(crate) fn set_cancel_hook(&self, hook: impl FnOnce() + Send + 'static) {
        *self.inner.cancel_hook.lock() = Some(Box::new(hook));
    }

    /// Announces the freshly created transaction to middleware.
    pub(crate) fn submitted(&self) {
        debug!(
            transaction = %self.id(),
            action = %self.action_id(),
            store = %self.store_id(),
            strategy = ?self.strategy(),
            "submitted"
        );
        self.notify(TransactionState::Pending);
    }

    /// Starts the operation. Returns false if the transaction must not run.
    pub(crate) fn begin(&self) -> bool {
        if self.inner.batch.as_ref().is_some_and(BatchContext::is_canceled) {
            self.cancel();
        }
        if !self.inner.operation.start() {
            return false;
        }
        self.transition(TransactionState::Started)
    }

    /// Settles a started transaction and finishes its operation.
    pub(crate) fn fulfill(&self) {
        let next = if self.is_canceled() {
            TransactionState::Canceled
        } else {
            TransactionState::Completed
        };
        if !self.transition(next) {
            debug!(transaction = %self.id(), action = %self.action_id(), "fulfilled twice");
        }
        self.inner.operation.finish();
    }

    /// Settles a transaction whose reducer panicked.
    pub(crate) fn abandon(&self) {
        error!(transaction = %self.id(), action = %self.action_id(), "reducer panicked");
        self.transition(TransactionState::Canceled);
        self.inner.operation.finish();
    }

    fn notify(&self, state: TransactionState) {
        for middleware in &self.inner.middleware {
            middleware.on_transaction_state_change(self, state);
        }
    }

    /// Moves to `next` if that is a forward move. Returns false otherwise.
    fn transition(&self, next: TransactionState) -> bool {
        {
            let mut lifecycle = self.inner.lifecycle.lock();
            if next.rank() <= lifecycle.state.rank() {
                return false;
            }
            lifecycle.state = next;
        }
        debug!(transaction = %self.id(), action = %self.action_id(), state = ?next, "transition");
        self.notify(next);

        if next.is_terminal() {
            drop(self.inner.cancel_hook.lock().take());
            self.settle();
            if let Some(batch) = &self.inner.batch {
                batch.leave();
            }
        }
        true
    }

    fn settle(&self) {
        loop {
            let completions = {
                let mut lifecycle = self.inner.lifecycle.lock();
                if lifecycle.completions.is_empty() {
                    lifecycle.settled = true;
                    self.inner.settled.notify_all();
                    return;
                }
                std::mem::take(&mut lifecycle.completions)
            };
            for completion in completions {
                completion(self);
            }
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.inner.id)
            .field("action", &self.inner.action)
            .field("store", &self.inner.store)
            .field("state", &self.state())
            .finish()
    }
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Transaction {}
