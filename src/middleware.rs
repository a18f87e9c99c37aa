// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! Observe the lifecycle of transactions.
//!
//! Middleware registered on a [`Store`](crate::Store) sees every state transition of every
//! transaction run against that store, in registration order. Middleware is a read-only
//! observer: it receives the transaction handle and the state it just entered, and has no way to
//! influence either.
//!
//! The list of middleware is captured when a transaction is created, so registering middleware
//! while transactions are in flight only affects transactions created afterwards.
//!
//! Two implementations ship with the crate. [`LoggingMiddleware`] reports durations through
//! `tracing`, and [`RecordingMiddleware`] records every call in a human readable form, which is
//! mostly useful for tests.
use crate::{Transaction, TransactionState, create_map, id::TransactionId};
use parking_lot::Mutex;
use std::{collections::HashMap, time::Instant};
use tracing::{debug, info};

/// Observes transaction state transitions.
pub trait Middleware: Send + Sync {
    /// Called after `transaction` entered `state`.
    ///
    /// Implementations must not block: this is called on whatever thread drove the transition,
    /// which may be a dispatcher worker.
    fn on_transaction_state_change(&self, transaction: &Transaction, state: TransactionState);
}

impl<F> Middleware for F
where
    F: Fn(&Transaction, TransactionState) + Send + Sync,
{
    fn on_transaction_state_change(&self, transaction: &Transaction, state: TransactionState) {
        self(transaction, state)
    }
}

/// Logs how long each transaction took, from start to its terminal state.
#[derive(Default)]
pub struct LoggingMiddleware {
    started: Mutex<HashMap<TransactionId, Instant, ahash::RandomState>>,
}

impl LoggingMiddleware {
    pub fn new() -> Self {
        Self {
            started: Mutex::new(create_map()),
        }
    }

    /// The number of transactions that started but have not reached a terminal state yet.
    pub fn in_flight(&self) -> usize {
        self.started.lock().len()
    }
}

impl Middleware for LoggingMiddleware {
    fn on_transaction_state_change(&self, transaction: &Transaction, state: TransactionState) {
        let id = transaction.id();
        match state {
            TransactionState::Pending => {
                debug!(transaction = %id, action = %transaction.action_id(), "pending");
            }
            TransactionState::Started => {
                self.started.lock().insert(id, Instant::now());
                debug!(transaction = %id, action = %transaction.action_id(), "started");
            }
            TransactionState::Completed => {
                let started = self.started.lock().remove(&id);
                let elapsed_ms = started.map(|at| at.elapsed().as_secs_f64() * 1000.0);
                info!(
                    transaction = %id,
                    action = %transaction.action_id(),
                    store = %transaction.store_id(),
                    elapsed_ms,
                    "completed"
                );
            }
            TransactionState::Canceled => {
                self.started.lock().remove(&id);
                info!(
                    transaction = %id,
                    action = %transaction.action_id(),
                    store = %transaction.store_id(),
                    "canceled"
                );
            }
        }
    }
}

/// Records every transition as `"<action>: <state>"`.
#[derive(Default)]
pub struct RecordingMiddleware {
    seen: Mutex<Vec<String>>,
}

impl RecordingMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns everything recorded so far.
    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().clone()
    }

    /// Returns and forgets everything recorded so far.
    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.seen.lock())
    }
}

impl Middleware for RecordingMiddleware {
    fn on_transaction_state_change(&self, transaction: &Transaction, state: TransactionState) {
        self.seen
            .lock()
            .push(format!("{}: {state:?}", transaction.action_id()));
    }
}
