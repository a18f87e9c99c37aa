// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! Actions and the context reducers run in.
//!
//! An [`Action`] is a typed intent. When its transaction is scheduled, the action's
//! [`reduce`](Action::reduce) is called with a [`Context`], through which it mutates the store
//! and eventually signals that it is done:
//!
//! ```rust
//! # use reflux::{Context, Dispatcher, Store, Strategy, TransactionState, action};
//! let dispatcher = Dispatcher::new().unwrap();
//! let store = Store::new(&dispatcher, "counter", 0i64);
//!
//! let increase = action("increase", |ctx: Context<i64>| {
//!     if let Err(error) = ctx.reduce_model(|count| *count += 1) {
//!         ctx.reject(error);
//!     }
//!     ctx.fulfill();
//! });
//!
//! let tx = store.run(increase, Strategy::Sync);
//! assert_eq!(tx.state(), TransactionState::Completed);
//! assert_eq!(store.model(), 1);
//! # dispatcher.shutdown();
//! ```
//!
//! Reducers must call [`Context::fulfill`] exactly once on every path, including failures.
//! A transaction whose reducer never fulfills stays Started forever, and so does every
//! transaction queued behind it.
use crate::{
    BatchContext, Model, Store, Transaction,
    batch::BatchError,
    error::Result,
    id::ActionId,
};
use std::{error::Error as StdError, fmt, marker::PhantomData};
use tracing::warn;

/// A typed intent against a store holding an `M`.
pub trait Action<M: Model>: Send + Sync + 'static {
    /// The stable identifier of this action. Throttling and logging key on it.
    fn id(&self) -> ActionId;

    /// Performs the action. Must call [`Context::fulfill`] exactly once.
    fn reduce(&self, context: Context<M>);

    /// Called when the transaction is canceled while the reducer is running.
    ///
    /// Reducers can also poll [`Context::is_canceled`].
    fn cancel(&self, _context: &Context<M>) {}
}

/// An [`Action`] backed by a closure. See [`action`].
pub struct FnAction<M, F> {
    id: ActionId,
    reduce: F,
    _model: PhantomData<fn(M)>,
}

impl<M, F> Action<M> for FnAction<M, F>
where
    M: Model,
    F: Fn(Context<M>) + Send + Sync + 'static,
{
    fn id(&self) -> ActionId {
        self.id.clone()
    }

    fn reduce(&self, context: Context<M>) {
        (self.reduce)(context)
    }
}

impl<M, F> fmt::Debug for FnAction<M, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FnAction").field(&self.id).finish()
    }
}

/// Creates an action from a reducer closure.
pub fn action<M, F>(id: impl Into<ActionId>, reduce: F) -> FnAction<M, F>
where
    M: Model,
    F: Fn(Context<M>) + Send + Sync + 'static,
{
    FnAction {
        id: id.into(),
        reduce,
        _model: PhantomData,
    }
}

/// Creates an action that applies `mutator` to the model and fulfills.
///
/// Failures to mutate are rejected into the transaction's batch, if any.
pub fn mutate<M, F>(id: impl Into<ActionId>, mutator: F) -> impl Action<M>
where
    M: Model,
    F: Fn(&mut M) + Send + Sync + 'static,
{
    action(id, move |ctx: Context<M>| {
        if let Err(error) = ctx.reduce_model(&mutator) {
            ctx.reject(error);
        }
        ctx.fulfill();
    })
}

/// What a reducer gets to work with: its store and its transaction.
pub struct Context<M: Model> {
    store: Store<M>,
    transaction: Transaction,
}

impl<M: Model> Clone for Context<M> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            transaction: self.transaction.clone(),
        }
    }
}

impl<M: Model> Context<M> {
    pub(crate) fn new(store: Store<M>, transaction: Transaction) -> Self {
        Self { store, transaction }
    }

    /// Mutates the store's model.
    ///
    /// The mutator runs on a copy of the model while the store's mutation lock is held; the
    /// copy replaces the model once the mutator returns. Observers are notified after the lock
    /// is released.
    pub fn reduce_model(&self, mutator: impl FnOnce(&mut M)) -> Result<()> {
        self.store
            .update_model(&self.transaction, mutator)
            .inspect_err(|error| {
                warn!(
                    %error,
                    store = %self.store.id(),
                    transaction = %self.transaction.id(),
                    "mutation failed"
                );
            })
    }

    /// Signals that the action is done. Only the first call has an effect.
    pub fn fulfill(&self) {
        self.transaction.fulfill();
    }

    /// Records an error into the transaction's batch. Does not fulfill.
    ///
    /// Outside of a batch there is nobody to report to, and the error is only logged.
    pub fn reject(&self, error: impl Into<Box<dyn StdError + Send + Sync>>) {
        match self.transaction.batch() {
            Some(batch) => batch.reject(error),
            None => {
                let error = error.into();
                warn!(
                    %error,
                    action = %self.transaction.action_id(),
                    transaction = %self.transaction.id(),
                    "rejected outside of a batch"
                );
            }
        }
    }

    /// The most recent error rejected into the transaction's batch.
    pub fn last_error(&self) -> Option<BatchError> {
        self.transaction.batch().and_then(BatchContext::last_error)
    }

    /// Returns true once cancellation of the transaction or its batch was requested.
    pub fn is_canceled(&self) -> bool {
        self.transaction.is_canceled()
    }

    /// A copy of the store's last committed model.
    ///
    /// Inside a mutator this is the model before the mutation.
    pub fn model(&self) -> M {
        self.store.model()
    }

    pub fn store(&self) -> &Store<M> {
        &self.store
    }

    pub fn transaction(&self) -> &Transaction {
        &self.transaction
    }

    pub fn batch(&self) -> Option<&BatchContext> {
        self.transaction.batch()
    }
}

impl<M: Model> fmt::Debug for Context<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("store", self.store.id())
            .field("transaction", &self.transaction)
            .finish()
    }
}
