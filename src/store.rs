// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! Stores: named containers of application state.
//!
//! A [`Store`] owns a model and is the only place it changes. Changes are requested by running
//! [actions](crate::Action); each run creates a [`Transaction`] that the dispatcher schedules
//! according to its [`Strategy`]. When the action's reducer mutates the model, the store
//!
//! 1. takes its mutation lock,
//! 2. applies the mutator to a copy of the model and replaces the model with it,
//! 3. snapshots the new model and diffs it against the previous snapshot,
//! 4. brings its child stores up to date,
//! 5. releases the lock and notifies observers.
//!
//! At most one mutation of a store is in flight at any time. Mutating a store from inside one of
//! its own mutators is detected and refused with [`Error::ReentrantMutation`].
//!
//! # Child stores
//!
//! [`Store::make_child`] creates a store whose model is a [`Lens`] view into its parent's. The
//! child knows its parent only by id and finds it through the dispatcher's registry, so children
//! never keep their parents alive. Mutating a child is a single mutation of the parent (the
//! child's view is read, mutated and written back under the parent's lock), and parent and
//! child observers both see it. A child whose view did not change is not notified of its
//! parent's mutations.
//!
//! # Observers
//!
//! Change observers receive a [`Change`] per mutation; diff observers receive a [`DiffEvent`].
//! Where they run is configured per store with [`StoreOptions`]:
//!
//! | | runs on |
//! |---|---|
//! | change observers, [`Delivery::MainThread`] | the dispatcher's main context |
//! | change observers, [`Delivery::Inline`] | the mutating thread, after the lock is released |
//! | diff observers, [`DiffingMode::Sync`] | the mutating thread, after the lock is released |
//! | diff observers, [`DiffingMode::Async`] | the dispatcher's diff queue |
//!
//! Deliveries to a queue are enqueued while the mutation lock is held, so observers always see
//! mutations in the order they were committed.
use crate::{
    Action, Context, Diff, DiffingMode, Dispatcher, Lens, Middleware, Snapshot, Strategy,
    Transaction,
    action::action,
    batch::{self, BatchContext},
    error::{Error, Result},
    executor::Task,
    id::{ActionId, StoreId, TransactionId},
    throttle::Fired,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::{
    any::Any,
    cell::RefCell,
    collections::HashMap,
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tracing::{debug, warn};

/// What a store can hold.
///
/// Models are copied on every mutation and serialized to take snapshots.
pub trait Model: Clone + Serialize + Send + Sync + 'static {}

impl<T> Model for T where T: Clone + Serialize + Send + Sync + 'static {}

/// Where change observers run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Delivery {
    /// On the dispatcher's main context.
    #[default]
    MainThread,
    /// On the thread that committed the mutation, right after the mutation lock is released.
    Inline,
}

/// Per-store settings.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StoreOptions {
    pub diffing: DiffingMode,
    pub delivery: Delivery,
}

impl StoreOptions {
    pub fn with_diffing(mut self, diffing: DiffingMode) -> Self {
        self.diffing = diffing;
        self
    }

    pub fn with_delivery(mut self, delivery: Delivery) -> Self {
        self.delivery = delivery;
        self
    }
}

/// How to run an action.
#[derive(Clone, Debug, Default)]
pub struct RunOptions {
    pub strategy: Strategy,
    /// Collapse runs of the same action id into at most one per this window.
    pub throttle: Option<Duration>,
    /// The batch to join. Defaults to the batch being built on the calling thread, if any.
    pub batch: Option<BatchContext>,
}

impl RunOptions {
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            ..Self::default()
        }
    }

    pub fn with_throttle(mut self, minimum_delay: Duration) -> Self {
        self.throttle = Some(minimum_delay);
        self
    }

    pub fn with_batch(mut self, batch: &BatchContext) -> Self {
        self.batch = Some(batch.clone());
        self
    }
}

impl From<Strategy> for RunOptions {
    fn from(strategy: Strategy) -> Self {
        Self::new(strategy)
    }
}

/// One committed mutation, as seen by a change observer.
pub struct Change<M> {
    /// The store the observer is registered on.
    pub store: StoreId,
    /// The store's model after the mutation.
    pub model: Arc<M>,
    /// The transaction that mutated. For child stores this may be a transaction of an ancestor.
    pub transaction: Transaction,
    /// Counts the mutations this store observed.
    pub generation: u64,
    /// The diff against the previous snapshot, unless diffing is disabled.
    pub diff: Option<Arc<Diff>>,
}

impl<M> Clone for Change<M> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            model: Arc::clone(&self.model),
            transaction: self.transaction.clone(),
            generation: self.generation,
            diff: self.diff.clone(),
        }
    }
}

impl<M: fmt::Debug> fmt::Debug for Change<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Change")
            .field("store", &self.store)
            .field("generation", &self.generation)
            .field("transaction", &self.transaction.id())
            .field("model", &self.model)
            .finish()
    }
}

/// One committed mutation, as seen by a diff observer.
#[derive(Clone, Debug)]
pub struct DiffEvent {
    pub store: StoreId,
    pub transaction: TransactionId,
    pub action: ActionId,
    pub generation: u64,
    pub diff: Arc<Diff>,
    /// The snapshot the diff leads to.
    pub snapshot: Arc<Snapshot>,
}

/// Identifies an observer registration, see [`Store::unobserve`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObserverToken(u64);

type Observer<M> = Arc<dyn Fn(&Change<M>) + Send + Sync>;
type DiffObserver = Arc<dyn Fn(&DiffEvent) + Send + Sync>;
// Returns false once the child is gone.
type ChildHook<M> = Box<dyn Fn(&M, &Transaction, &mut Publication) -> bool + Send + Sync>;

struct ChildLink<M> {
    child: Weak<dyn Any + Send + Sync>,
    update: ChildHook<M>,
}
type ParentWrite<M> =
    Box<dyn Fn(&Transaction, &mut dyn FnMut(&mut M), &mut Publication) -> Result<()> + Send + Sync>;

/// Deliveries that run on the mutating thread once every lock is released.
#[derive(Default)]
pub(crate) struct Publication {
    inline: Vec<Box<dyn FnOnce() + Send>>,
}

impl Publication {
    fn deliver(self) {
        for delivery in self.inline {
            delivery();
        }
    }
}

#[derive(Clone)]
struct State<M> {
    model: Arc<M>,
    snapshot: Arc<Snapshot>,
    generation: u64,
}

struct ParentLink<M> {
    id: StoreId,
    write: ParentWrite<M>,
}

/// A handle to a store. Cheap to clone.
pub struct Store<M: Model> {
    inner: Arc<StoreInner<M>>,
}

pub(crate) struct StoreInner<M: Model> {
    id: StoreId,
    dispatcher: Dispatcher,
    options: StoreOptions,
    parent: Option<ParentLink<M>>,
    // The mutation lock of a root store. Child stores keep their current view here, written
    // under their root's mutation lock.
    state: Mutex<State<M>>,
    // The last committed state, readable without the mutation lock so mutators can read
    // their own store. Written only with `state` held.
    published: RwLock<State<M>>,
    reducers: RwLock<HashMap<ActionId, Arc<dyn Action<M>>, ahash::RandomState>>,
    observers: Mutex<Vec<(ObserverToken, Observer<M>)>>,
    diff_observers: Mutex<Vec<(ObserverToken, DiffObserver)>>,
    middleware: RwLock<Vec<Arc<dyn Middleware>>>,
    children: Mutex<Vec<ChildLink<M>>>,
    next_token: AtomicU64,
}

thread_local! {
    // Stores this thread is currently mutating, by address.
    static MUTATING: RefCell<SmallVec<[usize; 4]>> = RefCell::new(SmallVec::new());
}

/// Marks a store as being mutated by this thread for as long as it lives.
struct MutationGuard(usize);

impl MutationGuard {
    fn enter<M: Model>(store: &Arc<StoreInner<M>>) -> Result<Self> {
        let key = Arc::as_ptr(store) as usize;
        MUTATING.with(|mutating| {
            let mut mutating = mutating.borrow_mut();
            if mutating.contains(&key) {
                return Err(Error::ReentrantMutation(store.id.clone()));
            }
            mutating.push(key);
            Ok(Self(key))
        })
    }
}

impl Drop for MutationGuard {
    fn drop(&mut self) {
        MUTATING.with(|mutating| mutating.borrow_mut().retain(|key| *key != self.0));
    }
}

impl<M: Model> Clone for Store<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: Model> Store<M> {
    /// Creates a store and registers it with `dispatcher` under `id`.
    pub fn new(dispatcher: &Dispatcher, id: impl Into<StoreId>, model: M) -> Self {
        Self::with_options(dispatcher, id, model, StoreOptions::default())
    }

    pub fn with_options(
        dispatcher: &Dispatcher,
        id: impl Into<StoreId>,
        model: M,
        options: StoreOptions,
    ) -> Self {
        Self::build(dispatcher, id.into(), model, options, None)
    }

    fn build(
        dispatcher: &Dispatcher,
        id: StoreId,
        model: M,
        options: StoreOptions,
        parent: Option<ParentLink<M>>,
    ) -> Self {
        let snapshot = match options.diffing {
            DiffingMode::None => Snapshot::default(),
            DiffingMode::Sync | DiffingMode::Async => Snapshot::encode(&model),
        };
        let state = State {
            model: Arc::new(model),
            snapshot: Arc::new(snapshot),
            generation: 0,
        };
        let inner = Arc::new(StoreInner {
            id: id.clone(),
            dispatcher: dispatcher.clone(),
            options,
            parent,
            published: RwLock::new(state.clone()),
            state: Mutex::new(state),
            reducers: RwLock::new(crate::create_map()),
            observers: Mutex::new(Vec::new()),
            diff_observers: Mutex::new(Vec::new()),
            middleware: RwLock::new(Vec::new()),
            children: Mutex::new(Vec::new()),
            next_token: AtomicU64::new(0),
        });
        dispatcher.register(&id, &inner);
        debug!(store = %id, "created store");
        Self { inner }
    }

    pub(crate) fn from_inner(inner: Arc<StoreInner<M>>) -> Self {
        Self { inner }
    }

    pub fn id(&self) -> &StoreId {
        &self.inner.id
    }

    /// The parent's id, for child stores.
    pub fn parent_id(&self) -> Option<&StoreId> {
        self.inner.parent.as_ref().map(|parent| &parent.id)
    }

    pub fn options(&self) -> &StoreOptions {
        &self.inner.options
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    /// A copy of the current model, consistent with the last committed mutation.
    ///
    /// Never waits for a mutation in flight. Called from inside one of this store's mutators,
    /// it returns the model as it was before that mutation.
    pub fn model(&self) -> M {
        M::clone(&self.shared_model())
    }

    /// The last committed model, without copying it.
    pub fn shared_model(&self) -> Arc<M> {
        Arc::clone(&self.inner.published.read().model)
    }

    /// Reads the current model without copying it.
    ///
    /// Commits to this store wait while `f` runs, so `f` must not run actions against it.
    pub fn read<R>(&self, f: impl FnOnce(&M) -> R) -> R {
        f(&self.inner.published.read().model)
    }

    /// The snapshot of the last committed mutation. Empty when diffing is disabled.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.inner.published.read().snapshot)
    }

    /// How many mutations this store observed.
    pub fn generation(&self) -> u64 {
        self.inner.published.read().generation
    }

    /// Runs `action` with `strategy`.
    ///
    /// For `Sync` and `MainThread` this returns once the transaction's operation finished;
    /// for `Async` it returns right away.
    pub fn run(&self, action: impl Action<M>, strategy: Strategy) -> Transaction {
        self.run_with(action, RunOptions::new(strategy))
    }

    /// Runs `action` with the given options.
    pub fn run_with(&self, action: impl Action<M>, options: impl Into<RunOptions>) -> Transaction {
        self.submit(Arc::new(action), options.into())
    }

    /// Runs the reducer registered as `id`. A missing reducer is logged and yields `None`.
    pub fn run_named(
        &self,
        id: impl Into<ActionId>,
        options: impl Into<RunOptions>,
    ) -> Option<Transaction> {
        let id = id.into();
        let reducer = self.inner.reducers.read().get(&id).cloned();
        match reducer {
            Some(reducer) => Some(self.submit(reducer, options.into())),
            None => {
                warn!(store = %self.id(), action = %id, "no reducer registered");
                None
            }
        }
    }

    /// Registers a reducer that [`run_named`](Store::run_named) can run by id.
    pub fn register_reducer(
        &self,
        id: impl Into<ActionId>,
        reduce: impl Fn(Context<M>) + Send + Sync + 'static,
    ) {
        let id = id.into();
        let reducer: Arc<dyn Action<M>> = Arc::new(action(id.clone(), reduce));
        if self.inner.reducers.write().insert(id.clone(), reducer).is_some() {
            debug!(store = %self.id(), action = %id, "replaced reducer");
        }
    }

    /// Registers a change observer. Observers are notified in registration order.
    pub fn observe(&self, observer: impl Fn(&Change<M>) + Send + Sync + 'static) -> ObserverToken {
        let token = self.next_token();
        self.inner.observers.lock().push((token, Arc::new(observer)));
        token
    }

    /// Registers a diff observer. Diff observers are never called when diffing is disabled.
    pub fn observe_diff(
        &self,
        observer: impl Fn(&DiffEvent) + Send + Sync + 'static,
    ) -> ObserverToken {
        let token = self.next_token();
        self.inner
            .diff_observers
            .lock()
            .push((token, Arc::new(observer)));
        token
    }

    /// Removes an observer. Returns false if the token is unknown.
    pub fn unobserve(&self, token: ObserverToken) -> bool {
        let mut removed = false;
        self.inner.observers.lock().retain(|(t, _)| {
            let keep = *t != token;
            removed |= !keep;
            keep
        });
        self.inner.diff_observers.lock().retain(|(t, _)| {
            let keep = *t != token;
            removed |= !keep;
            keep
        });
        removed
    }

    /// Registers middleware for transactions created from now on.
    pub fn register_middleware(&self, middleware: impl Middleware + 'static) {
        self.inner.middleware.write().push(Arc::new(middleware));
    }

    /// Creates a child store viewing part of this store's model through `lens`.
    pub fn make_child<C: Model>(&self, id: impl Into<StoreId>, lens: Lens<M, C>) -> Store<C> {
        self.make_child_with_options(id, lens, self.inner.options.clone())
    }

    pub fn make_child_with_options<C: Model>(
        &self,
        id: impl Into<StoreId>,
        lens: Lens<M, C>,
        options: StoreOptions,
    ) -> Store<C> {
        let id = id.into();
        let write: ParentWrite<C> = {
            let dispatcher = self.inner.dispatcher.clone();
            let parent = self.inner.id.clone();
            let lens = lens.clone();
            Box::new(
                move |transaction: &Transaction,
                      mutator: &mut dyn FnMut(&mut C),
                      publication: &mut Publication| {
                    let store = dispatcher
                        .lookup::<M>(&parent)
                        .map_err(|_| Error::ParentDropped(parent.clone()))?;
                    store.commit(
                        transaction,
                        |model| lens.over(model, |child| mutator(child)),
                        publication,
                    )
                },
            )
        };
        let link = ParentLink {
            id: self.inner.id.clone(),
            write,
        };

        // Holding the parent's lock while hooking the child in keeps the initial view and the
        // hook's first update in order.
        let state = self.inner.state.lock();
        let child = Store::build(
            &self.inner.dispatcher,
            id,
            lens.get(&state.model),
            options,
            Some(link),
        );
        let weak = Arc::downgrade(&child.inner);
        let mut children = self.inner.children.lock();
        children.retain(|link| link.child.strong_count() > 0);
        children.push(ChildLink {
            child: weak.clone() as Weak<dyn Any + Send + Sync>,
            update: Box::new(move |model: &M, transaction: &Transaction, publication: &mut Publication| {
                let Some(child) = weak.upgrade() else {
                    return false;
                };
                Store::from_inner(child).derive(lens.get(model), transaction, publication);
                true
            }),
        });
        drop(children);
        drop(state);
        child
    }

    #[cfg(test)]
    pub(crate) fn child_count(&self) -> usize {
        self.inner.children.lock().len()
    }

    fn next_token(&self) -> ObserverToken {
        ObserverToken(self.inner.next_token.fetch_add(1, Ordering::Relaxed))
    }

    fn submit(&self, action: Arc<dyn Action<M>>, options: RunOptions) -> Transaction {
        let RunOptions {
            strategy,
            throttle,
            batch: joined,
        } = options;
        let action_id = action.id();
        let transaction = Transaction::new(
            action_id.clone(),
            self.inner.id.clone(),
            strategy,
            self.inner.middleware.read().clone(),
            joined.or_else(batch::current),
        );
        transaction.submitted();

        let dispatcher = &self.inner.dispatcher;
        if dispatcher.is_shut_down() {
            warn!(store = %self.id(), action = %action_id, "dispatcher is shut down");
            transaction.cancel();
            return transaction;
        }

        let context = Context::new(self.clone(), transaction.clone());
        {
            let action = Arc::clone(&action);
            let context = context.clone();
            transaction.set_cancel_hook(move || action.cancel(&context));
        }
        let task = Task::new(transaction.clone(), move || action.reduce(context));

        match throttle {
            Some(minimum_delay) => {
                let scheduler = dispatcher.clone();
                let canceled = transaction.clone();
                dispatcher.throttler().throttle(
                    action_id,
                    minimum_delay,
                    move |fired| match fired {
                        Fired::Immediately => scheduler.executor().schedule(task),
                        Fired::AfterDelay => scheduler.executor().schedule_detached(task),
                    },
                    move || canceled.cancel(),
                );
            }
            None => dispatcher.executor().schedule(task),
        }
        transaction
    }

    /// Mutates the model on behalf of `transaction`, then notifies observers.
    pub(crate) fn update_model(
        &self,
        transaction: &Transaction,
        mutator: impl FnOnce(&mut M),
    ) -> Result<()> {
        let mut publication = Publication::default();
        self.commit(transaction, mutator, &mut publication)?;
        publication.deliver();
        Ok(())
    }

    /// Mutates the model, collecting inline deliveries into `publication`.
    ///
    /// Child stores commit through their parent, so inline deliveries only run once the
    /// outermost store released everything.
    fn commit(
        &self,
        transaction: &Transaction,
        mutator: impl FnOnce(&mut M),
        publication: &mut Publication,
    ) -> Result<()> {
        let _guard = MutationGuard::enter(&self.inner)?;
        match &self.inner.parent {
            Some(parent) => {
                let mut mutator = Some(mutator);
                let mut apply = |model: &mut M| {
                    if let Some(mutator) = mutator.take() {
                        mutator(model)
                    }
                };
                (parent.write)(transaction, &mut apply, publication)
            }
            None => {
                let mut state = self.inner.state.lock();
                let mut model = M::clone(&state.model);
                mutator(&mut model);
                state.model = Arc::new(model);
                self.record(&mut state, transaction, true, publication);
                self.update_children(&state.model, transaction, publication);
                Ok(())
            }
        }
    }

    /// Takes a new view from the parent. Called with the root's mutation lock held.
    fn derive(&self, view: M, transaction: &Transaction, publication: &mut Publication) {
        let mut state = self.inner.state.lock();
        state.model = Arc::new(view);
        let own = transaction.store_id() == &self.inner.id;
        self.record(&mut state, transaction, own, publication);
        self.update_children(&state.model, transaction, publication);
    }

    fn publish(&self, state: &State<M>) {
        *self.inner.published.write() = state.clone();
    }

    fn update_children(&self, model: &M, transaction: &Transaction, publication: &mut Publication) {
        self.inner
            .children
            .lock()
            .retain(|link| (link.update)(model, transaction, publication));
    }

    /// Snapshots and diffs the current model and arranges for observers to hear about it.
    ///
    /// Without `force`, a mutation that left the snapshot unchanged is not recorded.
    fn record(
        &self,
        state: &mut State<M>,
        transaction: &Transaction,
        force: bool,
        publication: &mut Publication,
    ) {
        let diffing = self.inner.options.diffing;
        let diff = match diffing {
            DiffingMode::None => None,
            DiffingMode::Sync | DiffingMode::Async => {
                let snapshot = Snapshot::encode(&*state.model);
                let diff = Diff::between(&state.snapshot, &snapshot);
                if diff.is_empty() && !force {
                    self.publish(state);
                    return;
                }
                state.snapshot = Arc::new(snapshot);
                Some(Arc::new(diff))
            }
        };
        state.generation += 1;
        // Before any delivery, so observers reading the store see this mutation.
        self.publish(state);
        debug!(
            store = %self.inner.id,
            transaction = %transaction.id(),
            generation = state.generation,
            changed_paths = diff.as_ref().map(|diff| diff.len()),
            "recorded mutation"
        );

        let observers: Vec<Observer<M>> = self
            .inner
            .observers
            .lock()
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();
        if !observers.is_empty() {
            let change = Change {
                store: self.inner.id.clone(),
                model: Arc::clone(&state.model),
                transaction: transaction.clone(),
                generation: state.generation,
                diff: diff.clone(),
            };
            let notify = move || {
                for observer in &observers {
                    observer(&change);
                }
            };
            match self.inner.options.delivery {
                Delivery::Inline => publication.inline.push(Box::new(notify)),
                Delivery::MainThread => self.inner.dispatcher.executor().post_main(notify),
            }
        }

        let Some(diff) = diff else {
            return;
        };
        let diff_observers: Vec<DiffObserver> = self
            .inner
            .diff_observers
            .lock()
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();
        if diff_observers.is_empty() {
            return;
        }
        let event = DiffEvent {
            store: self.inner.id.clone(),
            transaction: transaction.id(),
            action: transaction.action_id().clone(),
            generation: state.generation,
            diff,
            snapshot: Arc::clone(&state.snapshot),
        };
        let notify = move || {
            for observer in &diff_observers {
                observer(&event);
            }
        };
        if diffing == DiffingMode::Async {
            let queued = self
                .inner
                .dispatcher
                .executor()
                .diffs()
                .enqueue_callback(notify);
            if queued.is_err() {
                debug!(store = %self.inner.id, "dropping diff after shutdown");
            }
        } else {
            publication.inline.push(Box::new(notify));
        }
    }
}

impl<M: Model> Drop for StoreInner<M> {
    fn drop(&mut self) {
        self.dispatcher.release(&self.id);
    }
}

impl<M: Model> fmt::Debug for Store<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("id", &self.inner.id)
            .field("parent", &self.parent_id())
            .field("generation", &self.generation())
            .finish()
    }
}
