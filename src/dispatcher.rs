// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! The dispatcher: queues, batches, throttling and the store registry.
//!
//! A [`Dispatcher`] is created explicitly and handed to every store. It owns
//!
//! - the main context and the serial background queues transactions run on,
//! - the queue that delivers asynchronous diffs,
//! - the [`Throttler`] used by throttled runs,
//! - a registry mapping [`StoreId`]s to live stores, through which child stores reach their
//!   parents without keeping them alive.
//!
//! Handles are cheap to clone. The worker threads stop when [`Dispatcher::shutdown`] is called,
//! or when the last handle (including those held by stores) is dropped.
use crate::{
    Action, BatchContext, Model, Store, Strategy, Transaction,
    batch,
    error::{Error, Result},
    executor::Executor,
    id::{QueueId, StoreId},
    store::StoreInner,
    throttle::Throttler,
};
use parking_lot::Mutex;
use serde::Deserialize;
use std::{
    any::Any,
    collections::HashMap,
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
};
use tracing::{debug, info, warn};

/// Configures a [`Dispatcher`].
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// The queue `Strategy::Async(None)` runs on.
    pub default_queue: QueueId,
    /// The name of the main context.
    pub main_queue: QueueId,
    /// The name of the queue delivering diffs of stores in `DiffingMode::Async`.
    pub diff_queue: QueueId,
    /// Worker threads are called `<prefix>-<queue>`.
    pub thread_name_prefix: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            default_queue: QueueId::from("default"),
            main_queue: QueueId::from("main"),
            diff_queue: QueueId::from("diffs"),
            thread_name_prefix: "reflux".to_string(),
        }
    }
}

impl DispatcherConfig {
    pub fn with_default_queue(mut self, queue: impl Into<QueueId>) -> Self {
        self.default_queue = queue.into();
        self
    }

    pub fn with_main_queue(mut self, queue: impl Into<QueueId>) -> Self {
        self.main_queue = queue.into();
        self
    }

    pub fn with_diff_queue(mut self, queue: impl Into<QueueId>) -> Self {
        self.diff_queue = queue.into();
        self
    }

    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }
}

type Registry = HashMap<StoreId, Weak<dyn Any + Send + Sync>, ahash::RandomState>;

/// Schedules transactions and keeps track of stores.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

pub(crate) struct DispatcherInner {
    config: DispatcherConfig,
    executor: Executor,
    throttler: Throttler,
    registry: Mutex<Registry>,
    shut_down: AtomicBool,
}

impl Dispatcher {
    /// Creates a dispatcher with the default configuration.
    pub fn new() -> Result<Self> {
        Self::with_config(DispatcherConfig::default())
    }

    /// Creates a dispatcher, spawning its main context, diff queue, default queue and timer.
    pub fn with_config(config: DispatcherConfig) -> Result<Self> {
        let executor = Executor::new(&config)?;
        let throttler = Throttler::new(format!("{}-throttle", config.thread_name_prefix))?;
        info!(
            main = %config.main_queue,
            default_queue = %config.default_queue,
            "dispatcher started"
        );
        Ok(Self {
            inner: Arc::new(DispatcherInner {
                config,
                executor,
                throttler,
                registry: Mutex::new(crate::create_map()),
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    pub(crate) fn executor(&self) -> &Executor {
        &self.inner.executor
    }

    pub fn throttler(&self) -> &Throttler {
        &self.inner.throttler
    }

    /// Returns true if called from the main context.
    pub fn is_main_thread(&self) -> bool {
        self.inner.executor.is_main_thread()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    /// Makes sure the named queue exists, spawning its worker if needed.
    pub fn queue(&self, id: impl Into<QueueId>) -> Result<()> {
        if self.is_shut_down() {
            return Err(Error::ShutDown);
        }
        self.inner.executor.queue(&id.into()).map(drop)
    }

    /// Runs `build`, grouping every transaction it submits on this thread into one batch.
    ///
    /// `completion` runs once, after `build` returned and every member of the batch reached a
    /// terminal state. It runs on the thread that settles the last member, which is the
    /// calling thread if the batch is empty or all its members ran synchronously.
    pub fn batch(
        &self,
        build: impl FnOnce(&BatchContext),
        completion: impl FnOnce(&BatchContext) + Send + 'static,
    ) -> BatchContext {
        let context = BatchContext::new(completion);
        batch::scope(&context, || build(&context));
        context.leave();
        context
    }

    /// Cancels every transaction waiting on `queue` (the default queue when `None`).
    ///
    /// Transactions that already started are not affected. Returns how many were canceled.
    pub fn cancel_all(&self, queue: Option<&QueueId>) -> usize {
        let id = queue.unwrap_or(self.inner.executor.default_queue());
        match self.inner.executor.existing_queue(id) {
            Some(queue) => queue.cancel_pending(),
            None => {
                debug!(queue = %id, "no such queue");
                0
            }
        }
    }

    /// How many transactions wait on `queue` (the default queue when `None`).
    pub fn pending(&self, queue: Option<&QueueId>) -> usize {
        let id = queue.unwrap_or(self.inner.executor.default_queue());
        self.inner
            .executor
            .existing_queue(id)
            .map_or(0, |queue| queue.pending())
    }

    /// Ids of the background queues spawned so far, sorted.
    pub fn queue_ids(&self) -> Vec<QueueId> {
        let mut ids: Vec<QueueId> = self
            .inner
            .executor
            .queues()
            .iter()
            .map(|queue| queue.id().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Blocks until everything enqueued on `queue` (the default queue when `None`) before this
    /// call ran.
    pub fn flush(&self, queue: Option<&QueueId>) {
        let id = queue.unwrap_or(self.inner.executor.default_queue());
        if let Some(queue) = self.inner.executor.existing_queue(id) {
            queue.flush();
        }
    }

    /// Blocks until everything posted to the main context before this call ran.
    pub fn flush_main(&self) {
        self.inner.executor.main().flush();
    }

    /// Blocks until every asynchronous diff enqueued before this call was delivered.
    pub fn flush_diffs(&self) {
        self.inner.executor.diffs().flush();
    }

    /// Cancels all pending work and stops every worker thread.
    ///
    /// Throttled requests are canceled, queued transactions are canceled, and workers are
    /// joined once they finished their current job. Later submissions are canceled right away.
    /// Calling this from a worker does not join that worker.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    /// Looks up a live store.
    ///
    /// A miss, or a store of a different model type, is logged and yields `None`.
    pub fn store<M: Model>(&self, id: impl Into<StoreId>) -> Option<Store<M>> {
        let id = id.into();
        self.lookup(&id)
            .inspect_err(|error| warn!(%error, store = %id, "store lookup failed"))
            .ok()
    }

    /// Runs `action` against the store registered as `id`.
    ///
    /// A miss is logged and yields `None`.
    pub fn run_on<M: Model>(
        &self,
        id: impl Into<StoreId>,
        action: impl Action<M>,
        strategy: Strategy,
    ) -> Option<Transaction> {
        self.store::<M>(id).map(|store| store.run(action, strategy))
    }

    /// Ids of all live registered stores, sorted.
    pub fn store_ids(&self) -> Vec<StoreId> {
        let mut ids: Vec<StoreId> = self
            .inner
            .registry
            .lock()
            .iter()
            .filter(|(_, store)| store.strong_count() > 0)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub(crate) fn lookup<M: Model>(&self, id: &StoreId) -> Result<Store<M>> {
        let store = self
            .inner
            .registry
            .lock()
            .get(id)
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::StoreNotFound(id.clone()))?;
        store
            .downcast::<StoreInner<M>>()
            .map(Store::from_inner)
            .map_err(|_| Error::ModelMismatch(id.clone()))
    }

    pub(crate) fn register<M: Model>(&self, id: &StoreId, store: &Arc<StoreInner<M>>) {
        let weak: Weak<dyn Any + Send + Sync> = Arc::downgrade(store) as Weak<dyn Any + Send + Sync>;
        let previous = self.inner.registry.lock().insert(id.clone(), weak);
        if previous.is_some_and(|previous| previous.strong_count() > 0) {
            warn!(store = %id, "replacing a live store with the same id");
        }
    }

    /// Forgets `id` unless it was taken over by a live store in the meantime.
    pub(crate) fn release(&self, id: &StoreId) {
        let mut registry = self.inner.registry.lock();
        if registry.get(id).is_some_and(|store| store.strong_count() == 0) {
            registry.remove(id);
            debug!(store = %id, "released store");
        }
    }
}

impl DispatcherInner {
    fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("dispatcher shutting down");
        self.throttler.shutdown();
        self.executor.shutdown();
        info!("dispatcher shut down");
    }
}

impl Drop for DispatcherInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.inner.config)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{TransactionState, mutate};
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn config_from_json_fills_defaults() {
        let config: DispatcherConfig =
            serde_json::from_str(r#"{"default_queue": "work", "thread_name_prefix": "app"}"#)
                .unwrap();
        assert_eq!(config.default_queue, QueueId::from("work"));
        assert_eq!(config.main_queue, QueueId::from("main"));
        assert_eq!(config.thread_name_prefix, "app");
    }

    #[test]
    fn registry_lookups() {
        let dispatcher = Dispatcher::new().unwrap();
        let store = Store::new(&dispatcher, "numbers", vec![1u32]);

        assert!(dispatcher.store::<Vec<u32>>("numbers").is_some());
        assert!(matches!(
            dispatcher.lookup::<String>(&"numbers".into()),
            Err(Error::ModelMismatch(_))
        ));
        assert!(matches!(
            dispatcher.lookup::<Vec<u32>>(&"missing".into()),
            Err(Error::StoreNotFound(_))
        ));
        assert!(dispatcher
            .run_on("missing", mutate("push", |v: &mut Vec<u32>| v.push(2)), Strategy::Sync)
            .is_none());

        let tx = dispatcher
            .run_on("numbers", mutate("push", |v: &mut Vec<u32>| v.push(2)), Strategy::Sync)
            .unwrap();
        assert_eq!(tx.state(), TransactionState::Completed);
        assert_eq!(store.model(), [1, 2]);

        assert_eq!(dispatcher.store_ids(), [StoreId::from("numbers")]);
        drop(store);
        assert!(dispatcher.store::<Vec<u32>>("numbers").is_none());
        assert!(dispatcher.store_ids().is_empty());
        dispatcher.shutdown();
    }

    #[test]
    fn batch_completion_runs_after_members() {
        let dispatcher = Dispatcher::new().unwrap();
        let store = Store::new(&dispatcher, "batched", 0u32);
        let completed = Arc::new(AtomicUsize::new(0));

        let seen_at_completion = Arc::new(Mutex::new(None));
        let batch = {
            let seen = Arc::clone(&seen_at_completion);
            let observed = store.clone();
            let completed = Arc::clone(&completed);
            dispatcher.batch(
                |_| {
                    for _ in 0..3 {
                        store.run(mutate("inc", |n: &mut u32| *n += 1), Strategy::Async(None));
                    }
                },
                move |_| {
                    *seen.lock() = Some(observed.model());
                    completed.fetch_add(1, Ordering::SeqCst);
                },
            )
        };

        dispatcher.flush(None);
        assert_eq!(completed.load(Ordering::SeqCst), 1);
        assert_eq!(*seen_at_completion.lock(), Some(3));
        assert_eq!(batch.outstanding(), 0);
        dispatcher.shutdown();
    }

    #[test]
    fn shutdown_cancels_later_submissions() {
        let dispatcher = Dispatcher::new().unwrap();
        let store = Store::new(&dispatcher, "late", 0u32);
        dispatcher.shutdown();
        assert!(dispatcher.is_shut_down());

        let tx = store.run(mutate("inc", |n: &mut u32| *n += 1), Strategy::Async(None));
        assert_eq!(tx.state(), TransactionState::Canceled);
        assert_eq!(store.model(), 0);
        assert!(dispatcher.queue("other").is_err());
    }
}
