// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! Serial queues and execution strategies.
//!
//! Every queue is served by exactly one worker thread, which takes jobs in FIFO order and runs
//! each to completion before touching the next. For transactions, "completion" means the
//! operation finished, which may happen on another thread if the reducer hands its work off
//! and fulfills later.
use crate::{
    DispatcherConfig, Transaction,
    error::{Error, Result},
    id::QueueId,
};
use parking_lot::{Condvar, Mutex, RwLock};
use std::{
    collections::{HashMap, VecDeque},
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread::{self, JoinHandle, ThreadId},
};
use tracing::{debug, error, info, warn};

/// Where and how a transaction runs.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// On the caller's thread. The caller blocks until the operation finished.
    #[default]
    Sync,
    /// On the dispatcher's main context. The caller blocks until the operation finished; if the
    /// caller already is on the main context the transaction runs inline.
    MainThread,
    /// On a serial background queue, the default one when `None`. The caller never blocks.
    Async(Option<QueueId>),
}

impl Strategy {
    /// Shorthand for running on a named background queue.
    pub fn on_queue(queue: impl Into<QueueId>) -> Self {
        Strategy::Async(Some(queue.into()))
    }

    pub fn is_blocking(&self) -> bool {
        !matches!(self, Strategy::Async(_))
    }
}

/// A transaction together with the work that drives it.
pub(crate) struct Task {
    pub(crate) transaction: Transaction,
    pub(crate) body: Box<dyn FnOnce() + Send>,
}

impl Task {
    pub(crate) fn new(transaction: Transaction, body: impl FnOnce() + Send + 'static) -> Self {
        Self {
            transaction,
            body: Box::new(body),
        }
    }

    /// Runs the task and blocks until its operation finished.
    ///
    /// A panicking body abandons the transaction before the panic continues.
    pub(crate) fn run(self) {
        let Task { transaction, body } = self;
        if !transaction.begin() {
            debug!(transaction = %transaction.id(), action = %transaction.action_id(), "skipped");
            return;
        }
        if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(body)) {
            transaction.abandon();
            panic::resume_unwind(panic);
        }
        transaction.operation().wait();
    }
}

pub(crate) enum Job {
    Transaction(Task),
    Callback(Box<dyn FnOnce() + Send>),
}

impl Job {
    fn cancel(self) {
        if let Job::Transaction(task) = self {
            task.transaction.cancel();
        }
    }
}

struct QueueState {
    jobs: VecDeque<Job>,
    shutdown: bool,
}

struct QueueShared {
    state: Mutex<QueueState>,
    available: Condvar,
}

/// A FIFO queue with a dedicated worker thread.
pub(crate) struct SerialQueue {
    id: QueueId,
    shared: Arc<QueueShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    thread: ThreadId,
}

impl SerialQueue {
    pub(crate) fn spawn(id: QueueId, thread_name: String) -> Result<Self> {
        let shared = Arc::new(QueueShared {
            state: Mutex::new(QueueState {
                jobs: VecDeque::new(),
                shutdown: false,
            }),
            available: Condvar::new(),
        });
        let worker = {
            let shared = Arc::clone(&shared);
            let id = id.clone();
            thread::Builder::new()
                .name(thread_name)
                .spawn(move || work(&id, &shared))?
        };
        debug!(queue = %id, "spawned queue worker");
        Ok(Self {
            id,
            shared,
            thread: worker.thread().id(),
            worker: Mutex::new(Some(worker)),
        })
    }

    pub(crate) fn id(&self) -> &QueueId {
        &self.id
    }

    /// Returns true if called from this queue's worker.
    pub(crate) fn is_current(&self) -> bool {
        thread::current().id() == self.thread
    }

    pub(crate) fn enqueue(&self, job: Job) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            drop(state);
            job.cancel();
            return Err(Error::ShutDown);
        }
        state.jobs.push_back(job);
        self.shared.available.notify_one();
        Ok(())
    }

    pub(crate) fn enqueue_callback(&self, callback: impl FnOnce() + Send + 'static) -> Result<()> {
        self.enqueue(Job::Callback(Box::new(callback)))
    }

    /// Cancels every transaction that has not been picked up by the worker yet. Callbacks stay
    /// queued. Returns the number of canceled transactions.
    pub(crate) fn cancel_pending(&self) -> usize {
        let canceled: VecDeque<Job> = {
            let mut state = self.shared.state.lock();
            let (transactions, callbacks): (VecDeque<Job>, VecDeque<Job>) = std::mem::take(&mut state.jobs)
                .into_iter()
                .partition(|job| matches!(job, Job::Transaction(_)));
            state.jobs = callbacks;
            transactions
        };
        let count = canceled.len();
        for job in canceled {
            job.cancel();
        }
        if count > 0 {
            info!(queue = %self.id, count, "canceled pending transactions");
        }
        count
    }

    pub(crate) fn pending(&self) -> usize {
        self.shared.state.lock().jobs.len()
    }

    /// Blocks until every job enqueued before this call ran.
    ///
    /// Returns immediately when called from the worker itself, or when the queue is shut down.
    pub(crate) fn flush(&self) {
        if self.is_current() {
            return;
        }
        let latch = Arc::new((Mutex::new(false), Condvar::new()));
        let signal = Arc::clone(&latch);
        let enqueued = self.enqueue_callback(move || {
            let (done, cvar) = &*signal;
            *done.lock() = true;
            cvar.notify_all();
        });
        if enqueued.is_err() {
            return;
        }
        let (done, cvar) = &*latch;
        let mut done = done.lock();
        while !*done {
            cvar.wait(&mut done);
        }
    }

    /// Stops accepting jobs, cancels queued transactions and joins the worker once it ran the
    /// remaining callbacks.
    pub(crate) fn shutdown(&self) {
        self.cancel_pending();
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            self.shared.available.notify_all();
        }
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if self.is_current() {
                // Shutting down from our own worker: it exits after this job.
                return;
            }
            if worker.join().is_err() {
                error!(queue = %self.id, "queue worker panicked");
            }
        }
    }
}

fn work(id: &QueueId, shared: &QueueShared) {
    loop {
        let job = {
            let mut state = shared.state.lock();
            loop {
                if let Some(job) = state.jobs.pop_front() {
                    break job;
                }
                if state.shutdown {
                    debug!(queue = %id, "queue worker exiting");
                    return;
                }
                shared.available.wait(&mut state);
            }
        };
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| match job {
            Job::Transaction(task) => task.run(),
            Job::Callback(callback) => callback(),
        }));
        if outcome.is_err() {
            error!(queue = %id, "job panicked; continuing with the next one");
        }
    }
}

/// Owns the main context, the diff delivery queue and every background queue.
pub(crate) struct Executor {
    main: SerialQueue,
    diffs: SerialQueue,
    default_queue: QueueId,
    thread_name_prefix: String,
    queues: RwLock<HashMap<QueueId, Arc<SerialQueue>, ahash::RandomState>>,
}

impl Executor {
    pub(crate) fn new(config: &DispatcherConfig) -> Result<Self> {
        let prefix = &config.thread_name_prefix;
        let spawn = |id: &QueueId| SerialQueue::spawn(id.clone(), format!("{prefix}-{id}"));
        let executor = Self {
            main: spawn(&config.main_queue)?,
            diffs: spawn(&config.diff_queue)?,
            default_queue: config.default_queue.clone(),
            thread_name_prefix: prefix.clone(),
            queues: RwLock::new(crate::create_map()),
        };
        executor.queue(&config.default_queue)?;
        Ok(executor)
    }

    pub(crate) fn main(&self) -> &SerialQueue {
        &self.main
    }

    pub(crate) fn diffs(&self) -> &SerialQueue {
        &self.diffs
    }

    pub(crate) fn default_queue(&self) -> &QueueId {
        &self.default_queue
    }

    pub(crate) fn is_main_thread(&self) -> bool {
        self.main.is_current()
    }

    /// Returns the named queue, spawning its worker on first use.
    pub(crate) fn queue(&self, id: &QueueId) -> Result<Arc<SerialQueue>> {
        if let Some(queue) = self.queues.read().get(id) {
            return Ok(Arc::clone(queue));
        }
        let mut queues = self.queues.write();
        if let Some(queue) = queues.get(id) {
            return Ok(Arc::clone(queue));
        }
        let queue = Arc::new(SerialQueue::spawn(
            id.clone(),
            format!("{}-{id}", self.thread_name_prefix),
        )?);
        queues.insert(id.clone(), Arc::clone(&queue));
        Ok(queue)
    }

    /// Returns the named queue if it exists, without spawning it.
    pub(crate) fn existing_queue(&self, id: &QueueId) -> Option<Arc<SerialQueue>> {
        self.queues.read().get(id).cloned()
    }

    pub(crate) fn queues(&self) -> Vec<Arc<SerialQueue>> {
        self.queues.read().values().cloned().collect()
    }

    /// Runs `task` according to its transaction's strategy.
    pub(crate) fn schedule(&self, task: Task) {
        match task.transaction.strategy().clone() {
            Strategy::Sync => task.run(),
            Strategy::MainThread if self.main.is_current() => task.run(),
            Strategy::MainThread => {
                let transaction = task.transaction.clone();
                if self.main.enqueue(Job::Transaction(task)).is_ok() {
                    transaction.operation().wait();
                } else {
                    warn!(transaction = %transaction.id(), "main context is shut down");
                }
            }
            Strategy::Async(queue) => self.enqueue(queue, task),
        }
    }

    /// Runs `task` without blocking the calling thread.
    ///
    /// Used for work whose caller is long gone, like throttled requests firing late: `Sync`
    /// work goes to the default queue, `MainThread` work is posted to the main context.
    pub(crate) fn schedule_detached(&self, task: Task) {
        match task.transaction.strategy().clone() {
            Strategy::Sync => self.enqueue(None, task),
            Strategy::MainThread => {
                let transaction = task.transaction.clone();
                if self.main.enqueue(Job::Transaction(task)).is_err() {
                    warn!(transaction = %transaction.id(), "main context is shut down");
                }
            }
            Strategy::Async(queue) => self.enqueue(queue, task),
        }
    }

    fn enqueue(&self, queue: Option<QueueId>, task: Task) {
        let queue = queue.unwrap_or_else(|| self.default_queue.clone());
        let transaction = task.transaction.clone();
        match self.queue(&queue) {
            Ok(queue) => {
                if queue.enqueue(Job::Transaction(task)).is_err() {
                    warn!(transaction = %transaction.id(), queue = %queue.id(), "queue is shut down");
                }
            }
            Err(error) => {
                error!(%error, transaction = %transaction.id(), queue = %queue, "cannot schedule");
                transaction.cancel();
            }
        }
    }

    /// Runs `job` on the main context without waiting for it.
    pub(crate) fn post_main(&self, job: impl FnOnce() + Send + 'static) {
        if self.main.enqueue_callback(job).is_err() {
            debug!("dropping main context callback after shutdown");
        }
    }

    pub(crate) fn shutdown(&self) {
        let queues: Vec<_> = self.queues.write().drain().map(|(_, queue)| queue).collect();
        for queue in queues {
            queue.shutdown();
        }
        self.main.shutdown();
        self.diffs.shutdown();
    }
}
