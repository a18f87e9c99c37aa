// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! Groups of transactions that complete together.
use parking_lot::Mutex;
use std::{
    cell::RefCell,
    error::Error as StdError,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};
use tracing::debug;

/// The error type recorded by reducers into a batch.
pub type BatchError = Arc<dyn StdError + Send + Sync>;

type Completion = Box<dyn FnOnce(&BatchContext) + Send>;

/// State shared by all transactions of one batch.
///
/// Reducers [`reject`](BatchContext::reject) into it, anyone holding the context may
/// [`cancel`](BatchContext::cancel) it, and the batch's completion handler runs once every
/// member reached a terminal state. Rejecting never cancels the other members.
///
/// Cloning the context is cheap and yields a handle to the same batch.
#[derive(Clone)]
pub struct BatchContext {
    inner: Arc<Inner>,
}

struct Inner {
    errors: Mutex<Vec<BatchError>>,
    canceled: AtomicBool,
    // Starts at one, held by the builder until it returns, so the completion cannot fire while
    // members are still being submitted.
    outstanding: AtomicUsize,
    completion: Mutex<Option<Completion>>,
}

impl BatchContext {
    pub(crate) fn new(completion: impl FnOnce(&BatchContext) + Send + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                errors: Mutex::new(Vec::new()),
                canceled: AtomicBool::new(false),
                outstanding: AtomicUsize::new(1),
                completion: Mutex::new(Some(Box::new(completion))),
            }),
        }
    }

    /// Records an error. The last recorded error is available through
    /// [`last_error`](BatchContext::last_error).
    pub fn reject(&self, error: impl Into<Box<dyn StdError + Send + Sync>>) {
        let error: BatchError = Arc::from(error.into());
        debug!(%error, "batch member rejected");
        self.inner.errors.lock().push(error);
    }

    pub fn last_error(&self) -> Option<BatchError> {
        self.inner.errors.lock().last().cloned()
    }

    /// All errors recorded so far, in rejection order.
    pub fn errors(&self) -> Vec<BatchError> {
        self.inner.errors.lock().clone()
    }

    pub fn has_errors(&self) -> bool {
        !self.inner.errors.lock().is_empty()
    }

    /// Marks the batch canceled.
    ///
    /// Members that have not started yet are canceled when they are scheduled; running members
    /// observe the flag through [`Context::is_canceled`](crate::Context::is_canceled).
    pub fn cancel(&self) {
        self.inner.canceled.store(true, Ordering::Release);
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::Acquire)
    }

    /// The number of members (plus the builder, while it runs) that have not settled yet.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    pub(crate) fn enter(&self) {
        self.inner.outstanding.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn leave(&self) {
        if self.inner.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            let completion = self.inner.completion.lock().take();
            if let Some(completion) = completion {
                completion(self);
            }
        }
    }
}

thread_local! {
    static CURRENT: RefCell<Vec<BatchContext>> = const { RefCell::new(Vec::new()) };
}

/// Runs `f` with `batch` as the batch new transactions on this thread join.
pub(crate) fn scope<R>(batch: &BatchContext, f: impl FnOnce() -> R) -> R {
    struct Exit;
    impl Drop for Exit {
        fn drop(&mut self) {
            CURRENT.with(|current| current.borrow_mut().pop());
        }
    }

    CURRENT.with(|current| current.borrow_mut().push(batch.clone()));
    let _exit = Exit;
    f()
}

/// The innermost batch being built on this thread.
pub(crate) fn current() -> Option<BatchContext> {
    CURRENT.with(|current| current.borrow().last().cloned())
}

impl fmt::Debug for BatchContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchContext")
            .field("outstanding", &self.outstanding())
            .field("canceled", &self.is_canceled())
            .field("errors", &self.inner.errors.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn completion_waits_for_every_member() {
        let fired = Arc::new(AtomicUsize::new(0));
        let batch = {
            let fired = Arc::clone(&fired);
            BatchContext::new(move |_| {
                fired.fetch_add(1, Ordering::SeqCst);
            })
        };

        batch.enter();
        batch.enter();
        batch.leave(); // builder returned
        batch.leave();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        batch.leave();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn empty_batch_completes_when_builder_returns() {
        let fired = Arc::new(AtomicBool::new(false));
        let batch = {
            let fired = Arc::clone(&fired);
            BatchContext::new(move |_| fired.store(true, Ordering::SeqCst))
        };
        batch.leave();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn scopes_nest() {
        let outer = BatchContext::new(|_| {});
        let inner = BatchContext::new(|_| {});
        assert!(current().is_none());
        scope(&outer, || {
            assert!(Arc::ptr_eq(&current().unwrap().inner, &outer.inner));
            scope(&inner, || {
                assert!(Arc::ptr_eq(&current().unwrap().inner, &inner.inner));
            });
            assert!(Arc::ptr_eq(&current().unwrap().inner, &outer.inner));
        });
        assert!(current().is_none());
    }

    #[test]
    fn rejections_are_recorded_in_order() {
        let batch = BatchContext::new(|_| {});
        assert!(batch.last_error().is_none());
        batch.reject("first");
        batch.reject(Error::Rejected("second".into()));
        assert_eq!(batch.errors().len(), 2);
        assert_eq!(batch.last_error().unwrap().to_string(), "rejected: second");
        assert!(!batch.is_canceled());
    }
}
