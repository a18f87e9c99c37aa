// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! # Reflux: transactional stores with scheduled reducers and structural diffs
//!
//! This crate provides a unidirectional, transactional state container. Application state lives
//! in [`Store`]s. It never changes behind the store's back: callers submit typed intents
//! ([`Action`]s), the engine schedules them, runs their reducers one at a time against the
//! store's model, and tells observers what changed, down to the individual leaf.
//!
//! The moving parts, from the bottom up:
//!
//! - [`Snapshot`]: a flat `path -> leaf` view of a model, produced with `serde`.
//! - [`Diff`]: what changed between two snapshots (added, changed and removed paths).
//! - [`Operation`]: a cooperative unit of work that starts at most once and finishes exactly
//!   once.
//! - [`Transaction`]: one action run against one store, with a forward-only lifecycle.
//! - [`Dispatcher`]: serial queues, a main context, batches, a [`Throttler`] and a registry of
//!   live stores.
//! - [`Store`]: the model, the mutation lock, child stores, observers and [`Middleware`].
//!
//! ## A short tour
//!
//! ```rust
//! use reflux::{Delivery, Dispatcher, RunOptions, Store, StoreOptions, Strategy, mutate};
//! use std::time::Duration;
//!
//! let dispatcher = Dispatcher::new()?;
//! let counter = Store::with_options(
//!     &dispatcher,
//!     "counter",
//!     0i64,
//!     StoreOptions::default().with_delivery(Delivery::Inline),
//! );
//! counter.observe(|change| println!("count is now {}", change.model));
//!
//! // Sync runs on this thread and returns once the reducer is done.
//! for _ in 0..3 {
//!     counter.run(mutate("increase", |n: &mut i64| *n += 1), Strategy::Sync);
//! }
//! assert_eq!(counter.model(), 3);
//!
//! // Rapid throttled runs collapse into one.
//! let throttled = RunOptions::new(Strategy::Sync).with_throttle(Duration::from_millis(50));
//! let first = counter.run_with(mutate("decrease", |n: &mut i64| *n -= 1), throttled.clone());
//! let last = counter.run_with(mutate("decrease", |n: &mut i64| *n -= 1), throttled);
//! last.wait();
//! assert!(first.wait().is_terminal());
//! assert_eq!(counter.model(), 2);
//!
//! dispatcher.shutdown();
//! # Ok::<(), reflux::Error>(())
//! ```
//!
//! ## Strategies
//!
//! Every run picks a [`Strategy`]:
//!
//! - [`Strategy::Sync`] runs the reducer on the calling thread; `run` returns once it fulfilled.
//! - [`Strategy::MainThread`] runs the reducer on the dispatcher's main context and blocks the
//!   caller until it fulfilled. Called from the main context itself, it runs inline.
//! - [`Strategy::Async`] enqueues the reducer on a serial background queue and returns right
//!   away. Completion is reported through [`Transaction::on_complete`].
//!
//! Each queue runs one transaction at a time, in submission order, and moves on only once the
//! running one fulfilled, even if that happens on another thread.
//!
//! ## Diffs
//!
//! Unless a store disables diffing, every mutation is snapshotted and diffed against the
//! previous snapshot while the mutation lock is held, so each diff covers exactly one mutation.
//! Diff observers receive them either on the mutating thread or, in [`DiffingMode::Async`], on a
//! dedicated queue, always in commit order.
//!
//! ```rust
//! # use reflux::{Diff, Snapshot};
//! # use serde_json::json;
//! let old = Snapshot::from_json(&json!({"user": {"name": "Ada"}, "tokens": ["a"]}));
//! let new = Snapshot::from_json(&json!({"user": {"name": "Grace"}, "tokens": ["a", "b"]}));
//! let diff = Diff::between(&old, &new);
//! assert_eq!(diff.to_string(), "+ tokens/1 = \"b\"\n~ user/name = \"Ada\" -> \"Grace\"");
//! assert_eq!(diff.apply(&old), new);
//! ```
//!
//! ## Cancellation
//!
//! Cancellation is cooperative. A transaction canceled before it started never starts; one
//! canceled while running keeps running, its action's [`Action::cancel`] hook is called, and it
//! ends up [`TransactionState::Canceled`] once the reducer fulfills. Reducers poll
//! [`Context::is_canceled`].
//!
//! ## Features
//!
//! - `chrono`: Records the wall-clock submission time of transactions. This feature is enabled
//!   by default.
//! - `arbitrary`: Implements `quickcheck::Arbitrary` for [`Leaf`], [`Path`] and [`Snapshot`],
//!   useful for property-based testing.
#[cfg(test)]
#[macro_use(quickcheck)]
extern crate quickcheck_macros;

use ahash::RandomState;
use std::collections::HashMap;

mod action;
pub use action::{Action, Context, FnAction, action, mutate};
mod batch;
pub use batch::{BatchContext, BatchError};
pub mod diff;
pub use diff::{Diff, DiffEntry, DiffingMode};
mod dispatcher;
pub use dispatcher::{Dispatcher, DispatcherConfig};
pub mod error;
pub use error::{Error, Result};
mod executor;
pub use executor::Strategy;
pub mod id;
pub use id::{ActionId, QueueId, StoreId, TransactionId};
mod lens;
pub use lens::Lens;
pub mod middleware;
pub use middleware::{LoggingMiddleware, Middleware, RecordingMiddleware};
mod operation;
pub use operation::{Operation, OperationState};
pub mod snapshot;
pub use snapshot::{Path, Segment, Snapshot};
mod store;
pub use store::{
    Change, Delivery, DiffEvent, Model, ObserverToken, RunOptions, Store, StoreOptions,
};
pub mod throttle;
pub use throttle::{Fired, Throttler};
mod transaction;
pub use transaction::{Transaction, TransactionState};
mod value;
pub use value::Leaf;

fn create_map<K, V>() -> HashMap<K, V, RandomState> {
    HashMap::with_hasher(RandomState::new())
}
