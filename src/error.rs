// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! Error types.
//!
//! Most failure modes of the engine are *not* errors: routing misses are logged
//! no-ops, cancellation is a terminal transaction state and reducer rejections are recorded into
//! a [`BatchContext`](crate::BatchContext). What remains is listed here.
use crate::id::StoreId;
use thiserror::Error;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the engine.
#[derive(Debug, Error)]
pub enum Error {
    /// A mutator tried to mutate a store that the same thread is already mutating.
    #[error("store {0} is already being mutated on this thread")]
    ReentrantMutation(StoreId),

    /// A child store's parent is no longer registered.
    #[error("parent store {0} no longer exists")]
    ParentDropped(StoreId),

    /// No live store is registered under the id.
    #[error("no store registered as {0}")]
    StoreNotFound(StoreId),

    /// A store is registered under the id, but holds a different model type.
    #[error("store {0} holds a different model type")]
    ModelMismatch(StoreId),

    /// A model could not be serialized into a snapshot.
    #[error("failed to encode model: {0}")]
    Encode(#[source] serde_json::Error),

    /// A reducer rejected its action.
    #[error("rejected: {0}")]
    Rejected(String),

    /// A snapshot could not be deserialized into a model.
    #[error("failed to decode model: {0}")]
    Decode(#[source] serde_json::Error),

    /// A worker thread could not be spawned.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),

    /// The dispatcher no longer accepts work.
    #[error("dispatcher has been shut down")]
    ShutDown,
}
