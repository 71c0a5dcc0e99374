//! Error types for the controller.

use std::time::Duration;

use kube::runtime::watcher;
use thiserror::Error;
use tokio::task::JoinError;

/// Fatal controller failures.
///
/// Recoverable watch errors never surface here; they are retried inside the
/// watcher. Every variant means the derived routing state can no longer be
/// trusted and the hosting process should exit.
#[derive(Debug, Error)]
pub enum Error {
    /// The Kubernetes client could not be created.
    #[error("failed to create Kubernetes client: {0}")]
    Client(#[from] kube::Error),

    /// The initial list of a resource kind failed.
    #[error("initial {kind} list failed: {source}")]
    InitialList {
        /// Resource kind being watched.
        kind: String,
        /// Underlying watcher error.
        #[source]
        source: watcher::Error,
    },

    /// The watch could not be re-established after repeated failures.
    #[error("{kind} watch failed {attempts} consecutive times: {source}")]
    WatchStalled {
        /// Resource kind being watched.
        kind: String,
        /// Number of consecutive failures observed.
        attempts: u32,
        /// The most recent watcher error.
        #[source]
        source: watcher::Error,
    },

    /// The watch stream ended without a shutdown request.
    #[error("{kind} watcher exited unexpectedly")]
    WatcherExited {
        /// Resource kind being watched.
        kind: String,
    },

    /// The caches did not complete their initial sync in time.
    #[error("caches did not sync within {0:?}")]
    SyncTimeout(Duration),

    /// A watcher task panicked or was cancelled.
    #[error("watcher task failed: {0}")]
    TaskFailed(#[source] JoinError),
}

/// Result type for controller operations.
pub type Result<T> = std::result::Result<T, Error>;
