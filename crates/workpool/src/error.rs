//! Typed errors for the pool and the runner.

/// How a single task failed.
///
/// Task errors are routed through the result queue to the owning handle and
/// re-raised from `get` / `next`. They are `Clone` so a failed job can report
/// the same error to every caller that asks.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// The task function panicked while running on a worker.
    #[error("task panicked: {message}")]
    Panic {
        /// Stringified panic payload captured on the worker.
        message: String,
    },
    /// The dispatcher could not hand the task to a worker.
    #[error("task could not be dispatched: {message}")]
    Rejected {
        /// Why the hand-off failed.
        message: String,
    },
    /// A result reached a handle expecting a different result type.
    #[error("task result had an unexpected type")]
    TypeMismatch,
    /// The runtime shut down while the task was still running.
    #[error("task was cancelled before it finished")]
    Cancelled,
}

/// Errors surfaced by [`Pool`](crate::Pool) operations and result handles.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    /// A submission was attempted while the pool is closed or terminated.
    #[error("pool is not running")]
    NotRunning,
    /// `join` was called before `close` or `terminate`.
    #[error("pool is still running")]
    StillRunning,
    /// `successful` was called before the job completed.
    #[error("job is not ready yet")]
    NotReady,
    /// A wait elapsed before the job completed.
    #[error("timed out waiting for a result")]
    Timeout,
    /// The success value was already moved out of this handle.
    #[error("result value was already taken")]
    ResultTaken,
    /// The pool needs at least one worker.
    #[error("pool must have at least one worker")]
    InvalidWorkerCount,
    /// Chunk sizes must be at least 1.
    #[error("chunk size must be at least 1")]
    InvalidChunkSize,
    /// Per-worker task budgets must be at least 1.
    #[error("per-worker task budget must be at least 1")]
    InvalidTaskBudget,
    /// The task itself failed; carries the captured failure.
    #[error(transparent)]
    Task(#[from] TaskError),
}

/// Errors surfaced by the [`runner`](crate::runner) entry points.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// `run` was called while an event loop is already active on this thread.
    #[error("an event loop is already running on this thread")]
    AlreadyRunning,
    /// `spawn` was called without an active runner on this thread.
    #[error("no runner is active on this thread")]
    NoRunner,
    /// The background task was cancelled or panicked before producing a value.
    #[error("background task ended before producing a value")]
    TaskLost,
    /// The event loop could not be created.
    #[error("failed to build the event loop")]
    Build(#[source] std::io::Error),
}
