//! Error types for microbatch.

use thiserror::Error;

/// Result type alias for microbatch operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for microbatch.
///
/// Every variant can surface through a request's response sink, so the
/// type is `Clone`: a batch-level executor failure is fanned out to each
/// request in the batch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Malformed request rejected at enqueue; never enters the queue.
    #[error("invalid request: {0}")]
    Validation(String),

    /// The target priority level's queue is at capacity.
    #[error("queue for priority level {level} is full ({capacity} entries)")]
    QueueFull {
        /// Priority level that rejected the request.
        level: u32,
        /// Configured capacity of that level.
        capacity: usize,
    },

    /// The request's effective deadline expired before dispatch.
    #[error("request exceeded its queue deadline")]
    Timeout,

    /// Failure propagated from the executor, per-request or batch-wide.
    #[error("executor error: {0}")]
    Executor(String),

    /// The scheduler is tearing down; queued work is drained with this.
    #[error("server is stopping")]
    Shutdown,

    /// Invariant violation; logged and converted to a generic failure.
    #[error("internal error: {0}")]
    Internal(String),
}
