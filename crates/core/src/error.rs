use thiserror::Error;

/// Result type alias for scheduler-facing operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to clients, either synchronously from `submit` or as the
/// status on a request's final callback.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The bounded submit queue is full; the transport should answer
    /// RESOURCE_EXHAUSTED and let the client retry.
    #[error("request queue is full")]
    Busy,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The request cannot be scheduled even after preempting everything.
    #[error("out of cache capacity")]
    OutOfCapacity,

    #[error("tokenizer failure: {0}")]
    Tokenizer(String),

    /// The forward pass failed; every sequence in the batch is aborted.
    #[error("engine failure: {0}")]
    Engine(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("scheduler has shut down")]
    Shutdown,
}
