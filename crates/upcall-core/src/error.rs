use std::collections::TryReserveError;

use thiserror::Error;

/// Why an operation did not produce a response.
///
/// Every variant reaches only the submitting caller. The service agent never
/// sees these: a stray completion is reported to it as a plain `false`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("engine is shutting down")]
    Shutdown,

    #[error("pending queue is full (capacity={0})")]
    QueueFull(usize),

    #[error("operation timed out")]
    TimedOut,

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation purged by engine teardown")]
    Purged,

    #[error("service agent reported failure: {0}")]
    Service(String),

    #[error("operation has not reached a terminal state")]
    NotFinished,

    #[error("operation result already consumed")]
    ResultConsumed,
}

/// Failures that keep the engine from starting.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("hash_table_size must be non-zero")]
    InvalidTableSize,

    #[error("failed to allocate {buckets} in-progress buckets")]
    TableAllocation {
        buckets: usize,
        #[source]
        source: TryReserveError,
    },

    #[error("invalid config: {0}")]
    InvalidConfig(String),
}
