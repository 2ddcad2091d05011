//! Error types for borrowing, dialing, and using pooled connections.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors surfaced to callers of the pool and node APIs.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Hard-limit mode, capacity reached, nothing came back within the grace interval.
    #[error("connection pool exhausted for node {node} (capacity {capacity}, waited {grace:?})")]
    Exhausted {
        node: String,
        capacity: usize,
        grace: Duration,
    },

    #[error("failed to dial node {node}: {source}")]
    DialFailed {
        node: String,
        #[source]
        source: DialError,
    },

    #[error("connection {id} is dead")]
    ConnectionDead { id: u64 },

    #[error("connection {id} i/o error: {source}")]
    Io {
        id: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("node {node} is closed")]
    Closed { node: String },

    /// The reaper could not take the pool lock without waiting.
    #[error("pool for node {node} is busy")]
    Contended { node: String },
}

/// Errors produced by a [`ConnectionFactory`](crate::ConnectionFactory).
#[derive(Debug, Error)]
pub enum DialError {
    #[error("dial timed out after {0:?}")]
    Timeout(Duration),

    #[error("address resolution failed for {address}: {reason}")]
    Resolve { address: String, reason: String },

    #[error("tcp connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("tls setup: {0}")]
    Tls(String),

    /// The blocking dial task panicked or was cancelled by the runtime.
    #[error("dial task aborted: {0}")]
    Aborted(String),
}

impl PoolError {
    /// True for errors the caller may reasonably retry after backing off.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PoolError::Exhausted { .. } | PoolError::DialFailed { .. } | PoolError::Contended { .. }
        )
    }
}
