//! Pool error taxonomy

use thiserror::Error;

/// Errors returned by pool construction and task admission.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A fixed-function pool was asked for a negative capacity.
    #[error("invalid size for pool")]
    InvalidPoolSize,

    /// A pre-allocated pool cannot have unbounded capacity.
    #[error("cannot pre-allocate a pool with negative capacity")]
    InvalidPreAllocSize,

    /// The pool has been released; no new tasks are admitted.
    #[error("this pool has been closed")]
    PoolClosed,

    /// No worker is available and the pool is nonblocking, or the
    /// blocking-waiter cap has been reached.
    #[error("too many tasks blocked on submit, or the pool is nonblocking")]
    PoolOverload,
}

pub type Result<T> = std::result::Result<T, Error>;
