//! Error types for the worker kernel.

use thiserror::Error;

/// Errors surfaced by the pool, engine, and instance lifecycle.
#[derive(Debug, Error)]
pub enum KernelError {
    /// A handler name was empty where a non-empty name was required.
    #[error("handler name must not be empty")]
    EmptyHandlerName,

    /// At least one handler must be registered before an instance can be loaded.
    #[error("instance has no registered handlers")]
    NoHandlers,

    /// The event payload handed to a handler was not valid JSON.
    #[error("invalid JSON event payload: {0}")]
    InvalidEvent(#[source] serde_json::Error),

    /// No instance was available and the pool could not be rebuilt.
    #[error("pool exhausted for key '{0}'")]
    PoolExhausted(String),

    /// The pool for this key has been marked invalid following a timeout or panic.
    #[error("pool for key '{0}' is invalid and is being rebuilt")]
    PoolInvalid(String),

    /// An execution monitor failed to initialize; the handler was never run.
    #[error("execution monitor failed to start: {0}")]
    MonitorFailed(String),

    /// The handler did not return within its configured wall-clock budget.
    #[error("handler execution timed out")]
    Timeout,

    /// The request-state record for this id was not found.
    #[error("no request state registered for request '{0}'")]
    UnknownRequest(String),

    /// Wraps an I/O failure (reading worker source, module files, etc).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Catch-all for errors bubbling up from the JS runtime or host bindings.
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// The result type used throughout the kernel crate.
pub type Result<T> = std::result::Result<T, KernelError>;

/// Construct a [`KernelError::Other`] from a format string, the way
/// `hyperlight_host::new_error!` builds a `HyperlightError::Error`.
#[macro_export]
macro_rules! new_error {
    ($($arg:tt)*) => {
        $crate::error::KernelError::Other(::anyhow::anyhow!($($arg)*))
    };
}
