//! Error types for the transcoding pool

/// Result type for pool operations
pub type Result<T> = std::result::Result<T, PoolError>;

/// Coarse classification of a [`PoolError`].
///
/// Callers use this to pick a retry policy: bad input is never worth
/// resubmitting, transient failures usually are, and a closed pool never
/// accepts work again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Options or configuration were rejected before any work was queued
    Validation,
    /// The codec reported a failure for this input
    Codec,
    /// The execution unit died while running the task
    WorkerCrash,
    /// The pool is closed or abandoned the task while closing
    PoolClosed,
    /// The task exceeded its deadline
    Timeout,
    /// The caller cancelled the task
    Cancelled,
}

impl ErrorKind {
    /// Whether resubmitting the same request may succeed
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::WorkerCrash | ErrorKind::Timeout)
    }

    /// Whether the failure was caused by the request itself
    pub fn is_caller_fault(self) -> bool {
        matches!(self, ErrorKind::Validation | ErrorKind::Codec)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Codec => "codec",
            ErrorKind::WorkerCrash => "worker-crash",
            ErrorKind::PoolClosed => "pool-closed",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Errors that can occur in the transcoding pool
///
/// The type is `Clone` so that one task outcome can be handed to every
/// observer of a [`TaskHandle`](crate::TaskHandle).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum PoolError {
    /// Conversion options were rejected at submission
    #[error("Invalid option '{field}': {message}")]
    Validation {
        /// Offending option name
        field: String,
        /// Error message
        message: String,
    },

    /// The codec failed to convert the input
    #[error("Codec failed (task_id: {task_id}): {message}")]
    Codec {
        /// ID of the failed task
        task_id: u64,
        /// Message reported by the codec
        message: String,
    },

    /// An execution unit died while running a task
    #[error("Execution unit #{unit_id} crashed: {message}")]
    WorkerCrash {
        /// ID of the crashed unit
        unit_id: usize,
        /// Panic or exit message
        message: String,
    },

    /// The pool is closed
    #[error("Pool closed: {reason}")]
    PoolClosed {
        /// Why the task was refused or abandoned
        reason: String,
    },

    /// Task deadline elapsed
    #[error("Task timeout after {timeout_ms}ms (task_id: {task_id})")]
    Timeout {
        /// ID of the timed out task
        task_id: u64,
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// Task was cancelled by the caller
    #[error("Task cancelled (task_id: {task_id}): {reason}")]
    Cancelled {
        /// ID of the cancelled task
        task_id: u64,
        /// Reason for cancellation
        reason: String,
    },

    /// Invalid pool configuration
    #[error("Invalid configuration for '{parameter}': {message}")]
    InvalidConfig {
        /// Configuration parameter name
        parameter: String,
        /// Error message
        message: String,
    },

    /// The OS refused to start an execution unit thread
    #[error("Failed to spawn execution unit #{unit_id}: {message}")]
    Spawn {
        /// ID of the unit that failed to spawn
        unit_id: usize,
        /// Error message
        message: String,
    },
}

impl PoolError {
    /// Create a validation error
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        PoolError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a codec error
    pub fn codec(task_id: u64, message: impl Into<String>) -> Self {
        PoolError::Codec {
            task_id,
            message: message.into(),
        }
    }

    /// Create a worker crash error
    pub fn worker_crash(unit_id: usize, message: impl Into<String>) -> Self {
        PoolError::WorkerCrash {
            unit_id,
            message: message.into(),
        }
    }

    /// Create a pool closed error
    pub fn pool_closed(reason: impl Into<String>) -> Self {
        PoolError::PoolClosed {
            reason: reason.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(task_id: u64, timeout_ms: u64) -> Self {
        PoolError::Timeout {
            task_id,
            timeout_ms,
        }
    }

    /// Create a cancelled error
    pub fn cancelled(task_id: u64, reason: impl Into<String>) -> Self {
        PoolError::Cancelled {
            task_id,
            reason: reason.into(),
        }
    }

    /// Create an invalid config error
    pub fn invalid_config(parameter: impl Into<String>, message: impl Into<String>) -> Self {
        PoolError::InvalidConfig {
            parameter: parameter.into(),
            message: message.into(),
        }
    }

    /// Create a spawn error
    pub fn spawn(unit_id: usize, message: impl Into<String>) -> Self {
        PoolError::Spawn {
            unit_id,
            message: message.into(),
        }
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            PoolError::Validation { .. } | PoolError::InvalidConfig { .. } => ErrorKind::Validation,
            PoolError::Codec { .. } => ErrorKind::Codec,
            PoolError::WorkerCrash { .. } | PoolError::Spawn { .. } => ErrorKind::WorkerCrash,
            PoolError::PoolClosed { .. } => ErrorKind::PoolClosed,
            PoolError::Timeout { .. } => ErrorKind::Timeout,
            PoolError::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }

    /// Shortcut for `self.kind().is_retryable()`
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}
