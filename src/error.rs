//! Cross-subsystem error taxonomy.
//!
//! Every subsystem error enum below maps onto [`ErrorKind`] via `kind()` so
//! the worker loop (see `crate::workers`) can dispatch on policy ("retry",
//! "fail hard", "stop the pipeline") without matching concrete error types
//! from every subsystem.

use std::fmt;

/// Policy-relevant classification of an error, independent of which
/// subsystem raised it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retry with backoff up to `max_attempts`.
    Transient,
    /// Plan/allocation infeasible; shrink and retry.
    InsufficientVram,
    /// Backend crashed; retry, evict instance after repeated failures.
    BackendError,
    /// Malformed input; fail the entry without retrying.
    BadInput,
    /// Work was cancelled by a Pause/Stop transition.
    Cancelled,
    /// Unrecoverable; the owning pipeline must stop.
    Fatal,
}

/// Errors raised by the [`crate::catalog::CatalogStore`] trait.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CatalogError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("transient catalog error: {0}")]
    Transient(String),
    #[error("fatal catalog error: {0}")]
    Fatal(String),
}

impl CatalogError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CatalogError::NotFound(_) => ErrorKind::BadInput,
            CatalogError::Conflict(_) => ErrorKind::Transient,
            CatalogError::Transient(_) => ErrorKind::Transient,
            CatalogError::Fatal(_) => ErrorKind::Fatal,
        }
    }
}

/// Errors raised by [`crate::engine`] adapters.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("insufficient vram: requested {requested_mb} MB, {available_mb} MB available on device {device}")]
    InsufficientVram {
        device: usize,
        requested_mb: u64,
        available_mb: u64,
    },
    #[error("model missing: {0}")]
    ModelMissing(String),
    #[error("backend error: {0}")]
    BackendError(String),
    #[error("bad input: {0}")]
    BadInput(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InsufficientVram { .. } => ErrorKind::InsufficientVram,
            EngineError::ModelMissing(_) => ErrorKind::Fatal,
            EngineError::BackendError(_) => ErrorKind::BackendError,
            EngineError::BadInput(_) => ErrorKind::BadInput,
        }
    }
}

/// Errors raised by [`crate::pool::ModelPool`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum PoolError {
    #[error("no free instance for pipeline within timeout")]
    AcquireTimeout,
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("pool is shutting down")]
    ShuttingDown,
}

impl PoolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PoolError::AcquireTimeout => ErrorKind::Transient,
            PoolError::Engine(e) => e.kind(),
            PoolError::ShuttingDown => ErrorKind::Cancelled,
        }
    }
}

/// Top-level orchestrator error, composing every subsystem's error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("cancelled")]
    Cancelled,
    #[error("configuration error: {0}")]
    Config(String),
}

impl OrchestratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::Catalog(e) => e.kind(),
            OrchestratorError::Engine(e) => e.kind(),
            OrchestratorError::Pool(e) => e.kind(),
            OrchestratorError::Cancelled => ErrorKind::Cancelled,
            OrchestratorError::Config(_) => ErrorKind::Fatal,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Transient => "transient",
            ErrorKind::InsufficientVram => "insufficient_vram",
            ErrorKind::BackendError => "backend_error",
            ErrorKind::BadInput => "bad_input",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Fatal => "fatal",
        };
        write!(f, "{s}")
    }
}
