use thiserror::Error;

use crate::common::error::DwError::Generic;

/// Errors surfaced to the host scheduler from facade operations.
///
/// Limit and capacity conditions are deliberately *not* routed through this
/// type on the scheduling path; the planner reports them as admission
/// verdicts so that the job stays pending and is reconsidered on the next
/// tick. They appear here only when an operation must answer synchronously
/// (e.g. submit-time validation).
#[derive(Debug, Error)]
pub enum DwError {
    #[error("Invalid burst buffer request: {0}")]
    InvalidRequest(String),
    #[error("Burst buffer permission denied: {0}")]
    PermissionDenied(String),
    #[error("Burst buffer limit exceeded: {0}")]
    LimitExceeded(String),
    #[error("Insufficient burst buffer capacity: {0}")]
    NoCapacity(String),
    #[error("DataWarp {function} failed: {message}")]
    External { function: String, message: String },
    #[error("Burst buffer state snapshot I/O error: {0}")]
    SnapshotIo(#[from] std::io::Error),
    #[error("DataWarp {0} timed out")]
    Timeout(String),
    #[error("Error: {0}")]
    Generic(String),
}

impl DwError {
    pub fn external(function: &str, message: impl Into<String>) -> Self {
        DwError::External {
            function: function.to_string(),
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for DwError {
    fn from(error: anyhow::Error) -> Self {
        Generic(error.to_string())
    }
}

impl From<String> for DwError {
    fn from(e: String) -> Self {
        Generic(e)
    }
}

impl From<serde_json::Error> for DwError {
    fn from(e: serde_json::Error) -> Self {
        Generic(format!("JSON error: {e}"))
    }
}

/// Result type for operations against the external subsystem; errors are
/// contextual strings collected for the job's state description.
pub type DwOpResult<T> = anyhow::Result<T>;
