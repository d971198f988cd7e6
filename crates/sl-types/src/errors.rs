use thiserror::Error;

/// Main error type for the Streamline system
#[derive(Error, Debug)]
pub enum SlError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Provisioning error: {0}")]
    Provision(#[from] ProvisionError),

    #[error("Trial error: {0}")]
    Trial(#[from] TrialError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl SlError {
    /// True when the error is a blob store miss (the object simply does not exist).
    pub fn is_not_found(&self) -> bool {
        matches!(self, SlError::Store(StoreError::NotFound { .. }))
    }
}

/// Blob store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Object not found: {path}")]
    NotFound { path: String },

    #[error("Object unreadable: {path}, error: {message}")]
    Unreadable { path: String, message: String },

    #[error("Write failed: {path}, error: {message}")]
    WriteFailed { path: String, message: String },

    #[error("Delete failed for prefix {prefix}: {message}")]
    DeleteFailed { prefix: String, message: String },

    #[error("Invalid object path: {path}")]
    InvalidPath { path: String },
}

/// Fleet provisioning errors
#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("Instance creation rejected in zone {zone}: {message}")]
    Rejected { zone: String, message: String },

    #[error("Operation {operation} failed in zone {zone}: {message}")]
    OperationFailed {
        operation: String,
        zone: String,
        message: String,
    },
}

/// Trial execution errors
#[derive(Error, Debug)]
pub enum TrialError {
    #[error("Trial execution failed: {message}")]
    ExecutionFailed { message: String },

    #[error("Trial could not be started: {message}")]
    SpawnFailed { message: String },

    #[error("Trial produced invalid output: {message}")]
    InvalidOutput { message: String },

    #[error("Trial checkpoint error: {message}")]
    Checkpoint { message: String },
}

/// Persisted worker state errors
#[derive(Error, Debug)]
pub enum StateError {
    #[error("Persisted state missing: {path}")]
    Missing { path: String },

    #[error("Persisted state malformed: {path}, error: {message}")]
    Malformed { path: String, message: String },

    #[error("Persisted state inconsistent: {message}")]
    Inconsistent { message: String },

    #[error("Iteration overflow: current_iter {current_iter} already at max_iter {max_iter}")]
    IterationOverflow { current_iter: usize, max_iter: usize },
}

/// Result type alias for Streamline operations
pub type SlResult<T> = Result<T, SlError>;

/// Macro for creating validation errors
#[macro_export]
macro_rules! validation_error {
    ($($arg:tt)*) => {
        $crate::SlError::Validation(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::SlError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::SlError::Config(format!($($arg)*))
    };
}
