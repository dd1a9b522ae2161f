use thiserror::Error;

use crate::types::MessageStatus;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Malformed input to the management API (empty phone, unknown status, …).
    #[error("Validation error: {0}")]
    Validation(String),

    /// No scheduled message with the given ID exists in the store.
    #[error("Scheduled message not found: {id}")]
    NotFound { id: i64 },

    /// The requested mutation is not legal for the message's current status.
    #[error("Scheduled message {id} is {status}; operation not allowed")]
    Conflict { id: i64, status: MessageStatus },

    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored row could not be decoded (bad timestamp, unknown status).
    #[error("Corrupt row: {0}")]
    Corrupt(String),

    /// A background delivery task panicked or was cancelled.
    #[error("Delivery task failed: {0}")]
    Task(String),
}

impl SchedulerError {
    /// Short error code string returned to API clients.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::Validation(_) => "VALIDATION_ERROR",
            SchedulerError::NotFound { .. } => "NOT_FOUND",
            SchedulerError::Conflict { .. } => "CONFLICT",
            SchedulerError::Database(_) => "DATABASE_ERROR",
            SchedulerError::Corrupt(_) => "CORRUPT_ROW",
            SchedulerError::Task(_) => "TASK_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Errors returned by a [`MessageSender`](crate::sender::MessageSender).
///
/// The `Display` text is what gets recorded in the `error` column.
#[derive(Debug, Error)]
pub enum SendError {
    /// The provider rejected or failed to deliver the message.
    #[error("send failed: {0}")]
    Failed(String),

    /// The send did not complete within the dispatcher's budget.
    #[error("send timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// No usable provider is configured or reachable.
    #[error("sender unavailable: {0}")]
    Unavailable(String),
}
