use tallyho_db::DbError;
use tallyho_models::SelectionError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("invalid selection: {0}")]
    InvalidSelection(String),
    #[error("poll {0} is not open for voting")]
    PollNotOpen(i64),
    #[error("poll {0} must be closed before it can be revealed")]
    PollNotClosed(i64),
    #[error("poll {0} has already been revealed")]
    PollAlreadyRevealed(i64),
    #[error("poll {0} has not been revealed")]
    PollNotRevealed(i64),
    #[error("poll {0} not found")]
    PollNotFound(i64),
    #[error("storage error: {0}")]
    Storage(#[from] DbError),
}

/// How a failure should be presented to the person who triggered it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The request broke a rule of the poll lifecycle; retrying will not help.
    BusinessRule,
    /// Something went wrong underneath; the same request may succeed later.
    Storage,
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Storage(_) => ErrorKind::Storage,
            _ => ErrorKind::BusinessRule,
        }
    }

    /// Only storage failures the database reports as contention or I/O are
    /// worth repeating.
    pub fn is_transient(&self) -> bool {
        match self {
            CoreError::Storage(err) => err.is_transient(),
            _ => false,
        }
    }

    /// Machine-readable error code string.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "VALIDATION_ERROR",
            CoreError::InvalidSelection(_) => "INVALID_SELECTION",
            CoreError::PollNotOpen(_) => "POLL_NOT_OPEN",
            CoreError::PollNotClosed(_) => "POLL_NOT_CLOSED",
            CoreError::PollAlreadyRevealed(_) => "POLL_ALREADY_REVEALED",
            CoreError::PollNotRevealed(_) => "POLL_NOT_REVEALED",
            CoreError::PollNotFound(_) => "POLL_NOT_FOUND",
            CoreError::Storage(_) => "STORAGE_ERROR",
        }
    }

    /// Text safe to show to a participant. Storage details stay in the logs.
    pub fn user_message(&self) -> String {
        match self.kind() {
            ErrorKind::BusinessRule => self.to_string(),
            ErrorKind::Storage => "something went wrong, please try again".to_string(),
        }
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(e: sqlx::Error) -> Self {
        CoreError::Storage(DbError::Sqlx(e))
    }
}

impl From<SelectionError> for CoreError {
    fn from(e: SelectionError) -> Self {
        CoreError::InvalidSelection(e.to_string())
    }
}
