use domain::ErrorKind;
use thiserror::Error;

/// Errors that can occur when interacting with the ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// A row lock could not be acquired before the lock timeout.
    #[error("Lock wait timed out on {0}")]
    LockTimeout(String),

    /// An insert or update collided with a uniqueness constraint.
    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),

    /// An update targeted a row that does not exist.
    #[error("Row not found: {0}")]
    NotFound(String),

    /// A counter update would leave the column's numeric range.
    #[error("Value out of range: {0}")]
    OutOfRange(String),

    /// The store could not serve the request.
    #[error("Ledger unavailable: {0}")]
    Unavailable(String),

    /// A stored row could not be mapped back to a domain value.
    #[error("Corrupted row: {0}")]
    Corrupted(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl LedgerError {
    /// Classifies this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::LockTimeout(_) => ErrorKind::ResourceBusy,
            LedgerError::UniqueViolation(_) => ErrorKind::Conflict,
            LedgerError::NotFound(_) => ErrorKind::NotFound,
            LedgerError::OutOfRange(_) => ErrorKind::Validation,
            _ => ErrorKind::Internal,
        }
    }

    pub fn is_unique_violation(&self) -> bool {
        matches!(self, LedgerError::UniqueViolation(_))
    }
}

/// Result type for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;
