use domain::ErrorKind;
use ledger::LedgerError;
use thiserror::Error;

/// Errors raised by the sales ranking.
#[derive(Debug, Error)]
pub enum RankingError {
    /// The requested ranking size is not usable.
    #[error("Ranking limit must be greater than 0")]
    InvalidLimit,

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl RankingError {
    /// Classifies this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RankingError::InvalidLimit => ErrorKind::Validation,
            RankingError::Ledger(e) => e.kind(),
        }
    }
}

/// Result type for ranking operations.
pub type Result<T> = std::result::Result<T, RankingError>;
