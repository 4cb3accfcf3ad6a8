use domain::ErrorKind;
use thiserror::Error;

/// Errors raised by locks and waiting lists.
#[derive(Debug, Error)]
pub enum CoordinationError {
    /// The lock was held by someone else for the whole wait window.
    #[error("Could not acquire lock '{key}' within {waited_ms}ms")]
    LockAcquisitionFailed { key: String, waited_ms: u64 },

    /// The lease expired or was taken over before release.
    #[error("Lock '{key}' was no longer held by this holder at release")]
    LockLost { key: String },

    /// The member already received a unit for this key.
    #[error("'{member}' has already been issued from '{key}'")]
    AlreadyIssued { key: String, member: String },

    /// Redis command or connection failure.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl CoordinationError {
    /// Classifies this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoordinationError::LockAcquisitionFailed { .. } => ErrorKind::ResourceBusy,
            CoordinationError::AlreadyIssued { .. } => ErrorKind::Conflict,
            CoordinationError::LockLost { .. } | CoordinationError::Redis(_) => {
                ErrorKind::Internal
            }
        }
    }
}

/// Result type for coordination operations.
pub type Result<T> = std::result::Result<T, CoordinationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        let busy = CoordinationError::LockAcquisitionFailed {
            key: "order:1".into(),
            waited_ms: 10,
        };
        assert_eq!(busy.kind(), ErrorKind::ResourceBusy);
        assert!(busy.kind().is_retryable());

        let issued = CoordinationError::AlreadyIssued {
            key: "FLASH".into(),
            member: "7".into(),
        };
        assert_eq!(issued.kind(), ErrorKind::Conflict);
    }
}
