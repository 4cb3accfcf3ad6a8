use common::{UserId, WorkItemId};
use coordination::CoordinationError;
use domain::{DomainError, ErrorKind};
use ledger::LedgerError;
use thiserror::Error;

/// Errors raised while allocating coupons.
#[derive(Debug, Error)]
pub enum AllocationError {
    /// No template matches the reference.
    #[error("Coupon template not found: {0}")]
    TemplateNotFound(String),

    /// The requesting user does not exist.
    #[error("User not found: {0}")]
    UserNotFound(UserId),

    /// The user already holds a unit of this template.
    #[error("User {user_id} already holds a coupon from '{template}'")]
    DuplicateAllocation { user_id: UserId, template: String },

    /// No unit is left or the template has expired.
    #[error("Coupon template '{0}' is sold out or expired")]
    OutOfStock(String),

    /// A template with the same name already exists.
    #[error("Coupon template '{0}' already exists")]
    TemplateExists(String),

    /// No queued request has this id.
    #[error("Work item not found: {0}")]
    WorkItemNotFound(WorkItemId),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Coordination(#[from] CoordinationError),
}

impl AllocationError {
    /// Classifies this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AllocationError::TemplateNotFound(_)
            | AllocationError::UserNotFound(_)
            | AllocationError::WorkItemNotFound(_) => ErrorKind::NotFound,
            AllocationError::DuplicateAllocation { .. }
            | AllocationError::OutOfStock(_)
            | AllocationError::TemplateExists(_) => ErrorKind::Conflict,
            AllocationError::Domain(e) => e.kind(),
            AllocationError::Ledger(e) => e.kind(),
            AllocationError::Coordination(e) => e.kind(),
        }
    }

    /// Short label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            AllocationError::DuplicateAllocation { .. } => "duplicate",
            AllocationError::OutOfStock(_) => "out_of_stock",
            other => other.kind().as_str(),
        }
    }
}

/// Result type for allocation operations.
pub type Result<T> = std::result::Result<T, AllocationError>;
