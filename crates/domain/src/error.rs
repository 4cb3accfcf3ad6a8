//! Domain error types and the shared error classification.

use common::{Money, ProductId};
use thiserror::Error;

use crate::work_item::WorkStatus;

/// Coarse classification shared by every error type in the workspace.
///
/// The HTTP layer maps each kind to a status code, and callers use it to
/// decide whether a retry makes sense.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad input. The caller must fix the request.
    Validation,
    /// A referenced entity does not exist.
    NotFound,
    /// A business rule rejected the request.
    Conflict,
    /// A lock could not be acquired in time. Safe to retry.
    ResourceBusy,
    /// Unexpected datastore or coordinator failure.
    Internal,
}

impl ErrorKind {
    /// Returns the kind name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::ResourceBusy => "resource_busy",
            ErrorKind::Internal => "internal",
        }
    }

    /// Returns true if the caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::ResourceBusy)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Business rule violations raised by the domain entities.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    /// Input failed validation.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The coupon has already been redeemed.
    #[error("Coupon has already been used")]
    CouponAlreadyUsed,

    /// The coupon's template has expired.
    #[error("Coupon has expired")]
    CouponExpired,

    /// The order total is below the coupon's minimum.
    #[error("Order total {total} is below the coupon minimum of {minimum}")]
    BelowMinimumOrder { minimum: Money, total: Money },

    /// The order has already been cancelled.
    #[error("Order {0} is already cancelled")]
    AlreadyCancelled(String),

    /// Not enough stock to remove the requested quantity.
    #[error("Insufficient stock for product {product_id}: requested {requested}, available {available}")]
    InsufficientStock {
        product_id: ProductId,
        requested: i64,
        available: i64,
    },

    /// Not enough balance to withdraw the requested amount.
    #[error("Insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance { requested: Money, available: Money },

    /// A work item cannot move from its current status.
    #[error("Invalid work item transition: cannot {action} from {current}")]
    InvalidTransition {
        current: WorkStatus,
        action: &'static str,
    },
}

impl DomainError {
    /// Classifies this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DomainError::Validation(_) => ErrorKind::Validation,
            _ => ErrorKind::Conflict,
        }
    }

    /// Returns true if the error rejects a coupon for the current order.
    pub fn is_coupon_rejection(&self) -> bool {
        matches!(
            self,
            DomainError::CouponAlreadyUsed
                | DomainError::CouponExpired
                | DomainError::BelowMinimumOrder { .. }
        )
    }
}

pub(crate) fn validation(message: impl Into<String>) -> DomainError {
    DomainError::Validation(message.into())
}
